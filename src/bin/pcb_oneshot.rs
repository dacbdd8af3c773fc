// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/bin/pcb_oneshot.rs - 单张图像检测
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::Parser;
use tracing::info;

use shanan_pcb::{
  input::UploadDescriptor,
  model::{load_detector, parse_model_location},
  output::write_detections,
  pipeline::{OutputMode, Pipeline, PipelineConfig},
};

/// Shanan PCB 单张图像检测
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型位置，文件路径或 URL
  #[arg(long, value_name = "MODEL")]
  pub model: String,
  /// 输入图像
  #[arg(long, value_name = "IMAGE")]
  pub input: PathBuf,
  /// 标注图像输出路径
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<PathBuf>,
  /// 检测结果 JSON 输出路径
  #[arg(long, value_name = "JSON")]
  pub json: Option<PathBuf>,
  /// 标注字体（TrueType），未指定时使用内置字体
  #[arg(long, value_name = "FILE")]
  pub font: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  info!("模型位置: {}", args.model);
  info!("输入图像: {}", args.input.display());

  let model_url = parse_model_location(&args.model).map_err(|e| anyhow!(e))?;
  let detector = load_detector(&model_url)?;
  let config = PipelineConfig {
    font: args.font.clone(),
    ..PipelineConfig::default()
  };
  let pipeline = Arc::new(Pipeline::new(detector, config)?);

  let file = tokio::fs::File::open(&args.input).await?;
  let size = file.metadata().await?.len();
  let mut upload = UploadDescriptor::new(file, size);
  if let Some(name) = args.input.file_name() {
    upload = upload.with_filename(name.to_string_lossy());
  }
  let mime = mime_for(&args.input);
  upload = upload.with_content_type(mime);

  let mode = if args.output.is_some() {
    OutputMode::Annotated
  } else {
    OutputMode::Detections
  };

  info!("开始推理...");
  let output = pipeline.run(upload, mode).await?;
  info!(
    "推理完成，耗时: {:.2} ms，检测到 {} 个缺陷",
    output.processing_time_ms(),
    output.detections.len()
  );

  for detection in output.detections.iter() {
    let [x1, y1, x2, y2] = detection.bounding_box;
    println!(
      "{}: {:.2} at ({:.0}, {:.0}, {:.0}, {:.0})",
      detection.class_name, detection.confidence, x1, y1, x2, y2
    );
  }

  if let (Some(path), Some(annotated)) = (&args.output, &output.annotated) {
    annotated.save(path)?;
    info!("标注图像已保存: {}", path.display());
  }
  if let Some(path) = &args.json {
    write_detections(&output.detections, path)?;
    info!("检测结果已保存: {}", path.display());
  }

  Ok(())
}

/// 按扩展名推断 MIME 类型，与服务端的校验规则一致
fn mime_for(path: &std::path::Path) -> &'static str {
  let ext = path
    .extension()
    .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
    .unwrap_or_default();
  match ext.as_str() {
    "png" => "image/png",
    "bmp" => "image/bmp",
    "tif" | "tiff" => "image/tiff",
    _ => "image/jpeg",
  }
}
