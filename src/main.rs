// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/main.rs - 服务主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use std::sync::Arc;

use anyhow::{Result, anyhow};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};

use shanan_pcb::{
  executor::default_workers,
  input::ValidationRules,
  model::{load_detector, parse_model_location},
  pipeline::{Pipeline, PipelineConfig},
  report::ReportGenerator,
  server::{AppState, ServiceInfo, router, shutdown_signal},
};

use args::Args;

#[cfg(feature = "report_openai")]
fn create_reporter(args: &Args) -> Result<Option<Arc<dyn ReportGenerator>>> {
  use shanan_pcb::report::{OpenAiReportGenerator, RagReportGenerator};

  let Some(api_key) = args.openai_api_key.as_deref().filter(|key| !key.is_empty()) else {
    warn!("未设置 OPENAI_API_KEY，缺陷报告功能不可用");
    return Ok(None);
  };

  if let Some(store) = args.vector_store_id.as_deref().filter(|id| !id.is_empty()) {
    let mut generator = RagReportGenerator::new(
      api_key,
      args.report_model.as_str(),
      store,
      args.openai_base_url.as_deref(),
    )?;
    if let Some(max_results) = args.rag_max_results {
      generator = generator.with_max_results(max_results);
    }
    return Ok(Some(Arc::new(generator)));
  }

  let generator = OpenAiReportGenerator::new(
    api_key,
    args.report_model.as_str(),
    args.openai_base_url.as_deref(),
  )?;
  Ok(Some(Arc::new(generator)))
}

#[cfg(not(feature = "report_openai"))]
fn create_reporter(_args: &Args) -> Result<Option<Arc<dyn ReportGenerator>>> {
  warn!("未启用报告生成功能");
  Ok(None)
}

#[tokio::main]
async fn main() -> Result<()> {
  let args = Args::parse();

  tracing_subscriber::fmt()
    .with_max_level(args.log_level)
    .init();

  info!("Shanan PCB 缺陷检测服务");
  info!("模型位置: {}", args.model);
  info!("监听地址: {}", args.listen);
  info!("文件大小上限: {} 字节", args.max_file_size);

  // 模型加载失败时直接退出
  let model_url = parse_model_location(&args.model).map_err(|e| anyhow!(e))?;
  info!("正在加载模型...");
  let detector = load_detector(&model_url)?;
  info!("模型加载完成: {}", detector.describe());

  let rules = ValidationRules::default()
    .with_max_file_size(args.max_file_size)
    .with_extensions(&args.allowed_extensions)
    .with_mime_types(&args.allowed_mime_types);
  let config = PipelineConfig {
    rules,
    staging_dir: args.staging_dir.clone(),
    cache_capacity: args.cache_capacity,
    workers: args.workers.unwrap_or_else(default_workers),
    font: args.font.clone(),
  };
  let pipeline = Arc::new(Pipeline::new(detector, config)?);

  let info = ServiceInfo::new(args.model.as_str())
    .with_api_token(args.api_token.clone())
    .with_cors_origins(args.cors_origins.clone());
  let mut state = AppState::new(pipeline.clone(), info);
  if let Some(reporter) = create_reporter(&args)? {
    info!("报告生成服务: {}", reporter.describe());
    state = state.with_reporter(reporter);
  }

  let app = router(state);
  let listener = TcpListener::bind(args.listen).await?;
  info!("服务已启动: http://{}", listener.local_addr()?);

  axum::serve(listener, app)
    .with_graceful_shutdown(shutdown_signal()?)
    .await?;

  pipeline.executor().close();
  let stats = pipeline.stats();
  info!(
    "服务已停止，共处理 {} 个请求 (成功 {}，失败 {})",
    stats.total_requests, stats.completed, stats.failed
  );
  Ok(())
}
