// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// tests/common/mod.rs - 集成测试公共工具
//
// 本文件根据 Apache 许可证第 2.0 版（以下简称“许可证”）授权使用；
// 除非遵守该许可证条款，否则您不得使用本文件。
// 您可通过以下网址获取许可证副本：
// http://www.apache.org/licenses/LICENSE-2.0
// 除非适用法律要求或书面同意，根据本许可协议分发的软件均按“原样”提供，
// 不附带任何形式的明示或暗示的保证或条件。
// 有关许可权限与限制的具体条款，请参阅本许可协议。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, Wareless Group

#![allow(dead_code)]

use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use image::{ImageFormat, Rgb, RgbImage};

use shanan_pcb::frame::DecodedImage;
use shanan_pcb::model::{DetectItem, DetectResult, Detector, LabelTable, ModelError};
use shanan_pcb::pipeline::{Pipeline, PipelineConfig};

/// 按脚本返回结果并记录调用次数的检测器
pub struct ScriptedDetector {
  items: Vec<DetectItem>,
  labels: LabelTable,
  delay: Duration,
  /// 只对该宽度的图像延迟
  slow_width: Option<u32>,
  fail: bool,
  calls: AtomicUsize,
}

impl ScriptedDetector {
  pub fn returning(items: Vec<DetectItem>) -> Self {
    Self {
      items,
      labels: LabelTable::pcb_defects(),
      delay: Duration::ZERO,
      slow_width: None,
      fail: false,
      calls: AtomicUsize::new(0),
    }
  }

  pub fn empty() -> Self {
    Self::returning(Vec::new())
  }

  pub fn failing() -> Self {
    Self {
      fail: true,
      ..Self::empty()
    }
  }

  pub fn with_delay(mut self, delay: Duration) -> Self {
    self.delay = delay;
    self
  }

  pub fn slow_for_width(mut self, width: u32, delay: Duration) -> Self {
    self.delay = delay;
    self.slow_width = Some(width);
    self
  }

  pub fn calls(&self) -> usize {
    self.calls.load(Ordering::SeqCst)
  }
}

impl Detector for ScriptedDetector {
  fn predict(&self, image: &DecodedImage) -> Result<DetectResult, ModelError> {
    self.calls.fetch_add(1, Ordering::SeqCst);
    let slow = self.slow_width.is_none_or(|width| width == image.width());
    if slow && !self.delay.is_zero() {
      std::thread::sleep(self.delay);
    }
    if self.fail {
      return Err(ModelError::RuntimeError("scripted failure".to_string()));
    }
    Ok(DetectResult::from(self.items.clone()))
  }

  fn labels(&self) -> &LabelTable {
    &self.labels
  }

  fn describe(&self) -> String {
    "scripted".to_string()
  }
}

pub fn item(class_id: u32, score: f32, bbox: [f32; 4]) -> DetectItem {
  DetectItem {
    class_id,
    score,
    bbox,
  }
}

pub fn png(width: u32, height: u32, color: [u8; 3]) -> Vec<u8> {
  let image = RgbImage::from_pixel(width, height, Rgb(color));
  let mut buffer = Cursor::new(Vec::new());
  image.write_to(&mut buffer, ImageFormat::Png).unwrap();
  buffer.into_inner()
}

pub fn pipeline(detector: Arc<ScriptedDetector>, staging: &Path) -> Pipeline {
  pipeline_with_capacity(detector, staging, 8)
}

pub fn pipeline_with_capacity(
  detector: Arc<ScriptedDetector>,
  staging: &Path,
  cache_capacity: usize,
) -> Pipeline {
  let config = PipelineConfig {
    staging_dir: Some(staging.to_path_buf()),
    cache_capacity,
    workers: 2,
    ..PipelineConfig::default()
  };
  Pipeline::new(detector, config).unwrap()
}

pub fn staged_files(dir: &Path) -> usize {
  std::fs::read_dir(dir).unwrap().count()
}
