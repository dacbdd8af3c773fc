// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/executor.rs - 推理执行器
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

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

use crate::frame::DecodedImage;
use crate::model::{DetectItem, DetectResult, Detection, DetectionSet, Detector, LabelTable};

/// 推理错误，会原样分发给合并等待的请求，因此只携带文本
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
  #[error("模型推理失败: {0}")]
  ModelFailure(String),
  #[error("类别 id {class_id} 超出类别表范围 (共 {classes} 类)")]
  UnknownClass { class_id: u32, classes: usize },
  #[error("推理任务异常终止: {0}")]
  Aborted(String),
  #[error("推理执行器已关闭")]
  Closed,
}

/// 可用计算资源对应的默认工作线程数
pub fn default_workers() -> usize {
  std::thread::available_parallelism()
    .map(NonZeroUsize::get)
    .unwrap_or(1)
}

/// 在受限的阻塞线程池上运行检测器
pub struct InferenceExecutor {
  detector: Arc<dyn Detector>,
  permits: Arc<Semaphore>,
  workers: usize,
  dropped_boxes: AtomicU64,
}

impl InferenceExecutor {
  /// 工作线程数不超过检测器可同时执行的推理数
  pub fn new(detector: Arc<dyn Detector>, workers: usize) -> Self {
    let limit = detector.max_concurrency().max(1);
    let workers = workers.clamp(1, limit);
    if workers == limit {
      debug!("检测器最多同时执行 {} 次推理", limit);
    }
    debug!("推理执行器工作线程数: {}", workers);
    Self {
      detector,
      permits: Arc::new(Semaphore::new(workers)),
      workers,
      dropped_boxes: AtomicU64::new(0),
    }
  }

  /// 是否仍接受推理请求
  pub fn is_available(&self) -> bool {
    !self.permits.is_closed()
  }

  /// 停止接受新的推理请求，已在执行的推理不受影响
  pub fn close(&self) {
    if self.is_available() {
      info!("推理执行器已关闭");
      self.permits.close();
    }
  }

  /// 截断后退化而被丢弃的检测框总数
  pub fn dropped_boxes(&self) -> u64 {
    self.dropped_boxes.load(Ordering::Relaxed)
  }

  pub fn detector(&self) -> &Arc<dyn Detector> {
    &self.detector
  }

  pub fn workers(&self) -> usize {
    self.workers
  }

  /// 执行一次推理
  ///
  /// 前向计算在阻塞线程上完成，调用方只异步等待结果。
  pub async fn infer(&self, image: Arc<DecodedImage>) -> Result<DetectionSet, InferenceError> {
    let permit = self
      .permits
      .clone()
      .acquire_owned()
      .await
      .map_err(|_| InferenceError::Closed)?;

    let (width, height) = (image.width(), image.height());
    let detector = self.detector.clone();
    let raw = tokio::task::spawn_blocking(move || {
      let _permit = permit;
      detector.predict(&image)
    })
    .await
    .map_err(|e| {
      error!("推理任务异常终止: {}", e);
      InferenceError::Aborted(e.to_string())
    })?
    .map_err(|e| {
      error!("模型推理失败: {}", e);
      InferenceError::ModelFailure(e.to_string())
    })?;

    let reported = raw.items.len();
    let detections = to_detection_set(raw, self.detector.labels(), width, height)?;
    let dropped = reported - detections.len();
    if dropped > 0 {
      warn!("模型输出 {} 个检测框，丢弃 {} 个无效框", reported, dropped);
      self.dropped_boxes.fetch_add(dropped as u64, Ordering::Relaxed);
    }
    Ok(detections)
  }
}

/// 将模型原始输出转换为检测结果
///
/// 坐标截断到 `[0, width] x [0, height]`，截断后退化的框被丢弃。
pub fn to_detection_set(
  raw: DetectResult,
  labels: &LabelTable,
  width: u32,
  height: u32,
) -> Result<DetectionSet, InferenceError> {
  let (w, h) = (width as f32, height as f32);
  let mut detections = Vec::with_capacity(raw.items.len());

  for DetectItem {
    class_id,
    score,
    bbox,
  } in raw.items.iter()
  {
    let class_name = labels.get(*class_id).ok_or_else(|| {
      error!("类别 id {} 超出类别表范围", class_id);
      InferenceError::UnknownClass {
        class_id: *class_id,
        classes: labels.len(),
      }
    })?;

    let x1 = bbox[0].clamp(0.0, w);
    let y1 = bbox[1].clamp(0.0, h);
    let x2 = bbox[2].clamp(0.0, w);
    let y2 = bbox[3].clamp(0.0, h);
    if !(x1 < x2 && y1 < y2) || !score.is_finite() {
      warn!("丢弃无效检测框: {:?} ({})", bbox, score);
      continue;
    }

    detections.push(Detection {
      bounding_box: [x1, y1, x2, y2],
      confidence: score.clamp(0.0, 1.0),
      class_id: *class_id,
      class_name: class_name.to_string(),
    });
  }

  Ok(DetectionSet::from(detections))
}
