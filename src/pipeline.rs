// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/pipeline.rs - 推理请求流水线
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

//! 单次请求的处理流程：
//!
//! `Received → Validated → Staged → Decoded → CacheHit | Inferred → Annotated → Completed`
//!
//! 任一阶段失败即进入 `Failed`。暂存文件由请求独占，在两种终态下都会被删除。

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use serde::Serialize;
use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::cache::{CacheKey, DEFAULT_CACHE_CAPACITY, ResultCache, ResultSource};
use crate::executor::{InferenceError, InferenceExecutor, default_workers};
use crate::input::{
  DecodeError, FileValidator, StagingError, StagingStore, UploadDescriptor, ValidationError,
  ValidationRules, decode,
};
use crate::model::{DetectionSet, Detector};
use crate::output::{AnnotatedImage, Annotator, LabelFont, OutputError};

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("文件校验失败: {0}")]
  Validation(#[from] ValidationError),
  #[error("文件暂存失败: {0}")]
  Staging(#[from] StagingError),
  #[error("图像解码失败: {0}")]
  Decode(#[from] DecodeError),
  #[error("推理失败: {0}")]
  Inference(#[from] InferenceError),
  #[error("输出失败: {0}")]
  Output(#[from] OutputError),
}

impl PipelineError {
  /// 可区分的失败原因
  pub fn reason(&self) -> &'static str {
    match self {
      PipelineError::Validation(e) => e.reason(),
      PipelineError::Staging(_) => "StagingError",
      PipelineError::Decode(_) => "DecodeError",
      PipelineError::Inference(_) => "InferenceError",
      PipelineError::Output(_) => "OutputError",
    }
  }

  /// 是否为服务端内部错误
  pub fn is_internal(&self) -> bool {
    matches!(
      self,
      PipelineError::Staging(_) | PipelineError::Inference(_) | PipelineError::Output(_)
    )
  }
}

/// 请求所处阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Received,
  Validated,
  Staged,
  Decoded,
  CacheHit,
  Inferred,
  Annotated,
  Completed,
  Failed,
}

/// 输出形式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
  Detections,
  Annotated,
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
  pub rules: ValidationRules,
  /// 为空时使用系统临时目录
  pub staging_dir: Option<PathBuf>,
  pub cache_capacity: usize,
  pub workers: usize,
  /// 为空或加载失败时使用内置字体
  pub font: Option<PathBuf>,
}

impl Default for PipelineConfig {
  fn default() -> Self {
    Self {
      rules: ValidationRules::default(),
      staging_dir: None,
      cache_capacity: DEFAULT_CACHE_CAPACITY,
      workers: default_workers(),
      font: None,
    }
  }
}

#[derive(Debug)]
pub struct PipelineOutput {
  pub detections: Arc<DetectionSet>,
  pub annotated: Option<AnnotatedImage>,
  pub source: ResultSource,
  /// 实际接收的字节数
  pub file_size: u64,
  pub processing_time: Duration,
}

impl PipelineOutput {
  pub fn cache_hit(&self) -> bool {
    self.source != ResultSource::Inferred
  }

  pub fn processing_time_ms(&self) -> f64 {
    self.processing_time.as_secs_f64() * 1000.0
  }
}

#[derive(Debug, Default)]
struct Counters {
  requests: AtomicU64,
  completed: AtomicU64,
  failed: AtomicU64,
  inferences: AtomicU64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
  pub total_requests: u64,
  pub completed: u64,
  pub failed: u64,
  pub inferences: u64,
  /// 截断后退化而被丢弃的检测框
  pub dropped_boxes: u64,
}

pub struct Pipeline {
  validator: FileValidator,
  staging: StagingStore,
  executor: InferenceExecutor,
  cache: ResultCache,
  annotator: Annotator,
  counters: Counters,
}

impl Pipeline {
  pub fn new(detector: Arc<dyn Detector>, config: PipelineConfig) -> Result<Self, PipelineError> {
    let staging = match &config.staging_dir {
      Some(dir) => StagingStore::open(dir)?,
      None => StagingStore::system()?,
    };
    info!("暂存目录: {}", staging.directory().display());
    info!("结果缓存容量: {}", config.cache_capacity);

    let font = LabelFont::resolve(config.font.as_deref())?;

    Ok(Self {
      validator: FileValidator::new(config.rules),
      staging,
      executor: InferenceExecutor::new(detector, config.workers),
      cache: ResultCache::new(config.cache_capacity),
      annotator: Annotator::new(font),
      counters: Counters::default(),
    })
  }

  pub fn validator(&self) -> &FileValidator {
    &self.validator
  }

  pub fn staging_dir(&self) -> &Path {
    self.staging.directory()
  }

  pub fn cache(&self) -> &ResultCache {
    &self.cache
  }

  pub fn executor(&self) -> &InferenceExecutor {
    &self.executor
  }

  pub fn annotator(&self) -> &Annotator {
    &self.annotator
  }

  pub fn stats(&self) -> PipelineStats {
    PipelineStats {
      total_requests: self.counters.requests.load(Ordering::Relaxed),
      completed: self.counters.completed.load(Ordering::Relaxed),
      failed: self.counters.failed.load(Ordering::Relaxed),
      inferences: self.counters.inferences.load(Ordering::Relaxed),
      dropped_boxes: self.executor.dropped_boxes(),
    }
  }

  /// 模型已加载且推理执行器仍接受请求
  pub fn model_loaded(&self) -> bool {
    self.executor.is_available()
  }

  /// 处理一次上传
  pub async fn run<R>(
    &self,
    upload: UploadDescriptor<R>,
    mode: OutputMode,
  ) -> Result<PipelineOutput, PipelineError>
  where
    R: AsyncRead + Unpin,
  {
    let id = self.counters.requests.fetch_add(1, Ordering::Relaxed) + 1;
    let span = info_span!("request", id);

    let result = self.process(upload, mode).instrument(span.clone()).await;
    let _enter = span.enter();
    match &result {
      Ok(output) => {
        self.counters.completed.fetch_add(1, Ordering::Relaxed);
        debug!("请求状态: {:?}", Stage::Completed);
        info!(
          "请求完成: {} 个检测结果, 耗时 {:.1} ms",
          output.detections.len(),
          output.processing_time_ms()
        );
      }
      Err(e) => {
        self.counters.failed.fetch_add(1, Ordering::Relaxed);
        debug!("请求状态: {:?}", Stage::Failed);
        warn!("请求失败 ({}): {}", e.reason(), e);
      }
    }
    result
  }

  async fn process<R>(
    &self,
    upload: UploadDescriptor<R>,
    mode: OutputMode,
  ) -> Result<PipelineOutput, PipelineError>
  where
    R: AsyncRead + Unpin,
  {
    let started = Instant::now();
    debug!("请求状态: {:?}", Stage::Received);

    let validated = self.validator.validate(
      upload.filename.as_deref(),
      upload.content_type.as_deref(),
      upload.declared_size,
    )?;
    debug!("请求状态: {:?} ({})", Stage::Validated, validated.filename);

    // 暂存文件在本函数返回或被取消时删除
    let mut asset = self.staging.stage(upload.body, &validated.extension).await?;
    debug!("请求状态: {:?}", Stage::Staged);

    // 声明大小可能与实际不符
    let limit = self.validator.rules().max_file_size;
    if asset.size() > limit {
      warn!("实际文件过大: {} 字节 (上限 {})", asset.size(), limit);
      return Err(
        ValidationError::FileTooLarge {
          size: asset.size(),
          limit,
        }
        .into(),
      );
    }

    let image = Arc::new(decode(&asset)?);
    debug!(
      "请求状态: {:?} ({}x{})",
      Stage::Decoded,
      image.width(),
      image.height()
    );

    let key = CacheKey::of(&image);
    let resolved = self
      .cache
      .resolve(key, || {
        self.counters.inferences.fetch_add(1, Ordering::Relaxed);
        self.executor.infer(image.clone())
      })
      .await?;
    match resolved.source {
      ResultSource::Inferred => debug!("请求状态: {:?}", Stage::Inferred),
      _ => debug!("请求状态: {:?} ({:?})", Stage::CacheHit, resolved.source),
    }

    let annotated = match mode {
      OutputMode::Annotated => {
        let annotated = self.annotator.annotate(&image, &resolved.detections);
        debug!("请求状态: {:?}", Stage::Annotated);
        Some(annotated)
      }
      OutputMode::Detections => None,
    };

    let file_size = asset.size();
    asset.release();

    Ok(PipelineOutput {
      detections: resolved.detections,
      annotated,
      source: resolved.source,
      file_size,
      processing_time: started.elapsed(),
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn reasons_are_distinguishable() {
    let too_large: PipelineError = ValidationError::FileTooLarge { size: 2, limit: 1 }.into();
    let bad_ext: PipelineError = ValidationError::UnsupportedExtension(".txt".into()).into();
    let failed: PipelineError = InferenceError::ModelFailure("x".into()).into();

    assert_eq!(too_large.reason(), "FileTooLarge");
    assert_eq!(bad_ext.reason(), "UnsupportedExtension");
    assert_eq!(failed.reason(), "InferenceError");
    assert!(failed.is_internal());
    assert!(!bad_ext.is_internal());
  }

  #[test]
  fn output_reports_cache_hits() {
    let output = PipelineOutput {
      detections: Arc::new(DetectionSet::default()),
      annotated: None,
      source: ResultSource::Coalesced,
      file_size: 0,
      processing_time: Duration::from_millis(3),
    };
    assert!(output.cache_hit());
    assert!((output.processing_time_ms() - 3.0).abs() < 1e-9);
  }
}
