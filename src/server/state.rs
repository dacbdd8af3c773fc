// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/server/state.rs - HTTP 服务共享状态
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

use std::sync::Arc;
use std::time::Instant;

use chrono::{DateTime, Utc};

use crate::pipeline::Pipeline;
use crate::report::ReportGenerator;

pub const SERVICE_TITLE: &str = "PCB Detector API";
pub const SERVICE_DESCRIPTION: &str = "PCB defect detection service";

/// 服务元数据与运行选项
#[derive(Debug, Clone)]
pub struct ServiceInfo {
  pub title: String,
  pub version: String,
  pub description: String,
  pub model_path: String,
  /// 为空时不校验访问令牌
  pub api_token: Option<String>,
  pub cors_origins: Vec<String>,
  pub started_at: DateTime<Utc>,
  pub started: Instant,
}

impl ServiceInfo {
  pub fn new(model_path: impl Into<String>) -> Self {
    Self {
      title: SERVICE_TITLE.to_string(),
      version: env!("CARGO_PKG_VERSION").to_string(),
      description: SERVICE_DESCRIPTION.to_string(),
      model_path: model_path.into(),
      api_token: None,
      cors_origins: vec!["*".to_string()],
      started_at: Utc::now(),
      started: Instant::now(),
    }
  }

  pub fn with_api_token(mut self, token: Option<String>) -> Self {
    self.api_token = token.filter(|t| !t.is_empty());
    self
  }

  pub fn with_cors_origins(mut self, origins: Vec<String>) -> Self {
    self.cors_origins = origins;
    self
  }

  pub fn uptime_seconds(&self) -> u64 {
    self.started.elapsed().as_secs()
  }
}

/// Axum 处理函数共享的状态
#[derive(Clone)]
pub struct AppState {
  pub pipeline: Arc<Pipeline>,
  /// 未配置时 `/report` 只能返回无缺陷的固定报告
  pub reporter: Option<Arc<dyn ReportGenerator>>,
  pub info: Arc<ServiceInfo>,
}

impl AppState {
  pub fn new(pipeline: Arc<Pipeline>, info: ServiceInfo) -> Self {
    Self {
      pipeline,
      reporter: None,
      info: Arc::new(info),
    }
  }

  pub fn with_reporter(mut self, reporter: Arc<dyn ReportGenerator>) -> Self {
    self.reporter = Some(reporter);
    self
  }
}
