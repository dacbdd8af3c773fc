// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/server.rs - HTTP 服务
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

use std::future::Future;

use axum::extract::multipart::MultipartError;
use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderValue, StatusCode, header};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::input::ValidationError;
use crate::output::OutputError;
use crate::pipeline::PipelineError;
use crate::report::ReportError;

pub mod routes;
mod state;
pub use self::state::{AppState, SERVICE_DESCRIPTION, SERVICE_TITLE, ServiceInfo};

/// multipart 边界与表单头部的额外开销
const MULTIPART_SLACK: usize = 64 * 1024;

const INTERNAL_ERROR_MESSAGE: &str = "Internal inference error";

/// HTTP 层错误
#[derive(Debug)]
pub enum ApiError {
  Pipeline(PipelineError),
  Multipart(MultipartError),
  MissingFile,
  Unauthorized,
  ReportUnavailable,
  Report(ReportError),
  Output(OutputError),
  Internal(String),
}

impl From<PipelineError> for ApiError {
  fn from(e: PipelineError) -> Self {
    ApiError::Pipeline(e)
  }
}

impl From<MultipartError> for ApiError {
  fn from(e: MultipartError) -> Self {
    ApiError::Multipart(e)
  }
}

impl From<ReportError> for ApiError {
  fn from(e: ReportError) -> Self {
    ApiError::Report(e)
  }
}

impl From<OutputError> for ApiError {
  fn from(e: OutputError) -> Self {
    ApiError::Output(e)
  }
}

impl ApiError {
  pub fn status(&self) -> StatusCode {
    match self {
      ApiError::Pipeline(PipelineError::Validation(e)) => match e {
        ValidationError::FileTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        ValidationError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
        ValidationError::UnsupportedExtension(_) => StatusCode::BAD_REQUEST,
      },
      ApiError::Pipeline(PipelineError::Decode(_)) => StatusCode::BAD_REQUEST,
      ApiError::Pipeline(_) => StatusCode::INTERNAL_SERVER_ERROR,
      ApiError::Multipart(e) => e.status(),
      ApiError::MissingFile => StatusCode::BAD_REQUEST,
      ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
      ApiError::ReportUnavailable => StatusCode::SERVICE_UNAVAILABLE,
      ApiError::Report(ReportError::EmptyDetections) => StatusCode::BAD_REQUEST,
      ApiError::Report(_) => StatusCode::BAD_GATEWAY,
      ApiError::Output(_) | ApiError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
  }

  pub fn reason(&self) -> &'static str {
    match self {
      ApiError::Pipeline(e) => e.reason(),
      ApiError::Multipart(_) => "InvalidMultipart",
      ApiError::MissingFile => "MissingFile",
      ApiError::Unauthorized => "Unauthorized",
      ApiError::ReportUnavailable => "ReportUnavailable",
      ApiError::Report(_) => "ReportError",
      ApiError::Output(_) | ApiError::Internal(_) => "InternalError",
    }
  }

  /// 返回给调用方的说明，内部错误不暴露细节
  fn detail(&self) -> String {
    match self {
      ApiError::Pipeline(e) if e.is_internal() => INTERNAL_ERROR_MESSAGE.to_string(),
      ApiError::Pipeline(e) => e.to_string(),
      ApiError::Multipart(e) => e.body_text(),
      ApiError::MissingFile => format!("missing multipart field `{}`", routes::UPLOAD_FIELD),
      ApiError::Unauthorized => "missing or invalid bearer token".to_string(),
      ApiError::ReportUnavailable => "report generator is not configured".to_string(),
      ApiError::Report(_) => "report generator failed".to_string(),
      ApiError::Output(_) | ApiError::Internal(_) => INTERNAL_ERROR_MESSAGE.to_string(),
    }
  }
}

impl IntoResponse for ApiError {
  fn into_response(self) -> Response {
    let status = self.status();
    if status.is_server_error() {
      match &self {
        ApiError::Pipeline(e) => error!("请求处理失败: {}", e),
        ApiError::Report(e) => error!("报告生成失败: {}", e),
        ApiError::Output(e) => error!("输出编码失败: {}", e),
        ApiError::Internal(e) => error!("内部错误: {}", e),
        _ => error!("请求处理失败: {}", self.reason()),
      }
    } else {
      warn!("请求被拒绝 ({}): {}", status.as_u16(), self.reason());
    }

    let body = Json(json!({
      "error": self.reason(),
      "detail": self.detail(),
    }));
    (status, body).into_response()
  }
}

async fn require_token(
  State(state): State<AppState>,
  request: Request,
  next: Next,
) -> Result<Response, ApiError> {
  if let Some(expected) = state.info.api_token.as_deref() {
    let provided = request
      .headers()
      .get(header::AUTHORIZATION)
      .and_then(|value| value.to_str().ok())
      .and_then(|value| value.strip_prefix("Bearer "));
    if provided != Some(expected) {
      return Err(ApiError::Unauthorized);
    }
  }
  Ok(next.run(request).await)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
  let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
  if origins.is_empty() || origins.iter().any(|origin| origin == "*") {
    return layer.allow_origin(Any);
  }
  let origins: Vec<HeaderValue> = origins
    .iter()
    .filter_map(|origin| match HeaderValue::from_str(origin) {
      Ok(value) => Some(value),
      Err(_) => {
        warn!("忽略无效的 CORS 来源: {}", origin);
        None
      }
    })
    .collect();
  layer.allow_origin(AllowOrigin::list(origins))
}

pub fn router(state: AppState) -> Router {
  let body_limit = state.pipeline.validator().rules().max_file_size as usize + MULTIPART_SLACK;
  let cors = cors_layer(&state.info.cors_origins);

  let inference = Router::new()
    .route("/predict", post(routes::predict))
    .route("/predict-image", post(routes::predict_image))
    .route("/report", post(routes::report))
    .route_layer(middleware::from_fn_with_state(state.clone(), require_token));

  Router::new()
    .route("/", get(routes::root))
    .route("/health", get(routes::health))
    .merge(inference)
    .layer(DefaultBodyLimit::max(body_limit))
    .layer(cors)
    .layer(TraceLayer::new_for_http())
    .with_state(state)
}

/// Ctrl-C 触发的停止信号
pub fn shutdown_signal() -> Result<impl Future<Output = ()> + Send + 'static, ctrlc::Error> {
  let (tx, mut rx) = tokio::sync::watch::channel(false);
  ctrlc::set_handler(move || {
    info!("收到中断信号，准备退出...");
    let _ = tx.send(true);
  })?;
  Ok(async move {
    let _ = rx.wait_for(|stop| *stop).await;
  })
}
