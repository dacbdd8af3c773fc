// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/server/routes.rs - HTTP 路由处理
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

use axum::Json;
use axum::body::Bytes;
use axum::extract::multipart::MultipartError;
use axum::extract::{Multipart, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use serde_json::json;
use tracing::{debug, info, warn};

use super::ApiError;
use super::state::AppState;
use crate::cache::CacheStats;
use crate::input::{UploadDescriptor, ValidationError};
use crate::model::DetectionSet;
use crate::pipeline::{OutputMode, PipelineOutput};
use crate::report::NO_DEFECTS_REPORT;

/// 上传文件所在的表单字段
pub const UPLOAD_FIELD: &str = "file";
pub const PROCESSING_TIME_HEADER: &str = "x-processing-time-ms";
pub const CACHE_HIT_HEADER: &str = "x-cache-hit";

struct Upload {
  filename: Option<String>,
  content_type: Option<String>,
  bytes: Bytes,
}

/// 请求体超出上限时按文件过大处理，大小取自 `Content-Length`
fn multipart_error(error: MultipartError, limit: u64, headers: &HeaderMap) -> ApiError {
  if error.status() != StatusCode::PAYLOAD_TOO_LARGE {
    return ApiError::Multipart(error);
  }
  let size = headers
    .get(header::CONTENT_LENGTH)
    .and_then(|value| value.to_str().ok())
    .and_then(|value| value.parse::<u64>().ok())
    .filter(|size| *size > limit)
    .unwrap_or(limit + 1);
  warn!("请求体超出上限: {} 字节 (上限 {})", size, limit);
  ApiError::Pipeline(ValidationError::FileTooLarge { size, limit }.into())
}

async fn read_upload(
  state: &AppState,
  headers: &HeaderMap,
  mut multipart: Multipart,
) -> Result<Upload, ApiError> {
  let limit = state.pipeline.validator().rules().max_file_size;
  while let Some(field) = multipart
    .next_field()
    .await
    .map_err(|e| multipart_error(e, limit, headers))?
  {
    if field.name() != Some(UPLOAD_FIELD) {
      continue;
    }
    let filename = field.file_name().map(str::to_string);
    let content_type = field.content_type().map(str::to_string);
    let bytes = field
      .bytes()
      .await
      .map_err(|e| multipart_error(e, limit, headers))?;
    debug!(
      "收到上传文件: {:?} ({:?}, {} 字节)",
      filename,
      content_type,
      bytes.len()
    );
    return Ok(Upload {
      filename,
      content_type,
      bytes,
    });
  }
  Err(ApiError::MissingFile)
}

async fn run_pipeline(
  state: &AppState,
  headers: &HeaderMap,
  multipart: Multipart,
  mode: OutputMode,
) -> Result<PipelineOutput, ApiError> {
  let upload = read_upload(state, headers, multipart).await?;
  let descriptor = UploadDescriptor {
    filename: upload.filename,
    content_type: upload.content_type,
    declared_size: upload.bytes.len() as u64,
    body: &upload.bytes[..],
  };
  Ok(state.pipeline.run(descriptor, mode).await?)
}

#[derive(Serialize)]
struct PredictResponse<'a> {
  detections: &'a DetectionSet,
  processing_time_ms: f64,
  file_size: u64,
  cache_hit: bool,
}

impl<'a> From<&'a PipelineOutput> for PredictResponse<'a> {
  fn from(output: &'a PipelineOutput) -> Self {
    Self {
      detections: &output.detections,
      processing_time_ms: output.processing_time_ms(),
      file_size: output.file_size,
      cache_hit: output.cache_hit(),
    }
  }
}

pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
  Json(json!({
    "message": state.info.title,
    "version": state.info.version,
    "description": state.info.description,
  }))
}

#[derive(Serialize)]
struct HealthResponse<'a> {
  status: &'static str,
  model_loaded: bool,
  uptime_seconds: u64,
  total_requests: u64,
  dropped_boxes: u64,
  model_path: &'a str,
  started_at: String,
  cache: CacheStats,
}

/// 健康检查，只读取计数器
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
  let stats = state.pipeline.stats();
  let model_loaded = state.pipeline.model_loaded();
  Json(HealthResponse {
    status: if model_loaded { "healthy" } else { "unavailable" },
    model_loaded,
    uptime_seconds: state.info.uptime_seconds(),
    total_requests: stats.total_requests,
    dropped_boxes: stats.dropped_boxes,
    model_path: &state.info.model_path,
    started_at: state.info.started_at.to_rfc3339(),
    cache: state.pipeline.cache().stats(),
  })
  .into_response()
}

pub async fn predict(
  State(state): State<AppState>,
  headers: HeaderMap,
  multipart: Multipart,
) -> Result<Response, ApiError> {
  let output = run_pipeline(&state, &headers, multipart, OutputMode::Detections).await?;
  Ok(Json(PredictResponse::from(&output)).into_response())
}

pub async fn predict_image(
  State(state): State<AppState>,
  headers: HeaderMap,
  multipart: Multipart,
) -> Result<Response, ApiError> {
  let output = run_pipeline(&state, &headers, multipart, OutputMode::Annotated).await?;
  let Some(annotated) = &output.annotated else {
    return Err(ApiError::Internal("缺少标注图像".to_string()));
  };
  let png = annotated.to_png()?;

  let mut response = png.into_response();
  let headers = response.headers_mut();
  headers.insert(header::CONTENT_TYPE, HeaderValue::from_static("image/png"));
  if let Ok(value) = HeaderValue::from_str(&format!("{:.2}", output.processing_time_ms())) {
    headers.insert(PROCESSING_TIME_HEADER, value);
  }
  headers.insert(
    CACHE_HIT_HEADER,
    HeaderValue::from_static(if output.cache_hit() { "true" } else { "false" }),
  );
  Ok(response)
}

#[derive(Serialize)]
struct ReportResponse<'a> {
  #[serde(flatten)]
  prediction: PredictResponse<'a>,
  report: String,
  report_source: String,
}

pub async fn report(
  State(state): State<AppState>,
  headers: HeaderMap,
  multipart: Multipart,
) -> Result<Response, ApiError> {
  let output = run_pipeline(&state, &headers, multipart, OutputMode::Detections).await?;

  let (report, report_source) = if output.detections.is_empty() {
    debug!("未检测到缺陷，跳过报告生成");
    (NO_DEFECTS_REPORT.to_string(), "fixed".to_string())
  } else {
    let reporter = state.reporter.as_ref().ok_or(ApiError::ReportUnavailable)?;
    let report = reporter.generate(&output.detections).await?;
    info!("缺陷报告生成完成: {} 字符", report.chars().count());
    (report, reporter.describe())
  };

  Ok(
    Json(ReportResponse {
      prediction: PredictResponse::from(&output),
      report,
      report_source,
    })
    .into_response(),
  )
}
