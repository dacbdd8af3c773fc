// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/report.rs - 缺陷分析报告
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

use async_trait::async_trait;
use thiserror::Error;

use crate::model::DetectionSet;

#[cfg(feature = "report_openai")]
mod openai;
#[cfg(feature = "report_openai")]
pub use self::openai::{DEFAULT_OPENAI_BASE_URL, DEFAULT_REPORT_MODEL, OpenAiReportGenerator};
#[cfg(feature = "report_openai")]
mod rag;
#[cfg(feature = "report_openai")]
pub use self::rag::{RAG_SYSTEM_PROMPT, RagReportGenerator};
#[cfg(feature = "report_openai")]
mod vector_store;
#[cfg(feature = "report_openai")]
pub use self::vector_store::{DEFAULT_INDEX_TIMEOUT, UploadedFile, VectorStore, VectorStoreClient};

pub const SYSTEM_PROMPT: &str = "You are an expert in electronic-assembly quality assurance and IPC-A-610F. \
   Analyse detected PCB defects and suggest corrective actions.";

pub const TABLE_INSTRUCTIONS: &str = "For each defect provide: **reference**, **defect_type (IPC-A-610F)**, \
   **severity (Class 1/2/3)**. Answer as a **GitHub-flavoured Markdown table** with headers.";

/// 没有检测到缺陷时直接返回的报告
pub const NO_DEFECTS_REPORT: &str = "No defects were detected on this board.";

#[derive(Error, Debug)]
pub enum ReportError {
  #[error("检测结果为空")]
  EmptyDetections,
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
  #[error("报告服务请求失败: {0}")]
  RequestError(String),
  #[error("报告服务返回错误 {status}: {body}")]
  UpstreamError { status: u16, body: String },
  #[error("报告服务响应无效: {0}")]
  InvalidResponse(String),
  #[error("向量库文件索引失败: {0}")]
  IndexingFailed(String),
}

/// 根据检测结果生成文字报告，报告内容不做解析
#[async_trait]
pub trait ReportGenerator: Send + Sync {
  async fn generate(&self, detections: &DetectionSet) -> Result<String, ReportError>;

  fn describe(&self) -> String;
}

/// 用户提示词：格式化的检测结果 JSON 与表格要求
pub fn build_user_prompt(detections: &DetectionSet) -> Result<String, ReportError> {
  if detections.is_empty() {
    return Err(ReportError::EmptyDetections);
  }
  let pretty = serde_json::to_string_pretty(detections)?;
  Ok(format!(
    "PCB defects (JSON):\n```json\n{}\n```\n\n{}",
    pretty, TABLE_INSTRUCTIONS
  ))
}
