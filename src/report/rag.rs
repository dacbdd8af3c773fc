// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/report/rag.rs - 基于向量库检索的报告生成
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
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::openai::{ChatMessage, ChatRequest, OpenAiApi};
use super::{ReportError, ReportGenerator, build_user_prompt};
use crate::model::DetectionSet;

pub const RAG_SYSTEM_PROMPT: &str =
  "Produce a concise answer to the query based on the provided sources.";

#[derive(Debug, Serialize)]
struct SearchRequest<'a> {
  query: &'a str,
  #[serde(skip_serializing_if = "Option::is_none")]
  max_num_results: Option<u32>,
}

#[derive(Debug, Deserialize)]
struct SearchResponse {
  #[serde(default)]
  data: Vec<SearchResult>,
}

#[derive(Debug, Deserialize)]
struct SearchResult {
  file_id: String,
  #[serde(default)]
  filename: String,
  #[serde(default)]
  content: Vec<SearchContent>,
}

#[derive(Debug, Deserialize)]
struct SearchContent {
  #[serde(default)]
  text: String,
}

/// 检索结果拼成 `<sources>` 文本，作为助手消息交给模型
fn format_sources(results: &[SearchResult]) -> String {
  let mut sources = String::from("<sources>");
  for result in results {
    sources.push_str(&format!(
      "<result file_id='{}' file_name='{}'>",
      result.file_id, result.filename
    ));
    for part in &result.content {
      sources.push_str(&format!("<content>{}</content>", part.text));
    }
    sources.push_str("</result>");
  }
  sources.push_str("</sources>");
  sources
}

/// 先在向量库中检索标准条文，再让模型依据检索结果生成报告
pub struct RagReportGenerator {
  api: OpenAiApi,
  model: String,
  vector_store_id: String,
  max_results: Option<u32>,
}

impl RagReportGenerator {
  pub fn new(
    api_key: impl Into<String>,
    model: impl Into<String>,
    vector_store_id: impl Into<String>,
    base_url: Option<&str>,
  ) -> Result<Self, ReportError> {
    let generator = Self {
      api: OpenAiApi::new(api_key, base_url)?,
      model: model.into(),
      vector_store_id: vector_store_id.into(),
      max_results: None,
    };
    info!(
      "检索增强报告服务: {} ({})",
      generator.search_path(),
      generator.model
    );
    Ok(generator)
  }

  /// 每次检索返回的最大结果数，未设置时由服务端决定
  pub fn with_max_results(mut self, max_results: u32) -> Self {
    self.max_results = Some(max_results);
    self
  }

  fn search_path(&self) -> String {
    format!("vector_stores/{}/search", self.vector_store_id)
  }

  fn search_body<'a>(&self, query: &'a str) -> SearchRequest<'a> {
    SearchRequest {
      query,
      max_num_results: self.max_results,
    }
  }

  fn completion_body<'a>(&'a self, sources: &'a str, query: &'a str) -> ChatRequest<'a> {
    ChatRequest {
      model: &self.model,
      messages: vec![
        ChatMessage {
          role: "system",
          content: RAG_SYSTEM_PROMPT,
        },
        ChatMessage {
          role: "assistant",
          content: sources,
        },
        ChatMessage {
          role: "user",
          content: query,
        },
      ],
      temperature: None,
      max_tokens: None,
    }
  }
}

#[async_trait]
impl ReportGenerator for RagReportGenerator {
  async fn generate(&self, detections: &DetectionSet) -> Result<String, ReportError> {
    let query = build_user_prompt(detections)?;

    let found: SearchResponse = self
      .api
      .post(&self.search_path(), &self.search_body(&query))
      .await?;
    if found.data.is_empty() {
      warn!("向量库 {} 未检索到相关内容", self.vector_store_id);
    } else {
      debug!("检索到 {} 条相关内容", found.data.len());
    }

    let sources = format_sources(&found.data);
    self.api.complete(&self.completion_body(&sources, &query)).await
  }

  fn describe(&self) -> String {
    format!("openai-rag:{}:{}", self.model, self.vector_store_id)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn generator() -> RagReportGenerator {
    RagReportGenerator::new("sk-test", "gpt-4o-mini", "vs_ipc", Some("http://localhost:9/v1")).unwrap()
  }

  #[test]
  fn search_targets_the_configured_store() {
    let generator = generator();
    assert_eq!(
      generator.api.endpoint(&generator.search_path()),
      "http://localhost:9/v1/vector_stores/vs_ipc/search"
    );

    let body = serde_json::to_value(generator.search_body("query")).unwrap();
    assert_eq!(body, serde_json::json!({ "query": "query" }));

    let generator = generator.with_max_results(5);
    let body = serde_json::to_value(generator.search_body("query")).unwrap();
    assert_eq!(body["max_num_results"], 5);
  }

  #[test]
  fn sources_precede_the_query() {
    let generator = generator();
    let body = serde_json::to_value(generator.completion_body("<sources></sources>", "q")).unwrap();
    let roles: Vec<_> = body["messages"]
      .as_array()
      .unwrap()
      .iter()
      .map(|m| m["role"].as_str().unwrap())
      .collect();
    assert_eq!(roles, ["system", "assistant", "user"]);
    assert_eq!(body["messages"][0]["content"], RAG_SYSTEM_PROMPT);
    assert_eq!(body["messages"][1]["content"], "<sources></sources>");
    assert!(body.get("temperature").is_none());
    assert!(body.get("max_tokens").is_none());
  }

  #[test]
  fn search_results_are_wrapped_as_sources() {
    let found: SearchResponse = serde_json::from_str(
      r#"{
        "object": "vector_store.search_results.page",
        "data": [
          {
            "file_id": "file-1",
            "filename": "ipc_a_610f.txt",
            "score": 0.82,
            "content": [
              {"type": "text", "text": "Solder bridging"},
              {"type": "text", "text": "is a defect"}
            ]
          }
        ],
        "has_more": false
      }"#,
    )
    .unwrap();
    assert_eq!(
      format_sources(&found.data),
      "<sources><result file_id='file-1' file_name='ipc_a_610f.txt'>\
       <content>Solder bridging</content><content>is a defect</content>\
       </result></sources>"
    );
    assert_eq!(format_sources(&[]), "<sources></sources>");
  }

  #[tokio::test]
  async fn empty_detections_skip_retrieval() {
    let err = generator().generate(&DetectionSet::default()).await.unwrap_err();
    assert!(matches!(err, ReportError::EmptyDetections));
  }
}
