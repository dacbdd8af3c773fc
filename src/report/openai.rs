// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/report/openai.rs - OpenAI 兼容的报告生成
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

use std::time::Duration;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};

use super::{ReportError, ReportGenerator, SYSTEM_PROMPT, build_user_prompt};
use crate::model::DetectionSet;

pub const DEFAULT_OPENAI_BASE_URL: &str = "https://api.openai.com/v1";
pub const DEFAULT_REPORT_MODEL: &str = "gpt-4o-mini";

const REPORT_TEMPERATURE: f32 = 0.2;
const REPORT_MAX_TOKENS: u32 = 600;
const REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug, Serialize)]
pub(super) struct ChatMessage<'a> {
  pub role: &'a str,
  pub content: &'a str,
}

#[derive(Debug, Serialize)]
pub(super) struct ChatRequest<'a> {
  pub model: &'a str,
  pub messages: Vec<ChatMessage<'a>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub temperature: Option<f32>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub max_tokens: Option<u32>,
}

#[derive(Debug, Deserialize)]
pub(super) struct ChatResponse {
  choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
  message: ChatReply,
}

#[derive(Debug, Deserialize)]
struct ChatReply {
  content: Option<String>,
}

impl ChatResponse {
  /// 第一条回复的文本，去掉首尾空白
  pub fn into_content(self) -> Result<String, ReportError> {
    self
      .choices
      .into_iter()
      .next()
      .and_then(|choice| choice.message.content)
      .map(|content| content.trim().to_string())
      .ok_or_else(|| ReportError::InvalidResponse("响应中没有报告内容".to_string()))
  }
}

/// OpenAI 兼容接口的 HTTP 客户端
pub(super) struct OpenAiApi {
  client: reqwest::Client,
  base_url: String,
  api_key: String,
}

impl OpenAiApi {
  pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Result<Self, ReportError> {
    let client = reqwest::Client::builder()
      .timeout(REQUEST_TIMEOUT)
      .build()
      .map_err(|e| ReportError::RequestError(e.to_string()))?;
    Ok(Self {
      client,
      base_url: base_url
        .unwrap_or(DEFAULT_OPENAI_BASE_URL)
        .trim_end_matches('/')
        .to_string(),
      api_key: api_key.into(),
    })
  }

  pub fn endpoint(&self, path: &str) -> String {
    format!("{}/{}", self.base_url, path.trim_start_matches('/'))
  }

  pub async fn post<B, R>(&self, path: &str, body: &B) -> Result<R, ReportError>
  where
    B: Serialize + Sync,
    R: DeserializeOwned,
  {
    let request = self.client.post(self.endpoint(path)).json(body);
    self.send(request).await
  }

  pub async fn get<R: DeserializeOwned>(&self, path: &str) -> Result<R, ReportError> {
    self.send(self.client.get(self.endpoint(path))).await
  }

  pub async fn post_multipart<R: DeserializeOwned>(
    &self,
    path: &str,
    form: reqwest::multipart::Form,
  ) -> Result<R, ReportError> {
    let request = self.client.post(self.endpoint(path)).multipart(form);
    self.send(request).await
  }

  async fn send<R: DeserializeOwned>(&self, request: reqwest::RequestBuilder) -> Result<R, ReportError> {
    let response = request
      .bearer_auth(&self.api_key)
      .send()
      .await
      .map_err(|e| {
        error!("报告服务请求失败: {}", e);
        ReportError::RequestError(e.to_string())
      })?;

    let endpoint = response.url().to_string();
    let status = response.status();
    if !status.is_success() {
      let body = response.text().await.unwrap_or_default();
      error!("报告服务返回错误: {} ({})", status, endpoint);
      return Err(ReportError::UpstreamError {
        status: status.as_u16(),
        body,
      });
    }

    response
      .json()
      .await
      .map_err(|e| ReportError::InvalidResponse(e.to_string()))
  }

  pub async fn complete(&self, request: &ChatRequest<'_>) -> Result<String, ReportError> {
    let reply: ChatResponse = self.post("chat/completions", request).await?;
    reply.into_content()
  }
}

/// 通过 chat completions 接口生成报告
pub struct OpenAiReportGenerator {
  api: OpenAiApi,
  model: String,
}

impl OpenAiReportGenerator {
  pub fn new(
    api_key: impl Into<String>,
    model: impl Into<String>,
    base_url: Option<&str>,
  ) -> Result<Self, ReportError> {
    let generator = Self {
      api: OpenAiApi::new(api_key, base_url)?,
      model: model.into(),
    };
    info!(
      "报告生成服务: {} ({})",
      generator.endpoint(),
      generator.model
    );
    Ok(generator)
  }

  pub fn endpoint(&self) -> String {
    self.api.endpoint("chat/completions")
  }

  fn request_body<'a>(&'a self, user_prompt: &'a str) -> ChatRequest<'a> {
    ChatRequest {
      model: &self.model,
      messages: vec![
        ChatMessage {
          role: "system",
          content: SYSTEM_PROMPT,
        },
        ChatMessage {
          role: "user",
          content: user_prompt,
        },
      ],
      temperature: Some(REPORT_TEMPERATURE),
      max_tokens: Some(REPORT_MAX_TOKENS),
    }
  }
}

#[async_trait]
impl ReportGenerator for OpenAiReportGenerator {
  async fn generate(&self, detections: &DetectionSet) -> Result<String, ReportError> {
    let user_prompt = build_user_prompt(detections)?;
    debug!("请求缺陷报告: {} 个检测结果", detections.len());
    self.api.complete(&self.request_body(&user_prompt)).await
  }

  fn describe(&self) -> String {
    format!("openai:{}", self.model)
  }
}
