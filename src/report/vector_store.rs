// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/report/vector_store.rs - 检索用向量库的创建与文件导入
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

use std::path::Path;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::ReportError;
use super::openai::OpenAiApi;

const FILE_PURPOSE: &str = "assistants";
const POLL_INTERVAL: Duration = Duration::from_secs(1);
pub const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Serialize)]
struct CreateStore<'a> {
  name: &'a str,
}

#[derive(Debug, Serialize)]
struct AttachFile<'a> {
  file_id: &'a str,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VectorStore {
  pub id: String,
  #[serde(default)]
  pub name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadedFile {
  pub id: String,
  #[serde(default)]
  pub filename: String,
}

#[derive(Debug, Clone, Deserialize)]
struct LastError {
  #[serde(default)]
  message: String,
}

#[derive(Debug, Clone, Deserialize)]
struct StoreFile {
  status: String,
  #[serde(default)]
  last_error: Option<LastError>,
}

/// 向量库中文件的索引状态
#[derive(Debug, Clone, PartialEq, Eq)]
enum IndexState {
  Pending,
  Completed,
  Failed(String),
}

impl StoreFile {
  fn state(&self) -> IndexState {
    match self.status.as_str() {
      "completed" => IndexState::Completed,
      "in_progress" => IndexState::Pending,
      other => IndexState::Failed(
        self
          .last_error
          .as_ref()
          .map(|e| e.message.clone())
          .filter(|m| !m.is_empty())
          .unwrap_or_else(|| other.to_string()),
      ),
    }
  }
}

/// 检索报告所用向量库的管理客户端
pub struct VectorStoreClient {
  api: OpenAiApi,
  timeout: Duration,
}

impl VectorStoreClient {
  pub fn new(api_key: impl Into<String>, base_url: Option<&str>) -> Result<Self, ReportError> {
    Ok(Self {
      api: OpenAiApi::new(api_key, base_url)?,
      timeout: DEFAULT_INDEX_TIMEOUT,
    })
  }

  /// 等待文件索引完成的最长时间
  pub fn with_timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub async fn create(&self, name: &str) -> Result<VectorStore, ReportError> {
    let store: VectorStore = self.api.post("vector_stores", &CreateStore { name }).await?;
    info!("已创建向量库: {} ({})", store.id, name);
    Ok(store)
  }

  pub async fn upload_file(&self, path: &Path) -> Result<UploadedFile, ReportError> {
    let filename = path
      .file_name()
      .map(|name| name.to_string_lossy().into_owned())
      .ok_or_else(|| ReportError::RequestError(format!("无效的文件路径: {}", path.display())))?;
    let data = tokio::fs::read(path)
      .await
      .map_err(|e| ReportError::RequestError(format!("{}: {}", path.display(), e)))?;
    debug!("上传文件: {} ({} 字节)", filename, data.len());

    let form = reqwest::multipart::Form::new()
      .text("purpose", FILE_PURPOSE)
      .part("file", reqwest::multipart::Part::bytes(data).file_name(filename));
    let file: UploadedFile = self.api.post_multipart("files", form).await?;
    info!("文件已上传: {} ({})", file.id, file.filename);
    Ok(file)
  }

  /// 把文件加入向量库并等待索引完成
  pub async fn attach_and_wait(&self, store_id: &str, file_id: &str) -> Result<(), ReportError> {
    let path = format!("vector_stores/{}/files", store_id);
    let mut file: StoreFile = self.api.post(&path, &AttachFile { file_id }).await?;

    let deadline = Instant::now() + self.timeout;
    loop {
      match file.state() {
        IndexState::Completed => {
          info!("文件 {} 已完成索引", file_id);
          return Ok(());
        }
        IndexState::Failed(reason) => {
          return Err(ReportError::IndexingFailed(format!("{}: {}", file_id, reason)));
        }
        IndexState::Pending if Instant::now() >= deadline => {
          return Err(ReportError::IndexingFailed(format!("{}: 等待索引超时", file_id)));
        }
        IndexState::Pending => {
          debug!("等待文件 {} 完成索引", file_id);
          tokio::time::sleep(POLL_INTERVAL).await;
          file = self.api.get(&format!("{}/{}", path, file_id)).await?;
        }
      }
    }
  }

  /// 创建向量库并导入文件，返回向量库 id
  pub async fn ingest(&self, name: &str, path: &Path) -> Result<String, ReportError> {
    let store = self.create(name).await?;
    let file = self.upload_file(path).await?;
    self.attach_and_wait(&store.id, &file.id).await?;
    Ok(store.id)
  }
}
