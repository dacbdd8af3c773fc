// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/input/validate.rs - 上传文件校验
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

use std::collections::HashSet;
use std::path::Path;

use thiserror::Error;
use tracing::warn;

use super::{DEFAULT_CONTENT_TYPE, DEFAULT_EXTENSION, DEFAULT_FILENAME};

pub const DEFAULT_MAX_FILE_SIZE: u64 = 10 * 1024 * 1024;
pub const DEFAULT_EXTENSIONS: [&str; 5] = [".jpg", ".jpeg", ".png", ".bmp", ".tiff"];
pub const DEFAULT_MIME_TYPES: [&str; 4] = ["image/jpeg", "image/png", "image/bmp", "image/tiff"];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
  #[error("文件过大: {size} 字节，上限 {limit} 字节")]
  FileTooLarge { size: u64, limit: u64 },
  #[error("不支持的文件扩展名: {0}")]
  UnsupportedExtension(String),
  #[error("不支持的 MIME 类型: {0}")]
  UnsupportedMediaType(String),
}

impl ValidationError {
  /// 面向调用方的拒绝原因
  pub fn reason(&self) -> &'static str {
    match self {
      ValidationError::FileTooLarge { .. } => "FileTooLarge",
      ValidationError::UnsupportedExtension(_) => "UnsupportedExtension",
      ValidationError::UnsupportedMediaType(_) => "UnsupportedMediaType",
    }
  }
}

/// 校验规则
#[derive(Debug, Clone)]
pub struct ValidationRules {
  pub max_file_size: u64,
  /// 小写、带点的扩展名，如 ".png"
  pub allowed_extensions: HashSet<String>,
  pub allowed_mime_types: HashSet<String>,
}

impl Default for ValidationRules {
  fn default() -> Self {
    Self {
      max_file_size: DEFAULT_MAX_FILE_SIZE,
      allowed_extensions: DEFAULT_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
      allowed_mime_types: DEFAULT_MIME_TYPES.iter().map(|s| s.to_string()).collect(),
    }
  }
}

impl ValidationRules {
  pub fn with_max_file_size(mut self, max_file_size: u64) -> Self {
    self.max_file_size = max_file_size;
    self
  }

  pub fn with_extensions<I, S>(mut self, extensions: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    self.allowed_extensions = extensions
      .into_iter()
      .map(|ext| normalize_extension(ext.as_ref()))
      .collect();
    self
  }

  pub fn with_mime_types<I, S>(mut self, mime_types: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
  {
    self.allowed_mime_types = mime_types
      .into_iter()
      .map(|mime| mime.as_ref().trim().to_ascii_lowercase())
      .collect();
    self
  }
}

fn normalize_extension(ext: &str) -> String {
  let ext = ext.trim().to_ascii_lowercase();
  if ext.starts_with('.') {
    ext
  } else {
    format!(".{}", ext)
  }
}

/// 通过校验的上传元数据
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidatedUpload {
  pub filename: String,
  /// 小写、带点的扩展名；文件名无扩展名时为 ".jpg"
  pub extension: String,
  pub content_type: String,
  pub size: u64,
}

/// 文件快速校验，不读取文件内容
#[derive(Debug, Clone, Default)]
pub struct FileValidator {
  rules: ValidationRules,
}

impl FileValidator {
  pub fn new(rules: ValidationRules) -> Self {
    Self { rules }
  }

  pub fn rules(&self) -> &ValidationRules {
    &self.rules
  }

  pub fn validate(
    &self,
    filename: Option<&str>,
    content_type: Option<&str>,
    declared_size: u64,
  ) -> Result<ValidatedUpload, ValidationError> {
    if declared_size > self.rules.max_file_size {
      warn!(
        "文件过大: {} 字节 (上限 {})",
        declared_size, self.rules.max_file_size
      );
      return Err(ValidationError::FileTooLarge {
        size: declared_size,
        limit: self.rules.max_file_size,
      });
    }

    let filename = filename
      .filter(|name| !name.trim().is_empty())
      .unwrap_or(DEFAULT_FILENAME);
    let extension = Path::new(filename)
      .extension()
      .map(|ext| format!(".{}", ext.to_string_lossy().to_ascii_lowercase()))
      .unwrap_or_else(|| DEFAULT_EXTENSION.to_string());
    if !self.rules.allowed_extensions.contains(&extension) {
      warn!("文件扩展名无效: {:?}", extension);
      return Err(ValidationError::UnsupportedExtension(extension));
    }

    let content_type = content_type
      .map(|mime| mime.trim().to_ascii_lowercase())
      .filter(|mime| !mime.is_empty())
      .unwrap_or_else(|| DEFAULT_CONTENT_TYPE.to_string());
    if !self.rules.allowed_mime_types.contains(&content_type) {
      warn!("MIME 类型无效: {}", content_type);
      return Err(ValidationError::UnsupportedMediaType(content_type));
    }

    Ok(ValidatedUpload {
      filename: filename.to_string(),
      extension,
      content_type,
      size: declared_size,
    })
  }
}
