// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/input.rs - 上传文件输入
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

mod decode;
mod staging;
mod validate;

pub use self::decode::{DecodeError, decode};
pub use self::staging::{StagedAsset, StagingError, StagingStore};
pub use self::validate::{
  DEFAULT_EXTENSIONS, DEFAULT_MAX_FILE_SIZE, DEFAULT_MIME_TYPES, FileValidator, ValidatedUpload,
  ValidationError, ValidationRules,
};

/// 缺省文件名（客户端未提供文件名时使用）
pub const DEFAULT_FILENAME: &str = "image.jpg";
/// 缺省扩展名（文件名没有扩展名时使用）
pub const DEFAULT_EXTENSION: &str = ".jpg";
/// 缺省 MIME 类型
pub const DEFAULT_CONTENT_TYPE: &str = "image/jpeg";

/// 单次请求的上传描述
///
/// `body` 为上传内容的字节流，暂存完成后即被丢弃。
pub struct UploadDescriptor<R> {
  pub filename: Option<String>,
  pub content_type: Option<String>,
  pub declared_size: u64,
  pub body: R,
}

impl<R> UploadDescriptor<R> {
  pub fn new(body: R, declared_size: u64) -> Self {
    Self {
      filename: None,
      content_type: None,
      declared_size,
      body,
    }
  }

  pub fn with_filename(mut self, filename: impl Into<String>) -> Self {
    self.filename = Some(filename.into());
    self
  }

  pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
    self.content_type = Some(content_type.into());
    self
  }
}

impl<'a> UploadDescriptor<&'a [u8]> {
  /// 内存中的上传内容，声明大小即字节数
  pub fn from_bytes(bytes: &'a [u8]) -> Self {
    Self::new(bytes, bytes.len() as u64)
  }
}
