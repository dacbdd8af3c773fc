// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/input/staging.rs - 上传文件暂存
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

use std::path::{Path, PathBuf};

use tempfile::TempPath;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tracing::{debug, warn};

const STAGING_PREFIX: &str = "pcb-upload-";
const DEFAULT_SUFFIX: &str = ".png";

#[derive(Error, Debug)]
pub enum StagingError {
  #[error("暂存目录不可用: {0}")]
  DirectoryUnavailable(PathBuf, #[source] std::io::Error),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
}

/// 暂存的上传文件
///
/// 每个请求独占一个实例。无论请求以何种方式结束（包括被取消），
/// 实例被丢弃时对应的临时文件都会被删除。
#[derive(Debug)]
pub struct StagedAsset {
  path: PathBuf,
  suffix: String,
  size: u64,
  guard: Option<TempPath>,
}

impl StagedAsset {
  pub fn path(&self) -> &Path {
    &self.path
  }

  pub fn suffix(&self) -> &str {
    &self.suffix
  }

  /// 实际写入的字节数
  pub fn size(&self) -> u64 {
    self.size
  }

  pub fn is_released(&self) -> bool {
    self.guard.is_none()
  }

  /// 删除临时文件，可重复调用
  pub fn release(&mut self) {
    let Some(guard) = self.guard.take() else {
      return;
    };
    match guard.close() {
      Ok(()) => debug!("已删除暂存文件: {}", self.path.display()),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
        debug!("暂存文件已不存在: {}", self.path.display())
      }
      Err(e) => warn!("删除暂存文件失败: {}: {}", self.path.display(), e),
    }
  }
}

/// 暂存目录
#[derive(Debug, Clone)]
pub struct StagingStore {
  directory: PathBuf,
}

impl StagingStore {
  /// 打开暂存目录，不存在时创建
  pub fn open(directory: impl Into<PathBuf>) -> Result<Self, StagingError> {
    let directory = directory.into();
    std::fs::create_dir_all(&directory)
      .map_err(|e| StagingError::DirectoryUnavailable(directory.clone(), e))?;
    Ok(Self { directory })
  }

  /// 使用系统临时目录
  pub fn system() -> Result<Self, StagingError> {
    Self::open(std::env::temp_dir())
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  /// 将字节流写入唯一命名的临时文件
  ///
  /// `suffix` 为带点的扩展名，为空时使用 ".png"。
  pub async fn stage<R>(&self, mut body: R, suffix: &str) -> Result<StagedAsset, StagingError>
  where
    R: AsyncRead + Unpin,
  {
    let suffix = if suffix.is_empty() {
      DEFAULT_SUFFIX
    } else {
      suffix
    };

    let file = tempfile::Builder::new()
      .prefix(STAGING_PREFIX)
      .suffix(suffix)
      .tempfile_in(&self.directory)?;
    let (file, guard) = file.into_parts();

    // 先取得所有权，后续任何失败都会在丢弃时删除文件
    let mut asset = StagedAsset {
      path: guard.to_path_buf(),
      suffix: suffix.to_string(),
      size: 0,
      guard: Some(guard),
    };

    let mut writer = tokio::fs::File::from_std(file);
    asset.size = tokio::io::copy(&mut body, &mut writer).await?;
    writer.flush().await?;

    debug!(
      "上传内容已暂存: {} ({} 字节)",
      asset.path.display(),
      asset.size
    );
    Ok(asset)
  }

  pub fn release(&self, mut asset: StagedAsset) {
    asset.release();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[tokio::test]
  async fn staged_file_uses_suffix_and_is_removed_on_release() {
    let dir = tempfile::tempdir().unwrap();
    let store = StagingStore::open(dir.path()).unwrap();

    let mut asset = store.stage(&b"hello"[..], ".jpg").await.unwrap();
    let path = asset.path().to_path_buf();
    assert!(path.exists());
    assert!(path.to_string_lossy().ends_with(".jpg"));
    assert_eq!(asset.size(), 5);
    assert_eq!(std::fs::read(&path).unwrap(), b"hello");

    asset.release();
    assert!(!path.exists());
    // 再次释放不应出错
    asset.release();
    assert!(asset.is_released());
  }

  #[tokio::test]
  async fn empty_suffix_falls_back_to_png() {
    let dir = tempfile::tempdir().unwrap();
    let store = StagingStore::open(dir.path()).unwrap();

    let asset = store.stage(&b"x"[..], "").await.unwrap();
    assert_eq!(asset.suffix(), ".png");
    assert!(asset.path().to_string_lossy().ends_with(".png"));
  }

  #[tokio::test]
  async fn dropping_the_asset_removes_the_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = StagingStore::open(dir.path()).unwrap();

    let asset = store.stage(&b"data"[..], ".png").await.unwrap();
    let path = asset.path().to_path_buf();
    drop(asset);
    assert!(!path.exists());
  }

  #[tokio::test]
  async fn release_tolerates_externally_removed_file() {
    let dir = tempfile::tempdir().unwrap();
    let store = StagingStore::open(dir.path()).unwrap();

    let asset = store.stage(&b"data"[..], ".png").await.unwrap();
    std::fs::remove_file(asset.path()).unwrap();
    store.release(asset);
  }
}
