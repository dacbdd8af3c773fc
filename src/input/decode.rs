// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/input/decode.rs - 暂存文件解码
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

use image::ImageReader;
use thiserror::Error;
use tracing::{debug, error};

use super::StagedAsset;
use crate::frame::DecodedImage;

#[derive(Error, Debug)]
pub enum DecodeError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像解码错误: {0}")]
  ImageLoadError(#[from] image::ImageError),
}

/// 解码暂存文件为 RGB 图像
///
/// 格式优先根据文件内容判断，扩展名作为提示。
pub fn decode(asset: &StagedAsset) -> Result<DecodedImage, DecodeError> {
  let reader = ImageReader::open(asset.path())?.with_guessed_format()?;
  let image = reader.decode().map_err(|e| {
    error!("无法加载图像: {}: {}", asset.path().display(), e);
    e
  })?;

  let image = image.into_rgb8();
  debug!("图像解码完成: {}x{}", image.width(), image.height());
  Ok(DecodedImage::from(image))
}
