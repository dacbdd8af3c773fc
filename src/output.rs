// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/output.rs - 输出定义
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

use std::io::Cursor;
use std::path::Path;

use image::{ImageFormat, RgbImage};
use thiserror::Error;
use tracing::debug;

use crate::model::DetectionSet;

mod draw;
pub use self::draw::{Annotator, FontSource, LabelFont};

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("图像编码错误: {0}")]
  EncodeError(#[from] image::ImageError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  SerializeError(#[from] serde_json::Error),
  #[error("字体无效: {0}")]
  FontError(#[from] ab_glyph::InvalidFont),
}

/// 绘制了检测结果的图像副本
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedImage {
  image: RgbImage,
}

impl From<RgbImage> for AnnotatedImage {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl AnnotatedImage {
  pub fn as_rgb_image(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_rgb_image(self) -> RgbImage {
    self.image
  }

  pub fn to_png(&self) -> Result<Vec<u8>, OutputError> {
    let mut buffer = Cursor::new(Vec::new());
    self.image.write_to(&mut buffer, ImageFormat::Png)?;
    let bytes = buffer.into_inner();
    debug!("PNG 编码完成: {} 字节", bytes.len());
    Ok(bytes)
  }

  /// 保存到文件，格式由扩展名决定
  pub fn save(&self, path: impl AsRef<Path>) -> Result<(), OutputError> {
    let path = path.as_ref();
    self.image.save(path)?;
    debug!("保存图像到: {}", path.display());
    Ok(())
  }
}

/// 将检测结果以 JSON 形式写入文件
pub fn write_detections(detections: &DetectionSet, path: impl AsRef<Path>) -> Result<(), OutputError> {
  let json = serde_json::to_string_pretty(detections)?;
  std::fs::write(path.as_ref(), json)?;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use image::Rgb;

  #[test]
  fn png_round_trip_preserves_pixels() {
    let image = RgbImage::from_pixel(6, 4, Rgb([12, 34, 56]));
    let bytes = AnnotatedImage::from(image.clone()).to_png().unwrap();
    assert_eq!(&bytes[1..4], b"PNG");
    let decoded = image::load_from_memory(&bytes).unwrap().into_rgb8();
    assert_eq!(decoded, image);
  }

  #[test]
  fn detections_are_written_as_json() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("out.json");
    write_detections(&DetectionSet::default(), &path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "[]");
  }
}
