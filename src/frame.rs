// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/frame.rs - 解码后的图像帧定义
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

use image::RgbImage;

const RGB_CHANNELS: usize = 3;

/// 解码后的图像，HWC 排列，RGB 通道顺序
///
/// 每个请求独占一份，仅存在于内存中。
#[derive(Debug, Clone, PartialEq)]
pub struct DecodedImage {
  image: RgbImage,
}

impl From<RgbImage> for DecodedImage {
  fn from(image: RgbImage) -> Self {
    Self { image }
  }
}

impl DecodedImage {
  pub fn height(&self) -> u32 {
    self.image.height()
  }

  pub fn width(&self) -> u32 {
    self.image.width()
  }

  pub fn channels(&self) -> usize {
    RGB_CHANNELS
  }

  /// 原始像素数据（HWC）
  pub fn as_hwc(&self) -> &[u8] {
    self.image.as_raw()
  }

  pub fn as_rgb_image(&self) -> &RgbImage {
    &self.image
  }

  pub fn into_rgb_image(self) -> RgbImage {
    self.image
  }
}
