// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/output/draw.rs - 检测结果可视化
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

use ab_glyph::{FontArc, PxScale};
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_filled_rect_mut, draw_hollow_rect_mut, draw_text_mut, text_size};
use imageproc::rect::Rect;
use tracing::{info, warn};

use super::{AnnotatedImage, OutputError};
use crate::frame::DecodedImage;
use crate::model::{Detection, DetectionSet};

static EMBEDDED_FONT: &[u8] = include_bytes!("../../assets/DejaVuSans.ttf"); // default font

// 文本渲染常量
const LABEL_FONT_SIZE: f32 = 16.0;
const LABEL_PADDING: i32 = 2;
const BOX_THICKNESS: i32 = 2;
const BOX_COLOR: [u8; 3] = [255, 0, 0]; // 红色
const TEXT_COLOR: [u8; 3] = [255, 255, 255]; // 白色

/// 标签字体来源
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FontSource {
  Configured(PathBuf),
  Embedded,
}

/// 标签字体，进程内只解析一次
#[derive(Clone)]
pub struct LabelFont {
  font: FontArc,
  scale: PxScale,
  source: FontSource,
}

impl LabelFont {
  /// 程序内置的 DejaVu Sans
  pub fn embedded() -> Result<Self, OutputError> {
    Ok(Self {
      font: FontArc::try_from_slice(EMBEDDED_FONT)?,
      scale: PxScale::from(LABEL_FONT_SIZE),
      source: FontSource::Embedded,
    })
  }

  /// 优先加载指定的字体文件，失败时退回内置字体
  pub fn resolve(preferred: Option<&Path>) -> Result<Self, OutputError> {
    let Some(path) = preferred else {
      info!("未指定标注字体，使用内置字体");
      return Self::embedded();
    };
    let font = std::fs::read(path)
      .map_err(|e| e.to_string())
      .and_then(|data| FontArc::try_from_vec(data).map_err(|e| e.to_string()));
    match font {
      Ok(font) => {
        info!("加载标注字体: {}", path.display());
        Ok(Self {
          font,
          scale: PxScale::from(LABEL_FONT_SIZE),
          source: FontSource::Configured(path.to_path_buf()),
        })
      }
      Err(e) => {
        warn!("无法加载字体 {}: {}，使用内置字体", path.display(), e);
        Self::embedded()
      }
    }
  }

  pub fn source(&self) -> &FontSource {
    &self.source
  }

  fn measure(&self, text: &str) -> (u32, u32) {
    text_size(self.scale, &self.font, text)
  }

  fn draw(&self, image: &mut RgbImage, color: Rgb<u8>, x: i32, y: i32, text: &str) {
    draw_text_mut(image, color, x, y, self.scale, &self.font, text);
  }
}

/// 在图像副本上绘制检测框与标签
pub struct Annotator {
  font: LabelFont,
  box_color: Rgb<u8>,
  text_color: Rgb<u8>,
}

impl Annotator {
  pub fn new(font: LabelFont) -> Self {
    Self {
      font,
      box_color: Rgb(BOX_COLOR),
      text_color: Rgb(TEXT_COLOR),
    }
  }

  pub fn font(&self) -> &LabelFont {
    &self.font
  }

  /// 原图不会被修改；没有检测结果时输出与原图一致
  pub fn annotate(&self, image: &DecodedImage, detections: &DetectionSet) -> AnnotatedImage {
    let mut canvas = image.as_rgb_image().clone();
    for detection in detections {
      self.draw_bbox_with_label(&mut canvas, detection);
    }
    AnnotatedImage::from(canvas)
  }

  // bbox 为原图像素坐标 [x_min, y_min, x_max, y_max]
  fn draw_bbox_with_label(&self, image: &mut RgbImage, detection: &Detection) {
    let bbox = &detection.bounding_box;
    let x_min = bbox[0].floor() as i32;
    let y_min = bbox[1].floor() as i32;
    let x_max = bbox[2].ceil() as i32;
    let y_max = bbox[3].ceil() as i32;
    let (box_w, box_h) = ((x_max - x_min).max(1), (y_max - y_min).max(1));

    // 绘制边框（加粗为2像素）
    for t in 0..BOX_THICKNESS {
      let (w, h) = (box_w - 2 * t, box_h - 2 * t);
      if w <= 0 || h <= 0 {
        break;
      }
      let rect = Rect::at(x_min + t, y_min + t).of_size(w as u32, h as u32);
      draw_hollow_rect_mut(image, rect, self.box_color);
    }

    // 标签位于边框上方，超出画布的部分直接裁剪
    let label = format!("{}: {:.2}", detection.class_name, detection.confidence);
    let (text_w, text_h) = self.font.measure(&label);
    if text_w == 0 || text_h == 0 {
      return;
    }
    let tag_w = text_w + 2 * LABEL_PADDING as u32;
    let tag_h = text_h + 2 * LABEL_PADDING as u32;
    let tag_x = x_min;
    let tag_y = y_min - tag_h as i32;

    draw_filled_rect_mut(
      image,
      Rect::at(tag_x, tag_y).of_size(tag_w, tag_h),
      self.box_color,
    );
    self.font.draw(
      image,
      self.text_color,
      tag_x + LABEL_PADDING,
      tag_y + LABEL_PADDING,
      &label,
    );
  }
}
