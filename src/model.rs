// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/model.rs - 模型
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

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::frame::DecodedImage;

mod labels;
pub use self::labels::LabelTable;

#[cfg(feature = "model_onnx")]
mod yolo_onnx;
#[cfg(feature = "model_onnx")]
pub use self::yolo_onnx::{OnnxYolo, OnnxYoloBuilder};

#[derive(Error, Debug)]
pub enum ModelError {
  #[error("模型文件不存在: {0}")]
  ModelNotFound(String),
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型无效: {0}")]
  ModelInvalid(String),
  #[error("推理运行时错误: {0}")]
  RuntimeError(String),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("不支持的模型方案: {0}")]
  SchemeMismatch(String),
}

/// 模型输出的单个检测框，坐标为原图像素坐标
#[derive(Debug, Clone, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

/// 检测器能力
///
/// 模型与类别表一同加载，进程内只加载一次，之后只读共享。
/// `predict` 为阻塞调用，由推理执行器放到工作线程上运行。
pub trait Detector: Send + Sync {
  fn predict(&self, image: &DecodedImage) -> Result<DetectResult, ModelError>;

  fn labels(&self) -> &LabelTable;

  /// 用于日志与健康检查的描述
  fn describe(&self) -> String;

  /// 可同时执行的 `predict` 调用数，推理执行器据此限制工作线程
  fn max_concurrency(&self) -> usize {
    usize::MAX
  }
}

/// 单个缺陷检测结果
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  /// [x1, y1, x2, y2]，原图像素坐标
  pub bounding_box: [f32; 4],
  pub confidence: f32,
  pub class_id: u32,
  pub class_name: String,
}

/// 按模型输出顺序排列的检测结果，可以为空
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DetectionSet {
  items: Vec<Detection>,
}

impl DetectionSet {
  pub fn len(&self) -> usize {
    self.items.len()
  }

  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn iter(&self) -> std::slice::Iter<'_, Detection> {
    self.items.iter()
  }

  pub fn as_slice(&self) -> &[Detection] {
    &self.items
  }
}

impl From<Vec<Detection>> for DetectionSet {
  fn from(items: Vec<Detection>) -> Self {
    Self { items }
  }
}

impl<'a> IntoIterator for &'a DetectionSet {
  type Item = &'a Detection;
  type IntoIter = std::slice::Iter<'a, Detection>;

  fn into_iter(self) -> Self::IntoIter {
    self.items.iter()
  }
}

/// 解析模型位置：既接受 `onnx:///path/best.onnx?conf=0.25` 形式的 URL，
/// 也接受普通文件路径。
pub fn parse_model_location(location: &str) -> Result<Url, String> {
  match Url::parse(location) {
    // 单字母方案视为 Windows 盘符
    Ok(url) if url.scheme().len() > 1 => Ok(url),
    _ => {
      let path = std::path::absolute(location).map_err(|e| e.to_string())?;
      Url::from_file_path(&path).map_err(|_| format!("无效的模型路径: {}", location))
    }
  }
}

/// 根据 URL 方案加载检测器
pub fn load_detector(url: &Url) -> Result<Arc<dyn Detector>, ModelError> {
  match url.scheme() {
    #[cfg(feature = "model_onnx")]
    "onnx" | "file" => {
      use crate::FromUrl;
      let detector = OnnxYoloBuilder::from_url(url)?.build()?;
      Ok(Arc::new(detector))
    }
    other => Err(ModelError::SchemeMismatch(other.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn plain_path_becomes_file_url() {
    let url = parse_model_location("models/best.onnx").unwrap();
    assert_eq!(url.scheme(), "file");
    assert!(url.path().ends_with("models/best.onnx"));
  }

  #[test]
  fn explicit_scheme_is_kept() {
    let url = parse_model_location("onnx:///opt/models/best.onnx?conf=0.3").unwrap();
    assert_eq!(url.scheme(), "onnx");
    assert_eq!(url.path(), "/opt/models/best.onnx");
  }

  #[test]
  fn unknown_scheme_is_rejected() {
    let url = Url::parse("rknn:///opt/models/best.rknn").unwrap();
    assert!(matches!(
      load_detector(&url),
      Err(ModelError::SchemeMismatch(s)) if s == "rknn"
    ));
  }

  #[test]
  fn detection_set_serializes_as_flat_list() {
    let set = DetectionSet::from(vec![Detection {
      bounding_box: [1.0, 2.0, 3.0, 4.0],
      confidence: 0.5,
      class_id: 2,
      class_name: "short".into(),
    }]);
    let json = serde_json::to_value(&set).unwrap();
    assert_eq!(
      json,
      serde_json::json!([{
        "bounding_box": [1.0, 2.0, 3.0, 4.0],
        "confidence": 0.5,
        "class_id": 2,
        "class_name": "short"
      }])
    );
  }
}
