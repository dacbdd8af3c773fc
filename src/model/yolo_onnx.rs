// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/model/yolo_onnx.rs - ONNX Runtime 上的 YOLO 检测模型
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

use std::fmt::Display;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use image::{Rgb, RgbImage, imageops::FilterType};
use ort::session::{Session, builder::GraphOptimizationLevel};
use ort::value::Tensor;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{DetectItem, DetectResult, Detector, LabelTable, ModelError};
use crate::{FromUrl, FromUrlWithScheme, frame::DecodedImage};

const YOLO_NUM_INPUTS: usize = 1;
const YOLO_INPUT_SIZE: u32 = 640;
const YOLO_OBJECT_THRESH: f32 = 0.25;
const YOLO_NMS_THRESH: f32 = 0.45;
const YOLO_MAX_DETECTIONS: usize = 300;
const YOLO_BOX_CHANNELS: usize = 4;
const YOLO_SESSIONS: usize = 1;
const LETTERBOX_FILL: u8 = 114;

fn runtime_error<E: Display>(e: E) -> ModelError {
  ModelError::RuntimeError(e.to_string())
}

/// 后处理参数
#[derive(Debug, Clone, Copy)]
struct PostprocessParams {
  confidence: f32,
  nms_threshold: f32,
  max_detections: usize,
}

/// 等比缩放并居中填充后的输入
struct Letterbox {
  tensor: Vec<f32>,
  scale: f32,
  pad_x: f32,
  pad_y: f32,
  width: f32,
  height: f32,
}

pub struct OnnxYolo {
  /// 每个会话同一时刻只执行一次前向计算
  sessions: Box<[Mutex<Session>]>,
  next_session: AtomicUsize,
  labels: LabelTable,
  input_size: u32,
  params: PostprocessParams,
  model_path: PathBuf,
}

pub struct OnnxYoloBuilder {
  model_path: PathBuf,
  labels_path: Option<PathBuf>,
  input_size: u32,
  params: PostprocessParams,
  intra_threads: Option<usize>,
  sessions: usize,
}

impl FromUrlWithScheme for OnnxYoloBuilder {
  const SCHEME: &'static str = "onnx";
}

fn parse_query<T>(key: &str, value: &str) -> Result<T, ModelError>
where
  T: FromStr,
  T::Err: Display,
{
  value
    .parse()
    .map_err(|e| ModelError::ModelPathError(format!("模型参数 {}={} 无效: {}", key, value, e)))
}

impl FromUrl for OnnxYoloBuilder {
  type Error = ModelError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    let model_path = match url.scheme() {
      "file" => url
        .to_file_path()
        .map_err(|_| ModelError::ModelPathError(url.to_string()))?,
      scheme if scheme == Self::SCHEME => {
        let path = urlencoding::decode(url.path())
          .map_err(|e| ModelError::ModelPathError(e.to_string()))?;
        PathBuf::from(path.into_owned())
      }
      other => {
        return Err(ModelError::ModelPathError(format!(
          "模型路径必须使用 {} 方案, 实际为 {}",
          Self::SCHEME,
          other
        )));
      }
    };

    let mut builder = OnnxYoloBuilder::new(model_path);
    for (key, value) in url.query_pairs() {
      match key.as_ref() {
        "conf" => builder.params.confidence = parse_query(&key, &value)?,
        "iou" => builder.params.nms_threshold = parse_query(&key, &value)?,
        "max_det" => builder.params.max_detections = parse_query(&key, &value)?,
        "imgsz" => builder.input_size = parse_query(&key, &value)?,
        "threads" => builder.intra_threads = Some(parse_query(&key, &value)?),
        "sessions" => builder.sessions = parse_query(&key, &value)?,
        "labels" => builder.labels_path = Some(PathBuf::from(value.as_ref())),
        _ => warn!("忽略未知的模型参数: {}={}", key, value),
      }
    }

    Ok(builder)
  }
}

impl OnnxYoloBuilder {
  pub fn new(model_path: impl Into<PathBuf>) -> Self {
    Self {
      model_path: model_path.into(),
      labels_path: None,
      input_size: YOLO_INPUT_SIZE,
      params: PostprocessParams {
        confidence: YOLO_OBJECT_THRESH,
        nms_threshold: YOLO_NMS_THRESH,
        max_detections: YOLO_MAX_DETECTIONS,
      },
      intra_threads: None,
      sessions: YOLO_SESSIONS,
    }
  }

  pub fn labels(mut self, path: impl Into<PathBuf>) -> Self {
    self.labels_path = Some(path.into());
    self
  }

  pub fn confidence(mut self, confidence: f32) -> Self {
    self.params.confidence = confidence;
    self
  }

  pub fn intra_threads(mut self, threads: usize) -> Self {
    self.intra_threads = Some(threads);
    self
  }

  pub fn input_size(mut self, size: u32) -> Self {
    self.input_size = size;
    self
  }

  /// 推理会话数量，即可同时进行的前向计算数
  pub fn sessions(mut self, sessions: usize) -> Self {
    self.sessions = sessions;
    self
  }

  fn check_params(&self) -> Result<(), ModelError> {
    if self.input_size == 0 {
      return Err(ModelError::ModelPathError("模型输入尺寸 imgsz 必须大于 0".to_string()));
    }
    if self.sessions == 0 {
      return Err(ModelError::ModelPathError("推理会话数 sessions 必须大于 0".to_string()));
    }
    Ok(())
  }

  fn create_session(&self) -> Result<Session, ModelError> {
    let mut builder = Session::builder()
      .map_err(runtime_error)?
      .with_optimization_level(GraphOptimizationLevel::Level3)
      .map_err(runtime_error)?;
    if let Some(threads) = self.intra_threads {
      builder = builder.with_intra_threads(threads).map_err(runtime_error)?;
    }
    let session = builder
      .commit_from_file(&self.model_path)
      .map_err(|e| ModelError::ModelInvalid(e.to_string()))?;

    if session.inputs.len() != YOLO_NUM_INPUTS {
      error!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLO_NUM_INPUTS,
        session.inputs.len()
      );
      return Err(ModelError::ModelInvalid(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        YOLO_NUM_INPUTS,
        session.inputs.len()
      )));
    }
    debug!("模型输入数量: {}", session.inputs.len());
    debug!("模型输出数量: {}", session.outputs.len());
    Ok(session)
  }

  pub fn build(self) -> Result<OnnxYolo, ModelError> {
    self.check_params()?;
    info!("加载模型文件: {}", self.model_path.display());
    if !self.model_path.is_file() {
      error!("模型文件不存在: {}", self.model_path.display());
      return Err(ModelError::ModelNotFound(
        self.model_path.display().to_string(),
      ));
    }

    let labels = match &self.labels_path {
      Some(path) => LabelTable::from_file(path)?,
      None => LabelTable::pcb_defects(),
    };

    info!("创建 {} 个 ONNX Runtime 推理会话", self.sessions);
    let sessions = (0..self.sessions)
      .map(|_| self.create_session().map(Mutex::new))
      .collect::<Result<Box<[_]>, _>>()?;
    info!("模型加载完成，类别数: {}", labels.len());

    Ok(OnnxYolo {
      sessions,
      next_session: AtomicUsize::new(0),
      labels,
      input_size: self.input_size,
      params: self.params,
      model_path: self.model_path,
    })
  }
}

impl OnnxYolo {
  /// 优先取空闲会话，全部忙碌时按轮转顺序等待
  fn acquire_session(&self) -> Result<std::sync::MutexGuard<'_, Session>, ModelError> {
    let start = self.next_session.fetch_add(1, Ordering::Relaxed);
    let count = self.sessions.len();
    for offset in 0..count {
      if let Ok(guard) = self.sessions[(start + offset) % count].try_lock() {
        return Ok(guard);
      }
    }
    self.sessions[start % count]
      .lock()
      .map_err(|_| ModelError::RuntimeError("推理会话锁已损坏".to_string()))
  }

  /// 等比缩放到模型输入尺寸，空白处以灰色填充，输出 NCHW 归一化张量
  fn letterbox(&self, image: &RgbImage) -> Letterbox {
    let size = self.input_size;
    let (width, height) = image.dimensions();
    let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
    let new_w = ((width as f32 * scale).round() as u32).clamp(1, size);
    let new_h = ((height as f32 * scale).round() as u32).clamp(1, size);

    let resized = image::imageops::resize(image, new_w, new_h, FilterType::Triangle);
    let mut canvas = RgbImage::from_pixel(size, size, Rgb([LETTERBOX_FILL; 3]));
    let pad_x = (size - new_w) / 2;
    let pad_y = (size - new_h) / 2;
    image::imageops::overlay(&mut canvas, &resized, pad_x as i64, pad_y as i64);

    let plane = (size * size) as usize;
    let mut tensor = vec![0f32; plane * 3];
    for (x, y, pixel) in canvas.enumerate_pixels() {
      let idx = (y * size + x) as usize;
      tensor[idx] = pixel[0] as f32 / 255.0;
      tensor[plane + idx] = pixel[1] as f32 / 255.0;
      tensor[2 * plane + idx] = pixel[2] as f32 / 255.0;
    }

    Letterbox {
      tensor,
      scale,
      pad_x: pad_x as f32,
      pad_y: pad_y as f32,
      width: width as f32,
      height: height as f32,
    }
  }
}

impl Detector for OnnxYolo {
  fn predict(&self, image: &DecodedImage) -> Result<DetectResult, ModelError> {
    let size = self.input_size as i64;
    let Letterbox {
      tensor,
      scale,
      pad_x,
      pad_y,
      width,
      height,
    } = self.letterbox(image.as_rgb_image());

    debug!("设置模型输入");
    let input = Tensor::from_array((vec![1i64, 3, size, size], tensor)).map_err(runtime_error)?;

    let mut session = self.acquire_session()?;

    debug!("执行模型推理");
    let outputs = session.run(ort::inputs![input]).map_err(runtime_error)?;
    let (shape, data) = outputs[0]
      .try_extract_tensor::<f32>()
      .map_err(runtime_error)?;
    let dims: Vec<usize> = shape.iter().map(|&d| d as usize).collect();

    debug!("后处理模型输出: {:?}", dims);
    let frame = Frame {
      scale,
      pad_x,
      pad_y,
      width,
      height,
    };
    let items = decode_output(&dims, data, &frame, &self.params)?;
    debug!("检测到 {} 个目标", items.len());

    Ok(DetectResult::from(items))
  }

  fn labels(&self) -> &LabelTable {
    &self.labels
  }

  fn describe(&self) -> String {
    format!("onnx-yolo:{}", self.model_path.display())
  }

  fn max_concurrency(&self) -> usize {
    self.sessions.len()
  }
}

/// 网络输入坐标到原图坐标的映射
#[derive(Debug, Clone, Copy)]
struct Frame {
  scale: f32,
  pad_x: f32,
  pad_y: f32,
  width: f32,
  height: f32,
}

/// 解码 YOLOv8 风格的输出 `[1, 4 + nc, N]`（或转置后的 `[1, N, 4 + nc]`）
fn decode_output(
  dims: &[usize],
  data: &[f32],
  frame: &Frame,
  params: &PostprocessParams,
) -> Result<Vec<DetectItem>, ModelError> {
  let &[batch, d1, d2] = dims else {
    return Err(ModelError::ModelInvalid(format!(
      "预期三维输出，实际为 {:?}",
      dims
    )));
  };
  // 通道数总是小于候选框数
  let (channels, candidates, channels_first) = if d1 <= d2 {
    (d1, d2, true)
  } else {
    (d2, d1, false)
  };
  if batch != 1 || channels <= YOLO_BOX_CHANNELS || data.len() < channels * candidates {
    return Err(ModelError::ModelInvalid(format!(
      "输出形状不符合预期: {:?}",
      dims
    )));
  }

  let at = |c: usize, i: usize| {
    if channels_first {
      data[c * candidates + i]
    } else {
      data[i * channels + c]
    }
  };

  let mut items = Vec::new();
  for i in 0..candidates {
    let (class_id, score) = (YOLO_BOX_CHANNELS..channels)
      .map(|c| (c - YOLO_BOX_CHANNELS, at(c, i)))
      .fold((0usize, f32::MIN), |best, cur| {
        if cur.1 > best.1 { cur } else { best }
      });
    if score < params.confidence {
      continue;
    }

    let (cx, cy, w, h) = (at(0, i), at(1, i), at(2, i), at(3, i));
    let to_x = |x: f32| ((x - frame.pad_x) / frame.scale).clamp(0.0, frame.width);
    let to_y = |y: f32| ((y - frame.pad_y) / frame.scale).clamp(0.0, frame.height);
    let bbox = [
      to_x(cx - w / 2.0),
      to_y(cy - h / 2.0),
      to_x(cx + w / 2.0),
      to_y(cy + h / 2.0),
    ];
    if bbox[0] >= bbox[2] || bbox[1] >= bbox[3] {
      continue;
    }

    items.push(DetectItem {
      class_id: class_id as u32,
      score: score.clamp(0.0, 1.0),
      bbox,
    });
  }

  let mut items = nms(items, params.nms_threshold);
  items.truncate(params.max_detections);
  Ok(items)
}

/// 非极大值抑制，按类别分别进行
fn nms(mut items: Vec<DetectItem>, threshold: f32) -> Vec<DetectItem> {
  // 按置信度降序排序
  items.sort_by(|a, b| b.score.total_cmp(&a.score));

  let mut result = Vec::new();
  while !items.is_empty() {
    let best = items.remove(0);
    items.retain(|item| item.class_id != best.class_id || iou(&best.bbox, &item.bbox) < threshold);
    result.push(best);
  }

  result
}

/// 计算两个边界框的 IoU
fn iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let x1 = a[0].max(b[0]);
  let y1 = a[1].max(b[1]);
  let x2 = a[2].min(b[2]);
  let y2 = a[3].min(b[3]);

  let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
  let area_a = (a[2] - a[0]) * (a[3] - a[1]);
  let area_b = (b[2] - b[0]) * (b[3] - b[1]);
  let union = area_a + area_b - intersection;

  if union > 0.0 {
    intersection / union
  } else {
    0.0
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const PARAMS: PostprocessParams = PostprocessParams {
    confidence: 0.25,
    nms_threshold: 0.45,
    max_detections: 300,
  };

  // 640x640 输入对应 1280x640 原图：缩放 0.5，上下各填充 160
  const FRAME: Frame = Frame {
    scale: 0.5,
    pad_x: 0.0,
    pad_y: 160.0,
    width: 1280.0,
    height: 640.0,
  };

  /// 按 `[1, 4 + nc, N]` 排列候选框
  fn channels_first(candidates: &[[f32; 6]]) -> (Vec<usize>, Vec<f32>) {
    let n = candidates.len();
    let mut data = vec![0f32; 6 * n];
    for (i, cand) in candidates.iter().enumerate() {
      for (c, v) in cand.iter().enumerate() {
        data[c * n + i] = *v;
      }
    }
    (vec![1, 6, n], data)
  }

  #[test]
  fn boxes_are_mapped_back_to_original_pixels() {
    let (dims, data) = channels_first(&[[320.0, 320.0, 100.0, 50.0, 0.9, 0.1]]);
    let items = decode_output(&dims, &data, &FRAME, &PARAMS).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_id, 0);
    assert_eq!(items[0].bbox, [540.0, 270.0, 740.0, 370.0]);
  }

  #[test]
  fn boxes_near_the_border_are_clamped() {
    let (dims, data) = channels_first(&[[10.0, 170.0, 60.0, 40.0, 0.1, 0.8]]);
    let items = decode_output(&dims, &data, &FRAME, &PARAMS).unwrap();
    assert_eq!(items.len(), 1);
    let [x1, y1, x2, y2] = items[0].bbox;
    assert_eq!((x1, y1), (0.0, 0.0));
    assert!(x2 > x1 && y2 > y1);
    assert!(x2 <= FRAME.width && y2 <= FRAME.height);
  }

  #[test]
  fn low_scores_are_dropped() {
    let (dims, data) = channels_first(&[[320.0, 320.0, 100.0, 50.0, 0.1, 0.2]]);
    assert!(decode_output(&dims, &data, &FRAME, &PARAMS).unwrap().is_empty());
  }

  #[test]
  fn transposed_layout_is_accepted() {
    let n = 8;
    let mut data = vec![0f32; n * 6];
    data[..6].copy_from_slice(&[320.0, 320.0, 100.0, 50.0, 0.0, 0.7]);
    let items = decode_output(&[1, n, 6], &data, &FRAME, &PARAMS).unwrap();
    assert_eq!(items.len(), 1);
    assert_eq!(items[0].class_id, 1);
  }

  #[test]
  fn overlapping_boxes_of_same_class_are_suppressed() {
    let (dims, data) = channels_first(&[
      [320.0, 320.0, 100.0, 100.0, 0.6, 0.0],
      [322.0, 322.0, 100.0, 100.0, 0.9, 0.0],
      [322.0, 322.0, 100.0, 100.0, 0.0, 0.5],
    ]);
    let items = decode_output(&dims, &data, &FRAME, &PARAMS).unwrap();
    assert_eq!(items.len(), 2);
    assert_eq!(items[0].score, 0.9);
    assert_eq!(items[1].class_id, 1);
  }

  #[test]
  fn malformed_output_is_rejected() {
    assert!(decode_output(&[1, 4], &[0.0; 4], &FRAME, &PARAMS).is_err());
    assert!(decode_output(&[1, 3, 10], &[0.0; 30], &FRAME, &PARAMS).is_err());
  }

  #[test]
  fn query_parameters_configure_the_builder() {
    let url = Url::parse("onnx:///opt/models/best%20v2.onnx?conf=0.4&imgsz=320&labels=/opt/l.txt")
      .unwrap();
    let builder = OnnxYoloBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path, PathBuf::from("/opt/models/best v2.onnx"));
    assert_eq!(builder.params.confidence, 0.4);
    assert_eq!(builder.input_size, 320);
    assert_eq!(builder.labels_path, Some(PathBuf::from("/opt/l.txt")));
  }

  #[test]
  fn sessions_default_to_one_and_are_configurable() {
    assert_eq!(OnnxYoloBuilder::new("/opt/best.onnx").sessions, 1);
    let url = Url::parse("onnx:///opt/best.onnx?sessions=3").unwrap();
    assert_eq!(OnnxYoloBuilder::from_url(&url).unwrap().sessions, 3);
  }

  #[test]
  fn zero_input_size_is_rejected_before_loading() {
    let url = Url::parse("onnx:///nonexistent/best.onnx?imgsz=0").unwrap();
    let builder = OnnxYoloBuilder::from_url(&url).unwrap();
    assert!(matches!(builder.build(), Err(ModelError::ModelPathError(msg)) if msg.contains("imgsz")));

    let builder = OnnxYoloBuilder::new("/nonexistent/best.onnx").sessions(0);
    assert!(matches!(builder.build(), Err(ModelError::ModelPathError(msg)) if msg.contains("sessions")));
  }

  #[test]
  fn missing_model_file_is_fatal() {
    let builder = OnnxYoloBuilder::new("/nonexistent/best.onnx");
    assert!(matches!(builder.build(), Err(ModelError::ModelNotFound(_))));
  }
}
