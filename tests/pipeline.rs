// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// tests/pipeline.rs - 推理流水线集成测试
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

mod common;

use std::sync::Arc;
use std::time::{Duration, Instant};

use image::RgbImage;

use shanan_pcb::cache::ResultSource;
use shanan_pcb::executor::InferenceError;
use shanan_pcb::input::{UploadDescriptor, ValidationError};
use shanan_pcb::pipeline::{OutputMode, PipelineError};

use common::{ScriptedDetector, item, pipeline, pipeline_with_capacity, png, staged_files};

fn upload<'a>(name: &str, mime: &str, bytes: &'a [u8]) -> UploadDescriptor<&'a [u8]> {
  UploadDescriptor::from_bytes(bytes)
    .with_filename(name)
    .with_content_type(mime)
}

#[tokio::test]
async fn black_image_yields_no_detections_and_an_identical_annotation() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::empty());
  let pipeline = pipeline(detector.clone(), dir.path());
  let bytes = png(50, 50, [0, 0, 0]);

  let output = pipeline
    .run(upload("board.png", "image/png", &bytes), OutputMode::Annotated)
    .await
    .unwrap();

  assert!(output.detections.is_empty());
  assert!(!output.cache_hit());
  assert_eq!(output.file_size, bytes.len() as u64);
  let annotated = output.annotated.expect("annotated image");
  assert_eq!(annotated.as_rgb_image(), &RgbImage::new(50, 50));
  assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn identical_uploads_are_served_from_cache() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::returning(vec![item(
    0,
    0.9,
    [5.0, 5.0, 20.0, 20.0],
  )]));
  let pipeline = pipeline(detector.clone(), dir.path());
  let bytes = png(32, 32, [10, 200, 30]);

  let first = pipeline
    .run(upload("a.png", "image/png", &bytes), OutputMode::Detections)
    .await
    .unwrap();
  // 文件名不同但像素相同
  let second = pipeline
    .run(upload("b.png", "image/png", &bytes), OutputMode::Detections)
    .await
    .unwrap();

  assert_eq!(first.source, ResultSource::Inferred);
  assert_eq!(second.source, ResultSource::Cache);
  assert_eq!(first.detections, second.detections);
  assert_eq!(detector.calls(), 1);
  assert_eq!(pipeline.stats().inferences, 1);
  assert_eq!(pipeline.stats().completed, 2);
}

#[tokio::test]
async fn text_upload_is_rejected_before_staging() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::empty());
  let pipeline = pipeline(detector.clone(), dir.path());

  let err = pipeline
    .run(
      upload("board.txt", "text/plain", b"not an image"),
      OutputMode::Detections,
    )
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    PipelineError::Validation(ValidationError::UnsupportedExtension(ref ext)) if ext == ".txt"
  ));
  assert_eq!(err.reason(), "UnsupportedExtension");
  assert_eq!(staged_files(dir.path()), 0);
  assert_eq!(detector.calls(), 0);
  assert_eq!(pipeline.stats().failed, 1);
}

#[tokio::test]
async fn garbage_png_fails_to_decode_and_is_cleaned_up() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::empty());
  let pipeline = pipeline(detector.clone(), dir.path());

  let err = pipeline
    .run(
      upload("board.png", "image/png", b"\x00\x01garbage bytes"),
      OutputMode::Detections,
    )
    .await
    .unwrap_err();

  assert!(matches!(err, PipelineError::Decode(_)));
  assert!(!err.is_internal());
  assert_eq!(staged_files(dir.path()), 0);
  assert_eq!(detector.calls(), 0);
}

#[tokio::test]
async fn boxes_near_the_border_are_clamped() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::returning(vec![
    item(3, 0.8, [-10.0, -5.0, 60.0, 55.0]),
    item(5, 0.6, [40.0, 10.0, 49.0, 30.0]),
  ]));
  let pipeline = pipeline(detector, dir.path());
  let bytes = png(50, 50, [90, 90, 90]);

  let output = pipeline
    .run(upload("edge.png", "image/png", &bytes), OutputMode::Annotated)
    .await
    .unwrap();

  assert_eq!(output.detections.len(), 2);
  for det in output.detections.iter() {
    let [x1, y1, x2, y2] = det.bounding_box;
    assert!(x1 < x2 && y1 < y2);
    assert!(x1 >= 0.0 && y1 >= 0.0 && x2 <= 50.0 && y2 <= 50.0);
  }
  assert_eq!(output.detections.as_slice()[0].bounding_box, [0.0, 0.0, 50.0, 50.0]);
  assert_eq!(output.detections.as_slice()[0].class_name, "short");
  assert_eq!(output.detections.as_slice()[1].class_name, "spurious_copper");
}

#[tokio::test]
async fn cache_never_exceeds_capacity() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::empty());
  let pipeline = pipeline_with_capacity(detector.clone(), dir.path(), 3);

  for shade in 0..4u8 {
    let bytes = png(8, 8, [shade, shade, shade]);
    pipeline
      .run(upload("x.png", "image/png", &bytes), OutputMode::Detections)
      .await
      .unwrap();
  }

  assert_eq!(pipeline.cache().len(), 3);
  assert_eq!(detector.calls(), 4);
}

#[tokio::test]
async fn oversized_uploads_are_rejected() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::empty());
  let pipeline = pipeline(detector, dir.path());
  let limit = pipeline.validator().rules().max_file_size;

  let declared = UploadDescriptor::new(&b""[..], limit + 1).with_filename("big.png");
  let err = pipeline
    .run(declared, OutputMode::Detections)
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Validation(ValidationError::FileTooLarge { .. })
  ));

  // 声明大小偏小，实际内容超限
  let body = vec![0u8; limit as usize + 1];
  let understated = UploadDescriptor::new(&body[..], 10).with_filename("big.png");
  let err = pipeline
    .run(understated, OutputMode::Detections)
    .await
    .unwrap_err();
  assert_eq!(err.reason(), "FileTooLarge");
  assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn missing_metadata_defaults_to_jpeg() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::empty());
  let pipeline = pipeline(detector.clone(), dir.path());
  // PNG 内容以 .jpg 暂存，按内容识别格式
  let bytes = png(16, 16, [1, 2, 3]);

  let output = pipeline
    .run(UploadDescriptor::from_bytes(&bytes), OutputMode::Detections)
    .await
    .unwrap();
  assert!(output.detections.is_empty());
  assert_eq!(detector.calls(), 1);
}

#[tokio::test]
async fn filename_without_extension_is_staged_as_jpg() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::returning(vec![item(
    5,
    0.6,
    [2.0, 2.0, 10.0, 10.0],
  )]));
  let pipeline = pipeline(detector.clone(), dir.path());
  let bytes = png(16, 16, [8, 8, 8]);

  let output = pipeline
    .run(upload("board", "image/png", &bytes), OutputMode::Detections)
    .await
    .unwrap();
  assert_eq!(output.detections.as_slice()[0].class_name, "spurious_copper");
  assert_eq!(output.file_size, bytes.len() as u64);
  assert_eq!(detector.calls(), 1);
  assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test]
async fn inference_failures_are_internal_and_release_the_asset() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::failing());
  let pipeline = pipeline(detector, dir.path());
  let bytes = png(16, 16, [4, 5, 6]);

  let err = pipeline
    .run(upload("a.png", "image/png", &bytes), OutputMode::Detections)
    .await
    .unwrap_err();

  assert!(matches!(
    err,
    PipelineError::Inference(InferenceError::ModelFailure(_))
  ));
  assert!(err.is_internal());
  assert_eq!(staged_files(dir.path()), 0);
  // 失败结果不进入缓存
  assert!(pipeline.cache().is_empty());
}

#[tokio::test]
async fn unknown_class_ids_are_internal_errors() {
  let dir = tempfile::tempdir().unwrap();
  let detector = Arc::new(ScriptedDetector::returning(vec![item(
    42,
    0.9,
    [1.0, 1.0, 4.0, 4.0],
  )]));
  let pipeline = pipeline(detector, dir.path());
  let bytes = png(8, 8, [0, 0, 0]);

  let err = pipeline
    .run(upload("a.png", "image/png", &bytes), OutputMode::Detections)
    .await
    .unwrap_err();
  assert!(matches!(
    err,
    PipelineError::Inference(InferenceError::UnknownClass { class_id: 42, .. })
  ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_identical_uploads_run_inference_once() {
  let dir = tempfile::tempdir().unwrap();
  let detector =
    Arc::new(ScriptedDetector::empty().with_delay(Duration::from_millis(200)));
  let pipeline = Arc::new(pipeline(detector.clone(), dir.path()));
  let bytes = Arc::new(png(24, 24, [7, 7, 7]));

  let tasks: Vec<_> = (0..4)
    .map(|i| {
      let pipeline = pipeline.clone();
      let bytes = bytes.clone();
      tokio::spawn(async move {
        let name = format!("copy-{}.png", i);
        pipeline
          .run(upload(&name, "image/png", &bytes), OutputMode::Detections)
          .await
          .map(|output| output.source)
      })
    })
    .collect();

  let mut sources = Vec::new();
  for task in tasks {
    sources.push(task.await.unwrap().unwrap());
  }

  assert_eq!(detector.calls(), 1);
  assert_eq!(
    sources
      .iter()
      .filter(|s| **s == ResultSource::Inferred)
      .count(),
    1
  );
  assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cancelled_requests_release_the_staged_asset() {
  let dir = tempfile::tempdir().unwrap();
  let detector =
    Arc::new(ScriptedDetector::empty().with_delay(Duration::from_millis(500)));
  let pipeline = Arc::new(pipeline(detector.clone(), dir.path()));
  let bytes = png(24, 24, [9, 9, 9]);

  let task = {
    let pipeline = pipeline.clone();
    tokio::spawn(async move {
      pipeline
        .run(upload("slow.png", "image/png", &bytes), OutputMode::Detections)
        .await
        .is_ok()
    })
  };

  // 等待请求进入推理阶段
  for _ in 0..50 {
    if detector.calls() > 0 {
      break;
    }
    tokio::time::sleep(Duration::from_millis(10)).await;
  }
  assert_eq!(staged_files(dir.path()), 1);

  task.abort();
  assert!(task.await.unwrap_err().is_cancelled());
  assert_eq!(staged_files(dir.path()), 0);
}

#[tokio::test(flavor = "current_thread")]
async fn slow_inference_does_not_stall_other_requests() {
  let dir = tempfile::tempdir().unwrap();
  let delay = Duration::from_millis(500);
  let detector = Arc::new(ScriptedDetector::empty().slow_for_width(32, delay));
  let pipeline = Arc::new(pipeline(detector.clone(), dir.path()));

  let started = Instant::now();
  let slow = {
    let pipeline = pipeline.clone();
    tokio::spawn(async move {
      let bytes = png(32, 32, [1, 1, 1]);
      pipeline
        .run(upload("slow.png", "image/png", &bytes), OutputMode::Detections)
        .await
        .map(|_| Instant::now())
    })
  };

  // 等待慢请求进入推理阶段
  while detector.calls() == 0 {
    tokio::time::sleep(Duration::from_millis(5)).await;
  }

  let err = pipeline
    .run(upload("notes.txt", "text/plain", b"hello"), OutputMode::Detections)
    .await
    .unwrap_err();
  assert_eq!(err.reason(), "UnsupportedExtension");

  let fast_bytes = png(16, 16, [2, 2, 2]);
  pipeline
    .run(upload("fast.png", "image/png", &fast_bytes), OutputMode::Detections)
    .await
    .unwrap();
  let fast_done = Instant::now();
  assert!(!slow.is_finished());
  assert!(fast_done - started < delay);

  let slow_done = slow.await.unwrap().unwrap();
  assert!(fast_done < slow_done);
  assert_eq!(detector.calls(), 2);
  assert_eq!(staged_files(dir.path()), 0);
}
