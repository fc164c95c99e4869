// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/sinks.rs - 输出集成测试
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

use std::{fs, path::Path};

use shanan_pipeline::{
  output::{ChannelSink, JsonLinesSink},
  pipeline::Outcome,
  tensor::PixelFormat,
};

mod common;
use common::{ScriptedEngine, coordinator, options, source};

fn jsonl_lines(dir: &Path) -> Vec<String> {
  let mut lines = Vec::new();
  for entry in fs::read_dir(dir).unwrap() {
    let path = entry.unwrap().path();
    if path.is_dir() {
      lines.extend(jsonl_lines(&path));
    } else if path.extension().is_some_and(|e| e == "jsonl") {
      let content = fs::read_to_string(&path).unwrap();
      lines.extend(content.lines().map(str::to_string));
    }
  }
  lines
}

#[test]
fn json_lines_sink_writes_one_record_per_cycle() {
  let dir = tempfile::tempdir().unwrap();
  let mut sink = JsonLinesSink::new(dir.path());
  let mut pipeline = coordinator(
    source(PixelFormat::Rgb).with_limit(2),
    ScriptedEngine::default(),
    options(),
  );

  assert_eq!(pipeline.run(&mut sink).unwrap(), Outcome::Completed);

  let lines = jsonl_lines(dir.path());
  assert_eq!(lines.len(), 2);
  let record: serde_json::Value = serde_json::from_str(&lines[0]).unwrap();
  assert_eq!(record["cycle"], 1);
  assert_eq!(record["width"], 16);
  assert_eq!(record["detections"][0]["label"], "bicycle");
  assert_eq!(record["detections"][0]["class_id"], 1);
}

#[test]
fn channel_sink_drops_when_full() {
  let (mut sink, rx) = ChannelSink::bounded(1);
  let mut pipeline = coordinator(
    source(PixelFormat::Rgb).with_limit(3),
    ScriptedEngine::default(),
    options(),
  );

  assert_eq!(pipeline.run(&mut sink).unwrap(), Outcome::Completed);
  assert_eq!(sink.dropped(), 2);
  let record = rx.try_recv().unwrap();
  assert_eq!(record.cycle, 1);
  assert_eq!(record.detections.len(), 1);
  assert!(rx.try_recv().is_err());
}

#[test]
fn channel_sink_fails_when_receiver_is_gone() {
  let (mut sink, rx) = ChannelSink::bounded(1);
  drop(rx);
  let mut pipeline = coordinator(source(PixelFormat::Rgb), ScriptedEngine::default(), options());
  let err = pipeline.run(&mut sink).unwrap_err();
  assert!(err.to_string().contains("接收端已关闭"));
}

#[cfg(feature = "save_image_file")]
#[test]
fn crop_sink_saves_each_detection_region() {
  use shanan_pipeline::output::CropSink;

  let dir = tempfile::tempdir().unwrap();
  let mut sink = CropSink::new(dir.path());
  let mut pipeline = coordinator(
    source(PixelFormat::Nv12).with_limit(2),
    ScriptedEngine::default(),
    options(),
  );

  assert_eq!(pipeline.run(&mut sink).unwrap(), Outcome::Completed);
  assert_eq!(sink.skipped(), 0);

  let mut saved: Vec<_> = fs::read_dir(dir.path())
    .unwrap()
    .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
    .collect();
  saved.sort();
  assert_eq!(saved, vec!["0_0_bicycle.jpg", "1_0_bicycle.jpg"]);

  // 16x16 帧上的 (0.1, 0.2, 0.5, 0.6) 对应 x=3, y=1, 6x6
  let crop = image::open(dir.path().join(&saved[0])).unwrap();
  assert_eq!((crop.width(), crop.height()), (6, 6));
}
