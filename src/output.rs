// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output.rs - 检测结果消费者
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

use std::fmt;

use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  decode::{BoundingBox, Detection},
  pipeline::CycleReport,
};

mod logging;
pub use self::logging::LogSink;

mod json_lines;
pub use self::json_lines::{JsonLinesSink, JsonLinesSinkError};

mod channel;
pub use self::channel::{ChannelSink, ChannelSinkError};

#[cfg(feature = "save_image_file")]
mod crop;
#[cfg(feature = "save_image_file")]
pub use self::crop::{CropSink, CropSinkError};

/// 每个周期在协调线程上调用一次。报告中的检测结果只在调用期间有效，
/// 需要保留时复制为 `CycleRecord`。
pub trait DetectionSink {
  type Error: fmt::Display;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error>;
}

impl<K: DetectionSink + ?Sized> DetectionSink for &mut K {
  type Error = K::Error;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error> {
    (**self).consume(report)
  }
}

impl<K: DetectionSink + ?Sized> DetectionSink for Box<K> {
  type Error = K::Error;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error> {
    (**self).consume(report)
  }
}

/// 闭包消费者
pub struct FnSink<F>(pub F);

pub fn from_fn<F>(f: F) -> FnSink<F>
where
  F: FnMut(&CycleReport<'_>) -> anyhow::Result<()>,
{
  FnSink(f)
}

impl<F> DetectionSink for FnSink<F>
where
  F: FnMut(&CycleReport<'_>) -> anyhow::Result<()>,
{
  type Error = anyhow::Error;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error> {
    (self.0)(report)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DetectionRecord {
  pub class_id: u32,
  pub label: String,
  pub score: f32,
  pub bbox: BoundingBox,
}

/// 可跨周期保留的结果副本
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CycleRecord {
  pub cycle: u64,
  pub sequence: u64,
  pub timestamp: DateTime<Utc>,
  pub width: u32,
  pub height: u32,
  pub inference_ms: f64,
  pub detections: Vec<DetectionRecord>,
}

impl CycleRecord {
  pub fn from_report(report: &CycleReport<'_>) -> Self {
    let shape = report.frame.shape();
    Self {
      cycle: report.cycle,
      sequence: report.frame.sequence(),
      timestamp: report.frame.timestamp(),
      width: shape.width,
      height: shape.height,
      inference_ms: report.timings.inference.as_secs_f64() * 1000.0,
      detections: report
        .detections
        .iter()
        .map(|d: &Detection| DetectionRecord {
          class_id: d.class_id,
          label: report.labels.display(d.class_id),
          score: d.score,
          bbox: d.bbox,
        })
        .collect(),
    }
  }
}

#[derive(Error, Debug)]
pub enum OutputError {
  #[error("JSON Lines 输出错误: {0}")]
  JsonLines(#[from] JsonLinesSinkError),
  #[cfg(feature = "save_image_file")]
  #[error("裁剪图输出错误: {0}")]
  Crop(#[from] CropSinkError),
  #[error("URI 方案不匹配")]
  SchemeMismatch,
}

/// 按 URL 方案选择输出：`log://`、`jsonl:///path` 或 `crop:///path`
pub enum OutputWrapper {
  Log(LogSink),
  JsonLines(JsonLinesSink),
  #[cfg(feature = "save_image_file")]
  Crop(CropSink),
}

impl FromUrl for OutputWrapper {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    match url.scheme() {
      LogSink::SCHEME => Ok(OutputWrapper::Log(LogSink::from_url(url)?)),
      JsonLinesSink::SCHEME => Ok(OutputWrapper::JsonLines(JsonLinesSink::from_url(url)?)),
      #[cfg(feature = "save_image_file")]
      CropSink::SCHEME => Ok(OutputWrapper::Crop(CropSink::from_url(url)?)),
      _ => Err(OutputError::SchemeMismatch),
    }
  }
}

impl DetectionSink for OutputWrapper {
  type Error = OutputError;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error> {
    match self {
      OutputWrapper::Log(sink) => match sink.consume(report) {
        Ok(()) => Ok(()),
        Err(never) => match never {},
      },
      OutputWrapper::JsonLines(sink) => sink.consume(report).map_err(OutputError::from),
      #[cfg(feature = "save_image_file")]
      OutputWrapper::Crop(sink) => sink.consume(report).map_err(OutputError::from),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn selects_sink_by_scheme() {
    let url = Url::parse("log://").unwrap();
    assert!(matches!(OutputWrapper::from_url(&url), Ok(OutputWrapper::Log(_))));
    let url = Url::parse("jsonl:///tmp/records").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Ok(OutputWrapper::JsonLines(_))
    ));
    #[cfg(feature = "save_image_file")]
    {
      let url = Url::parse("crop:///tmp/crops").unwrap();
      assert!(matches!(OutputWrapper::from_url(&url), Ok(OutputWrapper::Crop(_))));
    }
    let url = Url::parse("rtsp://camera").unwrap();
    assert!(matches!(
      OutputWrapper::from_url(&url),
      Err(OutputError::SchemeMismatch)
    ));
  }
}
