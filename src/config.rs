// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 流水线配置
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

use std::{
  path::{Path, PathBuf},
  time::Duration,
};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

use crate::{
  buffer::Backing,
  decode::{BoxConvention, BoxOrder, DetectionDecoder, ScoreThresholds, SsdDecoder, Yolo26Decoder},
  labels::{LabelError, LabelTable},
  model::Target,
  pipeline::{CoordinatorOptions, InferenceMode},
  preprocess::CropRect,
  tensor::{PixelFormat, TensorShape},
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("无法读取配置文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("配置文件格式错误: {0}")]
  Parse(#[from] toml::de::Error),
  #[error("配置无效: {0}")]
  Invalid(String),
}

/// 流水线配置，所有字段都有默认值
///
/// ```toml
/// [model]
/// url = "rknn:///opt/models/yolo26n.rknn"
/// target = "npu"
///
/// [preprocess]
/// format = "rgb"
/// width = 640
/// height = 640
/// crop = { x = 0, y = 0, width = 1080, height = 1080 }
///
/// [inference]
/// mode = "async"
///
/// [detection]
/// decoder = "yolo26"
/// threshold = 0.5
/// [[detection.class_thresholds]]
/// class = 0
/// threshold = 0.3
///
/// [runtime]
/// frame_timeout_ms = 1000
/// shared_memory = true
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
  pub model: ModelConfig,
  pub preprocess: PreprocessConfig,
  pub inference: InferenceConfig,
  pub detection: DetectionConfig,
  pub runtime: RuntimeConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ModelConfig {
  pub url: Option<String>,
  pub target: Target,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreprocessConfig {
  /// 模型输入的像素格式
  pub format: PixelFormat,
  pub width: u32,
  pub height: u32,
  pub crop: Option<CropRect>,
}

impl Default for PreprocessConfig {
  fn default() -> Self {
    Self {
      format: PixelFormat::Rgb,
      width: 640,
      height: 640,
      crop: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct InferenceConfig {
  pub mode: InferenceMode,
  pub busy_retries: u32,
  pub busy_backoff_ms: u64,
}

impl Default for InferenceConfig {
  fn default() -> Self {
    Self {
      mode: InferenceMode::Sync,
      busy_retries: 3,
      busy_backoff_ms: 5,
    }
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DecoderKind {
  Ssd,
  #[default]
  Yolo26,
}

#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClassThreshold {
  pub class: u32,
  pub threshold: f32,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DetectionConfig {
  pub decoder: DecoderKind,
  /// SSD 输出的最大检测数量
  pub max_detections: u32,
  /// YOLO26 类别数
  pub classes: u32,
  pub convention: BoxConvention,
  pub order: BoxOrder,
  pub threshold: f32,
  pub class_thresholds: Vec<ClassThreshold>,
  pub labels: Option<PathBuf>,
}

impl Default for DetectionConfig {
  fn default() -> Self {
    Self {
      decoder: DecoderKind::Yolo26,
      max_detections: 100,
      classes: 80,
      convention: BoxConvention::Unit,
      order: BoxOrder::Tlbr,
      threshold: 0.5,
      class_thresholds: Vec::new(),
      labels: None,
    }
  }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RuntimeConfig {
  pub frame_timeout_ms: u64,
  pub source_retries: u32,
  pub skip_invalid_geometry: bool,
  pub max_frames: Option<u64>,
  pub shared_memory: bool,
  pub shared_memory_dir: Option<PathBuf>,
  pub cancel_poll_ms: u64,
  /// 第一次中断后等待排空的最长时间
  pub forced_exit_grace_secs: u64,
}

impl Default for RuntimeConfig {
  fn default() -> Self {
    Self {
      frame_timeout_ms: 1000,
      source_retries: 3,
      skip_invalid_geometry: true,
      max_frames: None,
      shared_memory: false,
      shared_memory_dir: None,
      cancel_poll_ms: 20,
      forced_exit_grace_secs: 30,
    }
  }
}

impl PipelineConfig {
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let path = path.as_ref();
    info!("读取配置文件: {}", path.display());
    let content = std::fs::read_to_string(path)?;
    Self::parse(&content)
  }

  pub fn parse(content: &str) -> Result<Self, ConfigError> {
    let config: PipelineConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
  }

  pub fn validate(&self) -> Result<(), ConfigError> {
    let p = &self.preprocess;
    if !matches!(
      p.format,
      PixelFormat::Rgb | PixelFormat::Bgr | PixelFormat::RgbPlanar
    ) {
      return Err(ConfigError::Invalid(format!(
        "模型输入格式不能为 {}",
        p.format.name()
      )));
    }
    if p.width == 0 || p.height == 0 {
      return Err(ConfigError::Invalid("模型输入尺寸不能为 0".into()));
    }
    let thresholds = std::iter::once(self.detection.threshold)
      .chain(self.detection.class_thresholds.iter().map(|c| c.threshold));
    for threshold in thresholds {
      if !(0.0..=1.0).contains(&threshold) {
        return Err(ConfigError::Invalid(format!(
          "置信度阈值 {} 超出 [0, 1]",
          threshold
        )));
      }
    }
    Ok(())
  }

  pub fn model_input(&self) -> TensorShape {
    let p = &self.preprocess;
    TensorShape::image(p.format, p.width, p.height)
  }

  pub fn thresholds(&self) -> ScoreThresholds {
    self
      .detection
      .class_thresholds
      .iter()
      .fold(ScoreThresholds::global(self.detection.threshold), |t, c| {
        t.with_class(c.class, c.threshold)
      })
  }

  pub fn labels(&self) -> Result<LabelTable, LabelError> {
    match &self.detection.labels {
      Some(path) => LabelTable::from_file(path),
      None => Ok(LabelTable::coco()),
    }
  }

  pub fn decoder(&self) -> Box<dyn DetectionDecoder> {
    let d = &self.detection;
    match d.decoder {
      DecoderKind::Ssd => Box::new(
        SsdDecoder::new(d.max_detections)
          .order(d.order)
          .convention(d.convention),
      ),
      DecoderKind::Yolo26 => Box::new(
        Yolo26Decoder::new(self.preprocess.width, self.preprocess.height).class_num(d.classes),
      ),
    }
  }

  pub fn coordinator_options(&self) -> CoordinatorOptions {
    let r = &self.runtime;
    let backing = if r.shared_memory {
      Backing::Shared {
        dir: r.shared_memory_dir.clone(),
      }
    } else {
      Backing::Heap
    };
    CoordinatorOptions {
      mode: self.inference.mode,
      target: self.model.target,
      frame_timeout: Duration::from_millis(r.frame_timeout_ms),
      source_retries: r.source_retries,
      skip_invalid_geometry: r.skip_invalid_geometry,
      busy_retries: self.inference.busy_retries,
      busy_backoff: Duration::from_millis(self.inference.busy_backoff_ms),
      max_frames: r.max_frames,
      backing,
      cancel_poll: Duration::from_millis(r.cancel_poll_ms),
    }
  }

  pub fn forced_exit_grace(&self) -> Duration {
    Duration::from_secs(self.runtime.forced_exit_grace_secs)
  }
}
