// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode.rs - 检测结果解码
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

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::{
  error::BackendError,
  tensor::{TensorDescriptor, TensorShape},
};

mod ssd;
pub use self::ssd::SsdDecoder;

mod yolo26;
pub use self::yolo26::Yolo26Decoder;

/// 归一化到 [0, 1] 的检测框
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
  pub top: f32,
  pub left: f32,
  pub bottom: f32,
  pub right: f32,
}

impl BoundingBox {
  pub fn width(&self) -> f32 {
    self.right - self.left
  }

  pub fn height(&self) -> f32 {
    self.bottom - self.top
  }

  /// 换算为像素坐标 (x, y, w, h)
  pub fn to_pixels(&self, width: u32, height: u32) -> (u32, u32, u32, u32) {
    let (w, h) = (width as f32, height as f32);
    let x = (self.left * w) as u32;
    let y = (self.top * h) as u32;
    (x, y, (self.width() * w) as u32, (self.height() * h) as u32)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
  pub class_id: u32,
  pub score: f32,
  pub bbox: BoundingBox,
}

/// 模型输出的坐标范围
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxConvention {
  /// [0, 1]
  #[default]
  Unit,
  /// [-1, 1]，按 `(v + 1) / 2` 映射
  Signed,
}

impl BoxConvention {
  pub fn normalize(self, value: f32) -> f32 {
    let value = match self {
      BoxConvention::Unit => value,
      BoxConvention::Signed => (value + 1.0) / 2.0,
    };
    value.clamp(0.0, 1.0)
  }
}

/// 每个检测框四个坐标的排列顺序
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BoxOrder {
  /// top, left, bottom, right
  #[default]
  Tlbr,
  /// left, top, right, bottom
  Ltrb,
}

impl BoxOrder {
  pub fn arrange(self, raw: [f32; 4], convention: BoxConvention) -> BoundingBox {
    let [a, b, c, d] = raw.map(|v| convention.normalize(v));
    match self {
      BoxOrder::Tlbr => BoundingBox {
        top: a,
        left: b,
        bottom: c,
        right: d,
      },
      BoxOrder::Ltrb => BoundingBox {
        left: a,
        top: b,
        right: c,
        bottom: d,
      },
    }
  }
}

/// 置信度阈值：全局值 + 可选的按类别覆盖
#[derive(Debug, Clone, PartialEq)]
pub struct ScoreThresholds {
  global: f32,
  per_class: HashMap<u32, f32>,
}

impl Default for ScoreThresholds {
  fn default() -> Self {
    Self::global(0.5)
  }
}

impl ScoreThresholds {
  pub fn global(threshold: f32) -> Self {
    Self {
      global: threshold,
      per_class: HashMap::new(),
    }
  }

  pub fn with_class(mut self, class_id: u32, threshold: f32) -> Self {
    self.per_class.insert(class_id, threshold);
    self
  }

  pub fn threshold(&self, class_id: u32) -> f32 {
    self.per_class.get(&class_id).copied().unwrap_or(self.global)
  }

  pub fn accept(&self, class_id: u32, score: f32) -> bool {
    score >= self.threshold(class_id)
  }
}

/// 把模型输出张量解释为检测结果
pub trait DetectionDecoder: Send {
  /// 解码器期望的输出布局，用于创建推理任务
  fn output_shapes(&self) -> Vec<TensorShape>;

  fn decode(
    &self,
    outputs: &[TensorDescriptor],
    thresholds: &ScoreThresholds,
  ) -> Result<Vec<Detection>, BackendError>;
}

impl<D: DetectionDecoder + ?Sized> DetectionDecoder for Box<D> {
  fn output_shapes(&self) -> Vec<TensorShape> {
    (**self).output_shapes()
  }

  fn decode(
    &self,
    outputs: &[TensorDescriptor],
    thresholds: &ScoreThresholds,
  ) -> Result<Vec<Detection>, BackendError> {
    (**self).decode(outputs, thresholds)
  }
}

pub(crate) fn expect_outputs(outputs: &[TensorDescriptor], count: usize) -> Result<(), BackendError> {
  if outputs.len() != count {
    return Err(BackendError::MalformedOutput(format!(
      "预期 {} 个输出张量, 实际 {}",
      count,
      outputs.len()
    )));
  }
  Ok(())
}
