// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode/ssd.rs - SSD 检测头解码
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

use tracing::{debug, warn};

use super::{BoxConvention, BoxOrder, Detection, DetectionDecoder, ScoreThresholds, expect_outputs};
use crate::{
  error::BackendError,
  tensor::{ElementType, TensorDescriptor, TensorShape},
};

const SSD_NUM_OUTPUTS: usize = 4;

/// 后处理 SSD 输出：位置、类别、置信度、数量四个 f32 张量
#[derive(Debug, Clone)]
pub struct SsdDecoder {
  max_detections: u32,
  order: BoxOrder,
  convention: BoxConvention,
}

impl SsdDecoder {
  pub fn new(max_detections: u32) -> Self {
    Self {
      max_detections,
      order: BoxOrder::default(),
      convention: BoxConvention::default(),
    }
  }

  pub fn order(mut self, order: BoxOrder) -> Self {
    self.order = order;
    self
  }

  pub fn convention(mut self, convention: BoxConvention) -> Self {
    self.convention = convention;
    self
  }
}

impl DetectionDecoder for SsdDecoder {
  fn output_shapes(&self) -> Vec<TensorShape> {
    vec![
      TensorShape::matrix(self.max_detections, 4, ElementType::F32),
      TensorShape::vector(self.max_detections, ElementType::F32),
      TensorShape::vector(self.max_detections, ElementType::F32),
      TensorShape::vector(1, ElementType::F32),
    ]
  }

  fn decode(
    &self,
    outputs: &[TensorDescriptor],
    thresholds: &ScoreThresholds,
  ) -> Result<Vec<Detection>, BackendError> {
    expect_outputs(outputs, SSD_NUM_OUTPUTS)?;
    let (locations, classes, scores, count) = (&outputs[0], &outputs[1], &outputs[2], &outputs[3]);

    let reported = count
      .f32_at(0)
      .ok_or_else(|| BackendError::MalformedOutput("缺少检测数量".into()))?;
    let capacity = (locations.f32_len() / 4)
      .min(classes.f32_len())
      .min(scores.f32_len());
    let reported = if reported.is_finite() && reported > 0.0 {
      reported as usize
    } else {
      0
    };
    if reported > capacity {
      warn!("检测数量 {} 超出输出容量 {}, 已截断", reported, capacity);
    }
    let count = reported.min(capacity);
    if count == 0 {
      debug!("未检测到物体");
      return Ok(Vec::new());
    }

    let mut detections = Vec::with_capacity(count);
    for i in 0..count {
      let (Some(score), Some(class)) = (scores.f32_at(i), classes.f32_at(i)) else {
        break;
      };
      let class_id = class.max(0.0) as u32;
      if !thresholds.accept(class_id, score) {
        continue;
      }
      let mut raw = [0.0f32; 4];
      for (k, v) in raw.iter_mut().enumerate() {
        *v = locations.f32_at(4 * i + k).unwrap_or_default();
      }
      detections.push(Detection {
        class_id,
        score,
        bbox: self.order.arrange(raw, self.convention),
      });
    }
    debug!("共 {} 个候选, 保留 {} 个", count, detections.len());
    Ok(detections)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::{
    buffer::{Backing, BufferPool},
    decode::BoundingBox,
  };

  fn outputs(
    pool: &mut BufferPool,
    decoder: &SsdDecoder,
    locations: &[f32],
    classes: &[f32],
    scores: &[f32],
    count: f32,
  ) -> Vec<TensorDescriptor> {
    let count = [count];
    let data: [&[f32]; 4] = [locations, classes, scores, &count];
    decoder
      .output_shapes()
      .into_iter()
      .zip(data)
      .map(|(shape, values)| {
        let buffer = pool.acquire(shape.byte_len()).unwrap();
        let mut tensor = TensorDescriptor::new(shape, buffer).unwrap();
        tensor.write_f32(values);
        tensor
      })
      .collect()
  }

  #[test]
  fn keeps_only_scores_above_threshold() {
    let mut pool = BufferPool::new(Backing::Heap, 8);
    let decoder = SsdDecoder::new(4);
    let tensors = outputs(
      &mut pool,
      &decoder,
      &[0.1, 0.2, 0.5, 0.6, 0.3, 0.3, 0.9, 0.9],
      &[17.0, 2.0],
      &[0.8, 0.05],
      2.0,
    );

    let detections = decoder
      .decode(&tensors, &ScoreThresholds::global(0.1))
      .unwrap();
    assert_eq!(
      detections,
      vec![Detection {
        class_id: 17,
        score: 0.8,
        bbox: BoundingBox {
          top: 0.1,
          left: 0.2,
          bottom: 0.5,
          right: 0.6
        },
      }]
    );
  }

  #[test]
  fn count_is_clamped_to_capacity() {
    let mut pool = BufferPool::new(Backing::Heap, 8);
    let decoder = SsdDecoder::new(2);
    let tensors = outputs(
      &mut pool,
      &decoder,
      &[0.0, 0.0, 1.0, 1.0, 0.0, 0.0, 1.0, 1.0],
      &[1.0, 2.0],
      &[0.9, 0.9],
      50.0,
    );
    let detections = decoder
      .decode(&tensors, &ScoreThresholds::global(0.5))
      .unwrap();
    assert_eq!(detections.len(), 2);
  }

  #[test]
  fn signed_ltrb_boxes_are_normalized() {
    let mut pool = BufferPool::new(Backing::Heap, 8);
    let decoder = SsdDecoder::new(1)
      .order(BoxOrder::Ltrb)
      .convention(BoxConvention::Signed);
    let tensors = outputs(&mut pool, &decoder, &[-1.0, -0.5, 0.5, 1.0], &[0.0], &[0.7], 1.0);
    let detections = decoder
      .decode(&tensors, &ScoreThresholds::global(0.5))
      .unwrap();
    assert_eq!(
      detections[0].bbox,
      BoundingBox {
        top: 0.25,
        left: 0.0,
        bottom: 1.0,
        right: 0.75
      }
    );
  }

  #[test]
  fn rejects_missing_outputs() {
    let decoder = SsdDecoder::new(1);
    assert!(matches!(
      decoder.decode(&[], &ScoreThresholds::default()),
      Err(BackendError::MalformedOutput(_))
    ));
  }
}
