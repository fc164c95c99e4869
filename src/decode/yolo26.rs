// 该文件是 Shanan （山南西风） 项目的一部分。
// src/decode/yolo26.rs - YOLO26 检测头解码
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

use tracing::{debug, error};

use super::{BoundingBox, Detection, DetectionDecoder, ScoreThresholds, expect_outputs};
use crate::{
  error::BackendError,
  tensor::{ElementType, TensorDescriptor, TensorShape},
};

const YOLO26_CLASS_NUM: u32 = 80;
const YOLO26_STRIDES: [u32; 3] = [8, 16, 32];

/// 三个无锚框检测头，每个检测头输出回归 (4 x H x W) 和分类 (C x H x W)
#[derive(Debug, Clone)]
pub struct Yolo26Decoder {
  input_width: u32,
  input_height: u32,
  class_num: u32,
}

impl Default for Yolo26Decoder {
  fn default() -> Self {
    Self::new(640, 640)
  }
}

impl Yolo26Decoder {
  pub fn new(input_width: u32, input_height: u32) -> Self {
    Self {
      input_width,
      input_height,
      class_num: YOLO26_CLASS_NUM,
    }
  }

  pub fn class_num(mut self, class_num: u32) -> Self {
    self.class_num = class_num;
    self
  }

  /// 各检测头的 (高, 宽, 步长)
  fn heads(&self) -> impl Iterator<Item = (usize, usize, f32)> + '_ {
    YOLO26_STRIDES.iter().map(|&stride| {
      (
        self.input_height.div_ceil(stride) as usize,
        self.input_width.div_ceil(stride) as usize,
        stride as f32,
      )
    })
  }
}

/// 根据张量大小匹配回归和分类输出
/// 返回 (reg, cls) 元组，如果大小不匹配则返回 None
fn match_reg_cls_tensors<'a>(
  first: &'a [f32],
  second: &'a [f32],
  reg_expected: usize,
  cls_expected: usize,
  head_idx: usize,
) -> Option<(&'a [f32], &'a [f32])> {
  if first.len() == reg_expected && second.len() == cls_expected {
    Some((first, second))
  } else if first.len() == cls_expected && second.len() == reg_expected {
    debug!("检测头 {}: 输出顺序交换", head_idx);
    Some((second, first))
  } else {
    error!(
      "检测头 {}: 输出大小不匹配 - 张量1: {}, 张量2: {}, 期望回归: {}, 期望分类: {}",
      head_idx,
      first.len(),
      second.len(),
      reg_expected,
      cls_expected
    );
    None
  }
}

fn sigmoid(x: f32) -> f32 {
  1.0 / (1.0 + (-x).exp())
}

impl DetectionDecoder for Yolo26Decoder {
  fn output_shapes(&self) -> Vec<TensorShape> {
    self
      .heads()
      .flat_map(|(map_h, map_w, _)| {
        let spatial = (map_h * map_w) as u32;
        [
          TensorShape::matrix(4, spatial, ElementType::F32),
          TensorShape::matrix(self.class_num, spatial, ElementType::F32),
        ]
      })
      .collect()
  }

  fn decode(
    &self,
    outputs: &[TensorDescriptor],
    thresholds: &ScoreThresholds,
  ) -> Result<Vec<Detection>, BackendError> {
    expect_outputs(outputs, 2 * YOLO26_STRIDES.len())?;
    let (input_w, input_h) = (self.input_width as f32, self.input_height as f32);
    let class_num = self.class_num as usize;
    let mut items = Vec::new();

    for (head_idx, (map_h, map_w, stride)) in self.heads().enumerate() {
      let spatial = map_h * map_w;
      let first = outputs[head_idx * 2].to_f32_vec();
      let second = outputs[head_idx * 2 + 1].to_f32_vec();
      let (reg, cls) =
        match_reg_cls_tensors(&first, &second, 4 * spatial, class_num * spatial, head_idx)
          .ok_or_else(|| BackendError::MalformedOutput(format!("检测头 {} 输出大小不匹配", head_idx)))?;

      for h in 0..map_h {
        for w in 0..map_w {
          let idx = h * map_w + w;

          let (max_logit, class_id) = (0..class_num)
            .map(|c| (cls[c * spatial + idx], c as u32))
            .fold((f32::MIN, 0), |best, cur| if cur.0 > best.0 { cur } else { best });
          let score = sigmoid(max_logit);
          if !thresholds.accept(class_id, score) {
            continue;
          }

          let grid_x = w as f32 + 0.5;
          let grid_y = h as f32 + 0.5;
          let xmin = ((grid_x - reg[idx]) * stride).clamp(0.0, input_w);
          let ymin = ((grid_y - reg[spatial + idx]) * stride).clamp(0.0, input_h);
          let xmax = ((grid_x + reg[2 * spatial + idx]) * stride).clamp(0.0, input_w);
          let ymax = ((grid_y + reg[3 * spatial + idx]) * stride).clamp(0.0, input_h);

          items.push(Detection {
            class_id,
            score,
            bbox: BoundingBox {
              top: ymin / input_h,
              left: xmin / input_w,
              bottom: ymax / input_h,
              right: xmax / input_w,
            },
          });
        }
      }
    }

    debug!("检测到 {} 个物体", items.len());
    Ok(items)
  }
}
