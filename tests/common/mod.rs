// 该文件是 Shanan （山南西风） 项目的一部分。
// tests/common/mod.rs - 集成测试公共部分
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

#![allow(dead_code)]

use std::{
  sync::{Arc, mpsc},
  time::Duration,
};

use parking_lot::Mutex;
use shanan_pipeline::{
  buffer::Backing,
  decode::{DetectionDecoder, ScoreThresholds, SsdDecoder},
  error::BackendError,
  input::SyntheticSource,
  model::{Engine, EngineBackend, ModelInfo, Target},
  pipeline::{Coordinator, CoordinatorOptions},
  tensor::{PixelFormat, TensorSet, TensorShape},
};

pub const SLOTS: usize = 2;

pub fn model_input() -> TensorShape {
  TensorShape::image(PixelFormat::Rgb, 8, 8)
}

pub fn decoder() -> SsdDecoder {
  SsdDecoder::new(2)
}

/// 每次执行都输出两个候选：类别 1 置信度 0.9，类别 2 置信度 0.05
#[derive(Default)]
pub struct ScriptedEngine {
  pub gate: Option<Arc<Mutex<()>>>,
  pub started: Option<mpsc::Sender<u64>>,
  pub runs: u64,
}

impl Engine for ScriptedEngine {
  type Model = ();

  fn load(&mut self, model: &[u8], _target: Target) -> Result<((), ModelInfo), BackendError> {
    if model.is_empty() {
      return Err(BackendError::ModelLoad("empty model".into()));
    }
    Ok((
      (),
      ModelInfo {
        name: "scripted-ssd".into(),
        inputs: vec![model_input()],
        outputs: decoder().output_shapes(),
      },
    ))
  }

  fn execute(&mut self, _model: &(), tensors: &mut TensorSet) -> Result<(), BackendError> {
    self.runs += 1;
    if let Some(tx) = &self.started {
      let _ = tx.send(self.runs);
    }
    if let Some(gate) = &self.gate {
      drop(gate.lock());
    }
    let out = &mut tensors.outputs;
    out[0].write_f32(&[0.1, 0.2, 0.5, 0.6, 0.3, 0.3, 0.9, 0.9]);
    out[1].write_f32(&[1.0, 2.0]);
    out[2].write_f32(&[0.9, 0.05]);
    out[3].write_f32(&[2.0]);
    Ok(())
  }
}

pub fn source(format: PixelFormat) -> SyntheticSource {
  SyntheticSource::new(TensorShape::image(format, 16, 16), SLOTS, Backing::Heap).unwrap()
}

pub fn options() -> CoordinatorOptions {
  CoordinatorOptions {
    frame_timeout: Duration::from_millis(200),
    cancel_poll: Duration::from_millis(5),
    busy_backoff: Duration::from_millis(1),
    ..Default::default()
  }
}

pub type TestCoordinator = Coordinator<SyntheticSource, EngineBackend<ScriptedEngine>, SsdDecoder>;

pub fn coordinator(
  source: SyntheticSource,
  engine: ScriptedEngine,
  options: CoordinatorOptions,
) -> TestCoordinator {
  Coordinator::builder(source, EngineBackend::new(engine), decoder())
    .model(b"scripted".to_vec())
    .thresholds(ScoreThresholds::global(0.1))
    .options(options)
    .build()
}
