// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/rknn.rs - RKNN NPU 推理引擎
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

use std::path::{Path, PathBuf};

use rknpu::{Context, InitFlags, TensorFormat, TensorType};
use thiserror::Error;
use tracing::{debug, error, info, warn};
use url::Url;

use super::{Engine, ModelInfo, Target};
use crate::{
  FromUrl, FromUrlWithScheme,
  error::BackendError,
  input::query_value,
  tensor::{PixelFormat, TensorSet, TensorShape},
};

/// RKNN_ERR_FAIL
const RKNN_ERROR_CODE: i32 = -1;
const RKNN_NUM_INPUTS: u32 = 1;
const DEFAULT_INPUT_SIZE: u32 = 640;

#[derive(Error, Debug)]
pub enum RknnEngineError {
  #[error("模型加载错误: {0}")]
  ModelLoadError(#[from] std::io::Error),
  #[error("模型路径错误: {0}")]
  ModelPathError(String),
  #[error("不支持的输入布局: {0}")]
  UnsupportedLayout(String),
}

fn rknn_error(context: &str, e: rknpu::Error) -> BackendError {
  error!("{}: {}", context, e);
  BackendError::run(RKNN_ERROR_CODE, format!("{}: {}", context, e))
}

/// `rknn:///opt/model.rknn?width=640&height=640&layout=rgb`
pub struct RknnEngineBuilder {
  model_path: PathBuf,
  input: TensorShape,
  outputs: Vec<TensorShape>,
}

impl FromUrlWithScheme for RknnEngineBuilder {
  const SCHEME: &'static str = "rknn";
}

impl FromUrl for RknnEngineBuilder {
  type Error = RknnEngineError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RknnEngineError::ModelPathError(format!(
        "模型路径必须使用 {} 方案",
        Self::SCHEME
      )));
    }
    if url.path().is_empty() || url.path() == "/" {
      return Err(RknnEngineError::ModelPathError(url.to_string()));
    }

    let layout = match url.query_pairs().find(|(k, _)| k == "layout") {
      Some((_, name)) => match PixelFormat::parse(&name) {
        Some(format @ (PixelFormat::Rgb | PixelFormat::Bgr | PixelFormat::RgbPlanar)) => format,
        _ => return Err(RknnEngineError::UnsupportedLayout(name.to_string())),
      },
      None => PixelFormat::Rgb,
    };
    let width = query_value(url, "width").unwrap_or(DEFAULT_INPUT_SIZE);
    let height = query_value(url, "height").unwrap_or(DEFAULT_INPUT_SIZE);

    Ok(RknnEngineBuilder {
      model_path: PathBuf::from(url.path()),
      input: TensorShape::image(layout, width, height),
      outputs: Vec::new(),
    })
  }
}

impl RknnEngineBuilder {
  pub fn new(model_path: impl Into<PathBuf>, input: TensorShape) -> Self {
    Self {
      model_path: model_path.into(),
      input,
      outputs: Vec::new(),
    }
  }

  /// 覆盖 URL 中的输入尺寸与布局
  pub fn with_input(mut self, input: TensorShape) -> Self {
    self.input = input;
    self
  }

  /// 模型输出的布局，通常由解码器给出
  pub fn outputs(mut self, outputs: Vec<TensorShape>) -> Self {
    self.outputs = outputs;
    self
  }

  pub fn model_path(&self) -> &Path {
    &self.model_path
  }

  pub fn input(&self) -> TensorShape {
    self.input
  }

  /// 读取模型文件，返回引擎和模型字节
  pub fn build(self) -> Result<(RknnEngine, Vec<u8>), RknnEngineError> {
    info!("加载模型文件: {}", self.model_path.display());
    let model_data = std::fs::read(&self.model_path)?;
    debug!(
      "模型文件大小: {:.2} MB",
      model_data.len() as f64 / (1024.0 * 1024.0)
    );

    let name = self
      .model_path
      .file_stem()
      .map(|s| s.to_string_lossy().into_owned())
      .unwrap_or_else(|| "rknn".to_string());

    Ok((
      RknnEngine {
        name,
        input: self.input,
        outputs: self.outputs,
      },
      model_data,
    ))
  }
}

pub struct RknnEngine {
  name: String,
  input: TensorShape,
  outputs: Vec<TensorShape>,
}

pub struct RknnModel {
  context: Context,
  num_outputs: usize,
}

// SAFETY: RKNN 上下文可以在创建线程之外使用，只要调用是串行的；
// `EngineBackend` 把引擎和全部模型放在 `Shared` 里，只在它的互斥锁下访问，
// 同一时刻只有一个线程接触上下文。
unsafe impl Send for RknnModel {}

impl Engine for RknnEngine {
  type Model = RknnModel;

  fn load(&mut self, model: &[u8], target: Target) -> Result<(RknnModel, ModelInfo), BackendError> {
    if matches!(target, Target::Cpu | Target::Gpu) {
      warn!("RKNN 只支持 NPU, 忽略目标 {:?}", target);
    }

    info!("创建 RKNN 推理上下文");
    let context = Context::new(model, InitFlags::default())
      .map_err(|e| BackendError::ModelLoad(format!("无法创建 RKNN 上下文: {}", e)))?;

    match context.sdk_version() {
      Ok(version) => {
        if let Ok(api_ver) = version.api_version() {
          debug!("模型 API 版本: {}", api_ver);
        }
        if let Ok(drv_ver) = version.driver_version() {
          debug!("模型驱动版本: {}", drv_ver);
        }
      }
      Err(e) => {
        error!("查询 SDK 版本失败: {}", e);
        return Err(BackendError::ModelLoad(format!("无法查询 SDK 版本: {}", e)));
      }
    }

    let num_inputs = context
      .num_inputs()
      .map_err(|e| BackendError::ModelLoad(format!("无法获取输入数量: {}", e)))?;
    let num_outputs = context
      .num_outputs()
      .map_err(|e| BackendError::ModelLoad(format!("无法获取输出数量: {}", e)))?;
    debug!("模型输入数量: {}", num_inputs);
    debug!("模型输出数量: {}", num_outputs);

    if num_inputs != RKNN_NUM_INPUTS {
      return Err(BackendError::ModelLoad(format!(
        "预期模型输入数量为 {}, 实际为 {}",
        RKNN_NUM_INPUTS, num_inputs
      )));
    }
    if (num_outputs as usize) < self.outputs.len() {
      return Err(BackendError::ModelLoad(format!(
        "预期模型输出数量至少为 {}, 实际为 {}",
        self.outputs.len(),
        num_outputs
      )));
    }
    info!("模型加载完成");

    Ok((
      RknnModel {
        context,
        num_outputs: num_outputs as usize,
      },
      ModelInfo {
        name: self.name.clone(),
        inputs: vec![self.input],
        outputs: self.outputs.clone(),
      },
    ))
  }

  fn execute(&mut self, model: &RknnModel, tensors: &mut TensorSet) -> Result<(), BackendError> {
    let input = tensors
      .inputs
      .first()
      .ok_or_else(|| BackendError::TensorMismatch("缺少输入张量".into()))?;
    let format = match input.shape().format {
      PixelFormat::Rgb | PixelFormat::Bgr => TensorFormat::NHWC,
      PixelFormat::RgbPlanar => TensorFormat::NCHW,
      other => {
        return Err(BackendError::TensorMismatch(format!(
          "RKNN 不接受 {} 输入",
          other.name()
        )));
      }
    };

    debug!("设置模型输入");
    model
      .context
      .set_input(0, input.bytes(), format, TensorType::UInt8)
      .map_err(|e| rknn_error("设置输入失败", e))?;

    debug!("执行模型推理");
    model.context.run().map_err(|e| rknn_error("推理失败", e))?;

    debug!("获取模型输出");
    let output = model
      .context
      .get_outputs()
      .map_err(|e| rknn_error("获取输出失败", e))?;

    // 输出顺序可能与声明不同，按大小匹配未使用的输出
    let mut used = vec![false; model.num_outputs];
    for (index, tensor) in tensors.outputs.iter_mut().enumerate() {
      let expected = tensor.f32_len();
      let matched = (index..model.num_outputs)
        .chain(0..index.min(model.num_outputs))
        .find(|&j| !used[j] && output.get_f32(j).is_ok_and(|data| data.len() == expected));
      let Some(j) = matched else {
        return Err(BackendError::MalformedOutput(format!(
          "找不到大小为 {} 的第 {} 个输出",
          expected, index
        )));
      };
      if j != index {
        debug!("输出 {} 对应模型输出 {}", index, j);
      }
      used[j] = true;
      let data = output
        .get_f32(j)
        .map_err(|e| rknn_error("读取输出失败", e))?;
      tensor.write_f32(&data);
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn builder_from_url() {
    let url = Url::parse("rknn:///opt/yolo26.rknn?width=320&height=320&layout=nchw").unwrap();
    let builder = RknnEngineBuilder::from_url(&url).unwrap();
    assert_eq!(builder.model_path(), Path::new("/opt/yolo26.rknn"));
    assert_eq!(
      builder.input(),
      TensorShape::image(PixelFormat::RgbPlanar, 320, 320)
    );
  }

  #[test]
  fn builder_rejects_other_schemes_and_layouts() {
    let url = Url::parse("file:///opt/yolo26.rknn").unwrap();
    assert!(RknnEngineBuilder::from_url(&url).is_err());
    let url = Url::parse("rknn:///opt/yolo26.rknn?layout=nv12").unwrap();
    assert!(matches!(
      RknnEngineBuilder::from_url(&url),
      Err(RknnEngineError::UnsupportedLayout(_))
    ));
  }
}
