// 该文件是 Shanan （山南西风） 项目的一部分。
// src/error.rs - 流水线错误分类
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

use thiserror::Error;

use crate::model::JobId;

/// 内存/描述符分配类错误，对当前流水线实例是致命的。
#[derive(Error, Debug)]
pub enum ResourceError {
  #[error("无法分配 {size} 字节的缓冲区: {source}")]
  OutOfResources {
    size: usize,
    #[source]
    source: std::io::Error,
  },
  #[error("缓冲池已耗尽: 容量 {capacity}, 请求 {size} 字节")]
  PoolExhausted { capacity: usize, size: usize },
  #[error("不允许分配零字节缓冲区")]
  ZeroSized,
  #[error("缓冲区 {id} 不属于该缓冲池")]
  ForeignBuffer { id: u64 },
  #[error("张量大小不匹配: 声明 {declared} 字节, 缓冲区 {actual} 字节")]
  SizeMismatch { declared: usize, actual: usize },
}

/// 裁剪/缩放参数非法，只影响当前周期。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GeometryError {
  #[error("裁剪区域 ({x}, {y}, {width}x{height}) 超出源图像范围 {source_width}x{source_height}")]
  CropOutOfBounds {
    x: u32,
    y: u32,
    width: u32,
    height: u32,
    source_width: u32,
    source_height: u32,
  },
  #[error("裁剪区域为空")]
  EmptyCrop,
  #[error("目标尺寸 {actual_width}x{actual_height} 与缩放目标 {width}x{height} 不一致")]
  ScaleMismatch {
    width: u32,
    height: u32,
    actual_width: u32,
    actual_height: u32,
  },
  #[error("像素格式 {format} 要求偶数尺寸, 实际 {width}x{height}")]
  OddDimensions {
    format: &'static str,
    width: u32,
    height: u32,
  },
  #[error("不支持的格式转换: {from} -> {to}")]
  UnsupportedConversion {
    from: &'static str,
    to: &'static str,
  },
  #[error("张量不是 u8 图像: {0}")]
  NotAnImage(&'static str),
}

/// 推理后端错误，携带后端错误码。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BackendError {
  #[error("模型加载失败: {0}")]
  ModelLoad(String),
  #[error("任务 {0} 仍在执行中")]
  JobBusy(JobId),
  #[error("未知的模型句柄 {0}")]
  UnknownModel(u64),
  #[error("未知的任务句柄 {0}")]
  UnknownJob(JobId),
  #[error("张量布局与模型不一致: {0}")]
  TensorMismatch(String),
  #[error("模型输出格式错误: {0}")]
  MalformedOutput(String),
  #[error("推理执行失败 ({code}): {message}")]
  Run { code: i32, message: String },
  #[error("推理后端已断开")]
  Disconnected,
}

impl BackendError {
  pub fn run(code: i32, message: impl Into<String>) -> Self {
    BackendError::Run {
      code,
      message: message.into(),
    }
  }
}

/// 采集错误。`Closed` 为终止条件，其余在重试上限内可重试。
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SourceError {
  #[error("帧源已关闭")]
  Closed,
  #[error("帧源尚未启动")]
  NotStarted,
  #[error("采集失败: {0}")]
  Capture(String),
  #[error("归还的帧不属于该帧源 (slot {0})")]
  ForeignFrame(u64),
}

/// 出错时所在的流水线阶段。
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Setup,
  Acquire,
  Preprocess,
  Inference,
  Decode,
  Consume,
  Release,
  Teardown,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Stage::Setup => "setup",
      Stage::Acquire => "acquire",
      Stage::Preprocess => "preprocess",
      Stage::Inference => "inference",
      Stage::Decode => "decode",
      Stage::Consume => "consume",
      Stage::Release => "release",
      Stage::Teardown => "teardown",
    };
    f.write_str(name)
  }
}

#[derive(Error, Debug)]
pub enum PipelineError {
  #[error("资源错误: {0}")]
  Resource(#[from] ResourceError),
  #[error("几何参数错误: {0}")]
  Geometry(#[from] GeometryError),
  #[error("后端错误: {0}")]
  Backend(#[from] BackendError),
  #[error("帧源错误: {0}")]
  Source(#[from] SourceError),
  #[error("消费者错误: {0}")]
  Consumer(String),
  #[error("状态 {state:?} 下不允许执行 {operation}")]
  InvalidState {
    state: crate::pipeline::PipelineState,
    operation: &'static str,
  },
  #[error("第 {cycle} 周期 {stage} 阶段失败: {source}")]
  Cycle {
    stage: Stage,
    cycle: u64,
    #[source]
    source: Box<PipelineError>,
  },
}

impl PipelineError {
  /// 附加阶段与周期信息。已经带有上下文的错误不会重复包装。
  pub fn in_cycle(self, stage: Stage, cycle: u64) -> Self {
    match self {
      err @ PipelineError::Cycle { .. } => err,
      err => PipelineError::Cycle {
        stage,
        cycle,
        source: Box::new(err),
      },
    }
  }

  /// 去掉上下文包装后的原始错误。
  pub fn root(&self) -> &PipelineError {
    match self {
      PipelineError::Cycle { source, .. } => source.root(),
      err => err,
    }
  }

  pub fn is_geometry(&self) -> bool {
    matches!(self.root(), PipelineError::Geometry(_))
  }
}

pub(crate) trait WithStage<T> {
  fn stage(self, stage: Stage, cycle: u64) -> Result<T, PipelineError>;
}

impl<T, E: Into<PipelineError>> WithStage<T> for Result<T, E> {
  fn stage(self, stage: Stage, cycle: u64) -> Result<T, PipelineError> {
    self.map_err(|e| e.into().in_cycle(stage, cycle))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn cycle_context_wraps_once() {
    let err = PipelineError::from(SourceError::Closed)
      .in_cycle(Stage::Acquire, 3)
      .in_cycle(Stage::Teardown, 9);
    match &err {
      PipelineError::Cycle { stage, cycle, .. } => {
        assert_eq!(*stage, Stage::Acquire);
        assert_eq!(*cycle, 3);
      }
      other => panic!("unexpected error: {other:?}"),
    }
    assert!(matches!(err.root(), PipelineError::Source(SourceError::Closed)));
  }

  #[test]
  fn geometry_detected_through_context() {
    let err = PipelineError::from(GeometryError::EmptyCrop).in_cycle(Stage::Preprocess, 1);
    assert!(err.is_geometry());
    assert!(err.to_string().contains("preprocess"));
  }
}
