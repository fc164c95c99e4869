// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 推理后端
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

use serde::Deserialize;

use crate::{
  error::BackendError,
  tensor::{TensorSet, TensorShape},
};

mod engine;
pub use self::engine::{Engine, EngineBackend, ModelInfo};

#[cfg(feature = "rknn")]
mod rknn;
#[cfg(feature = "rknn")]
pub use self::rknn::{RknnEngine, RknnEngineBuilder, RknnEngineError};

/// 模型运行的目标设备
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Target {
  #[default]
  Auto,
  Cpu,
  Gpu,
  Npu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "#{}", self.0)
  }
}

/// 已加载的模型及其张量布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelHandle {
  pub(crate) id: u64,
  pub name: String,
  pub inputs: Vec<TensorShape>,
  pub outputs: Vec<TensorShape>,
}

impl ModelHandle {
  pub fn id(&self) -> u64 {
    self.id
  }
}

/// 绑定到固定张量布局的推理任务。同一句柄同时只能有一个任务在执行。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobHandle {
  pub(crate) id: JobId,
  pub(crate) model: u64,
  pub inputs: Vec<TensorShape>,
  pub outputs: Vec<TensorShape>,
}

impl JobHandle {
  pub fn id(&self) -> JobId {
    self.id
  }
}

/// 异步任务完成回调，在后端工作线程上调用。
///
/// 回调不得重新调用后端接口：只应把结果交给协调线程后立即返回。
pub type Completion = Box<dyn FnOnce(TensorSet, Result<(), BackendError>) + Send + 'static>;

/// 提交被拒绝时，张量原样交还调用方。
#[derive(Debug)]
pub struct Rejected {
  pub error: BackendError,
  pub tensors: TensorSet,
}

pub trait InferenceBackend: Send {
  fn load_model(&mut self, model: &[u8], target: Target) -> Result<ModelHandle, BackendError>;

  fn create_job(
    &mut self,
    model: &ModelHandle,
    inputs: &[TensorShape],
    outputs: &[TensorShape],
  ) -> Result<JobHandle, BackendError>;

  /// 阻塞直到推理完成
  fn run_sync(&mut self, job: &JobHandle, tensors: &mut TensorSet) -> Result<(), BackendError>;

  /// 提交后立即返回，结果通过 `on_complete` 交付。
  /// 前一次提交的回调尚未触发时返回 `JobBusy`。
  fn run_async(
    &mut self,
    job: &JobHandle,
    tensors: TensorSet,
    on_complete: Completion,
  ) -> Result<(), Rejected>;

  fn destroy_job(&mut self, job: JobHandle) -> Result<(), BackendError>;

  fn unload_model(&mut self, model: ModelHandle) -> Result<(), BackendError>;
}

impl<B: InferenceBackend + ?Sized> InferenceBackend for Box<B> {
  fn load_model(&mut self, model: &[u8], target: Target) -> Result<ModelHandle, BackendError> {
    (**self).load_model(model, target)
  }

  fn create_job(
    &mut self,
    model: &ModelHandle,
    inputs: &[TensorShape],
    outputs: &[TensorShape],
  ) -> Result<JobHandle, BackendError> {
    (**self).create_job(model, inputs, outputs)
  }

  fn run_sync(&mut self, job: &JobHandle, tensors: &mut TensorSet) -> Result<(), BackendError> {
    (**self).run_sync(job, tensors)
  }

  fn run_async(
    &mut self,
    job: &JobHandle,
    tensors: TensorSet,
    on_complete: Completion,
  ) -> Result<(), Rejected> {
    (**self).run_async(job, tensors, on_complete)
  }

  fn destroy_job(&mut self, job: JobHandle) -> Result<(), BackendError> {
    (**self).destroy_job(job)
  }

  fn unload_model(&mut self, model: ModelHandle) -> Result<(), BackendError> {
    (**self).unload_model(model)
  }
}
