// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model/engine.rs - 通用推理引擎适配
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
  collections::{HashMap, HashSet},
  sync::{Arc, mpsc},
  thread,
};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use super::{
  Completion, InferenceBackend, JobHandle, JobId, ModelHandle, Rejected, Target,
};
use crate::{
  error::BackendError,
  tensor::{TensorSet, TensorShape},
};

/// 模型加载后报告的张量布局
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelInfo {
  pub name: String,
  pub inputs: Vec<TensorShape>,
  pub outputs: Vec<TensorShape>,
}

/// 厂商推理库的最小接口
pub trait Engine: Send + 'static {
  type Model: Send + 'static;

  fn load(&mut self, model: &[u8], target: Target) -> Result<(Self::Model, ModelInfo), BackendError>;

  /// 读取 `tensors.inputs`，把结果写入 `tensors.outputs`。
  fn execute(&mut self, model: &Self::Model, tensors: &mut TensorSet) -> Result<(), BackendError>;

  fn unload(&mut self, model: Self::Model) {
    drop(model);
  }
}

struct Shared<E: Engine> {
  engine: E,
  models: HashMap<u64, E::Model>,
}

impl<E: Engine> Shared<E> {
  fn execute(&mut self, model: u64, tensors: &mut TensorSet) -> Result<(), BackendError> {
    let Shared { engine, models } = self;
    let model = models.get(&model).ok_or(BackendError::UnknownModel(model))?;
    engine.execute(model, tensors)
  }
}

struct WorkItem {
  job: JobId,
  model: u64,
  tensors: TensorSet,
  on_complete: Completion,
}

struct Worker {
  tx: mpsc::Sender<WorkItem>,
  handle: thread::JoinHandle<()>,
}

/// 在任意 `Engine` 之上实现 `InferenceBackend`
///
/// 同步任务在调用线程执行；异步任务交给后端自己的工作线程，完成后在该
/// 线程上调用回调。每个任务句柄同时只允许一个任务在执行。
pub struct EngineBackend<E: Engine> {
  shared: Arc<Mutex<Shared<E>>>,
  busy: Arc<Mutex<HashSet<JobId>>>,
  models: HashMap<u64, ModelInfo>,
  jobs: HashMap<JobId, u64>,
  next_model: u64,
  next_job: u64,
  worker: Option<Worker>,
}

impl<E: Engine> EngineBackend<E> {
  pub fn new(engine: E) -> Self {
    Self {
      shared: Arc::new(Mutex::new(Shared {
        engine,
        models: HashMap::new(),
      })),
      busy: Arc::new(Mutex::new(HashSet::new())),
      models: HashMap::new(),
      jobs: HashMap::new(),
      next_model: 1,
      next_job: 1,
      worker: None,
    }
  }

  pub fn in_flight(&self) -> usize {
    self.busy.lock().len()
  }

  fn check_job(&self, job: &JobHandle, tensors: &TensorSet) -> Result<(), BackendError> {
    match self.jobs.get(&job.id) {
      Some(&model) if model == job.model => {}
      _ => return Err(BackendError::UnknownJob(job.id)),
    }
    if tensors.input_shapes() != job.inputs || tensors.output_shapes() != job.outputs {
      return Err(BackendError::TensorMismatch(format!(
        "任务 {} 的张量与创建时的布局不一致",
        job.id
      )));
    }
    Ok(())
  }

  fn worker(&mut self) -> Result<&mpsc::Sender<WorkItem>, BackendError> {
    if self.worker.is_none() {
      let (tx, rx) = mpsc::channel::<WorkItem>();
      let shared = self.shared.clone();
      let busy = self.busy.clone();
      let handle = thread::Builder::new()
        .name("inference-worker".to_string())
        .spawn(move || {
          for mut item in rx {
            let result = shared.lock().execute(item.model, &mut item.tensors);
            if let Err(e) = &result {
              error!("异步任务 {} 执行失败: {}", item.job, e);
            }
            // 回调返回之前任务仍然算忙
            (item.on_complete)(item.tensors, result);
            busy.lock().remove(&item.job);
          }
          debug!("推理工作线程退出");
        })
        .map_err(|e| BackendError::run(-1, format!("无法创建推理工作线程: {}", e)))?;
      self.worker = Some(Worker { tx, handle });
    }
    match &self.worker {
      Some(worker) => Ok(&worker.tx),
      None => Err(BackendError::Disconnected),
    }
  }
}

impl<E: Engine> InferenceBackend for EngineBackend<E> {
  fn load_model(&mut self, model: &[u8], target: Target) -> Result<ModelHandle, BackendError> {
    info!("加载模型: {} 字节, 目标 {:?}", model.len(), target);
    let (loaded, info) = self.shared.lock().engine.load(model, target)?;
    let id = self.next_model;
    self.next_model += 1;
    self.shared.lock().models.insert(id, loaded);
    debug!(
      "模型 {} ({}) 输入 {:?}, 输出 {:?}",
      id, info.name, info.inputs, info.outputs
    );

    let handle = ModelHandle {
      id,
      name: info.name.clone(),
      inputs: info.inputs.clone(),
      outputs: info.outputs.clone(),
    };
    self.models.insert(id, info);
    Ok(handle)
  }

  fn create_job(
    &mut self,
    model: &ModelHandle,
    inputs: &[TensorShape],
    outputs: &[TensorShape],
  ) -> Result<JobHandle, BackendError> {
    let info = self
      .models
      .get(&model.id)
      .ok_or(BackendError::UnknownModel(model.id))?;
    if info.inputs != inputs {
      return Err(BackendError::TensorMismatch(format!(
        "模型输入 {:?}, 任务输入 {:?}",
        info.inputs, inputs
      )));
    }
    if info.outputs != outputs {
      return Err(BackendError::TensorMismatch(format!(
        "模型输出 {:?}, 任务输出 {:?}",
        info.outputs, outputs
      )));
    }

    let id = JobId(self.next_job);
    self.next_job += 1;
    self.jobs.insert(id, model.id);
    debug!("创建任务 {} (模型 {})", id, model.id);
    Ok(JobHandle {
      id,
      model: model.id,
      inputs: inputs.to_vec(),
      outputs: outputs.to_vec(),
    })
  }

  fn run_sync(&mut self, job: &JobHandle, tensors: &mut TensorSet) -> Result<(), BackendError> {
    self.check_job(job, tensors)?;
    if self.busy.lock().contains(&job.id) {
      return Err(BackendError::JobBusy(job.id));
    }
    self.shared.lock().execute(job.model, tensors)
  }

  fn run_async(
    &mut self,
    job: &JobHandle,
    tensors: TensorSet,
    on_complete: Completion,
  ) -> Result<(), Rejected> {
    if let Err(error) = self.check_job(job, &tensors) {
      return Err(Rejected { error, tensors });
    }
    if !self.busy.lock().insert(job.id) {
      return Err(Rejected {
        error: BackendError::JobBusy(job.id),
        tensors,
      });
    }

    let item = WorkItem {
      job: job.id,
      model: job.model,
      tensors,
      on_complete,
    };
    let sent = match self.worker() {
      Ok(tx) => tx.send(item).map_err(|mpsc::SendError(item)| (BackendError::Disconnected, item)),
      Err(error) => Err((error, item)),
    };
    sent.map_err(|(error, item)| {
      self.busy.lock().remove(&job.id);
      Rejected {
        error,
        tensors: item.tensors,
      }
    })
  }

  fn destroy_job(&mut self, job: JobHandle) -> Result<(), BackendError> {
    if self.busy.lock().contains(&job.id) {
      return Err(BackendError::JobBusy(job.id));
    }
    self
      .jobs
      .remove(&job.id)
      .map(|_| debug!("销毁任务 {}", job.id))
      .ok_or(BackendError::UnknownJob(job.id))
  }

  fn unload_model(&mut self, model: ModelHandle) -> Result<(), BackendError> {
    if self.models.remove(&model.id).is_none() {
      return Err(BackendError::UnknownModel(model.id));
    }
    self.jobs.retain(|_, m| *m != model.id);
    let mut shared = self.shared.lock();
    if let Some(loaded) = shared.models.remove(&model.id) {
      shared.engine.unload(loaded);
    }
    drop(shared);
    info!("卸载模型 {} ({})", model.id, model.name);
    Ok(())
  }
}

impl<E: Engine> Drop for EngineBackend<E> {
  fn drop(&mut self) {
    if let Some(Worker { tx, handle }) = self.worker.take() {
      drop(tx);
      if self.busy.lock().is_empty() {
        if handle.join().is_err() {
          error!("推理工作线程异常退出");
        }
      } else {
        warn!("仍有异步任务在执行, 推理工作线程将被分离");
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use std::{sync::mpsc, time::Duration};

  use super::*;
  use crate::{
    buffer::{Backing, BufferPool},
    tensor::{ElementType, PixelFormat, TensorDescriptor},
  };

  /// 把输入字节之和写入唯一的输出；`gate` 非空时执行前等待放行
  struct SumEngine {
    gate: Option<Arc<Mutex<()>>>,
  }

  fn input_shape() -> TensorShape {
    TensorShape::image(PixelFormat::Rgb, 2, 1)
  }

  fn output_shape() -> TensorShape {
    TensorShape::vector(1, ElementType::F32)
  }

  impl Engine for SumEngine {
    type Model = ();

    fn load(&mut self, model: &[u8], _target: Target) -> Result<((), ModelInfo), BackendError> {
      if model.is_empty() {
        return Err(BackendError::ModelLoad("empty model".into()));
      }
      Ok((
        (),
        ModelInfo {
          name: "sum".into(),
          inputs: vec![input_shape()],
          outputs: vec![output_shape()],
        },
      ))
    }

    fn execute(&mut self, _model: &(), tensors: &mut TensorSet) -> Result<(), BackendError> {
      if let Some(gate) = &self.gate {
        drop(gate.lock());
      }
      let sum: u32 = tensors.inputs[0].bytes().iter().map(|&b| b as u32).sum();
      tensors.outputs[0].write_f32(&[sum as f32]);
      Ok(())
    }
  }

  fn tensors(pool: &mut BufferPool) -> TensorSet {
    let mut input = TensorDescriptor::new(input_shape(), pool.acquire(6).unwrap()).unwrap();
    input.bytes_mut().copy_from_slice(&[1, 2, 3, 4, 5, 6]);
    let output = TensorDescriptor::new(output_shape(), pool.acquire(4).unwrap()).unwrap();
    TensorSet {
      inputs: vec![input],
      outputs: vec![output],
    }
  }

  #[test]
  fn sync_job_runs_on_caller() {
    let mut backend = EngineBackend::new(SumEngine { gate: None });
    let model = backend.load_model(b"m", Target::Cpu).unwrap();
    let job = backend
      .create_job(&model, &[input_shape()], &[output_shape()])
      .unwrap();

    let mut pool = BufferPool::new(Backing::Heap, 4);
    let mut set = tensors(&mut pool);
    backend.run_sync(&job, &mut set).unwrap();
    assert_eq!(set.outputs[0].f32_at(0), Some(21.0));
  }

  #[test]
  fn rejects_malformed_model_and_layout() {
    let mut backend = EngineBackend::new(SumEngine { gate: None });
    assert!(matches!(
      backend.load_model(b"", Target::Auto),
      Err(BackendError::ModelLoad(_))
    ));
    let model = backend.load_model(b"m", Target::Auto).unwrap();
    assert!(matches!(
      backend.create_job(&model, &[output_shape()], &[output_shape()]),
      Err(BackendError::TensorMismatch(_))
    ));
  }

  #[test]
  fn second_async_submission_is_busy_until_callback() {
    let gate = Arc::new(Mutex::new(()));
    let mut backend = EngineBackend::new(SumEngine {
      gate: Some(gate.clone()),
    });
    let model = backend.load_model(b"m", Target::Npu).unwrap();
    let job = backend
      .create_job(&model, &[input_shape()], &[output_shape()])
      .unwrap();
    let mut pool = BufferPool::new(Backing::Heap, 4);
    let first = tensors(&mut pool);
    let second = tensors(&mut pool);

    let held = gate.lock();
    let (tx, rx) = mpsc::channel();
    let done = tx.clone();
    backend
      .run_async(
        &job,
        first,
        Box::new(move |set, result| {
          done.send((set, result)).unwrap();
        }),
      )
      .unwrap();

    let rejected = backend
      .run_async(&job, second, Box::new(|_, _| {}))
      .unwrap_err();
    assert_eq!(rejected.error, BackendError::JobBusy(job.id()));
    assert_eq!(rejected.tensors.inputs.len(), 1);
    let mut second = rejected.tensors;
    assert_eq!(
      backend.run_sync(&job, &mut second),
      Err(BackendError::JobBusy(job.id()))
    );

    drop(held);
    let (set, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    result.unwrap();
    assert_eq!(set.outputs[0].f32_at(0), Some(21.0));
    wait_idle(&backend);

    backend
      .run_async(
        &job,
        second,
        Box::new(move |set, result| {
          tx.send((set, result)).unwrap();
        }),
      )
      .unwrap();
    let (_, result) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(result.is_ok());
  }

  fn wait_idle(backend: &EngineBackend<SumEngine>) {
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while backend.in_flight() > 0 {
      assert!(std::time::Instant::now() < deadline, "任务一直处于忙状态");
      thread::sleep(Duration::from_millis(1));
    }
  }

  #[test]
  fn job_stays_busy_while_callback_runs() {
    let mut backend = EngineBackend::new(SumEngine { gate: None });
    let model = backend.load_model(b"m", Target::Npu).unwrap();
    let job = backend
      .create_job(&model, &[input_shape()], &[output_shape()])
      .unwrap();
    let mut pool = BufferPool::new(Backing::Heap, 4);
    let first = tensors(&mut pool);
    let second = tensors(&mut pool);

    let (entered_tx, entered_rx) = mpsc::channel();
    let (resume_tx, resume_rx) = mpsc::channel::<()>();
    backend
      .run_async(
        &job,
        first,
        Box::new(move |_, result| {
          entered_tx.send(result).unwrap();
          resume_rx.recv().unwrap();
        }),
      )
      .unwrap();

    entered_rx
      .recv_timeout(Duration::from_secs(5))
      .unwrap()
      .unwrap();
    // 回调还没返回
    let rejected = backend
      .run_async(&job, second, Box::new(|_, _| {}))
      .unwrap_err();
    assert_eq!(rejected.error, BackendError::JobBusy(job.id()));
    assert_eq!(backend.in_flight(), 1);
    assert_eq!(
      backend.destroy_job(job.clone()),
      Err(BackendError::JobBusy(job.id()))
    );

    resume_tx.send(()).unwrap();
    wait_idle(&backend);
    let mut second = rejected.tensors;
    backend.run_sync(&job, &mut second).unwrap();
    assert_eq!(second.outputs[0].f32_at(0), Some(21.0));
  }

  #[test]
  fn destroyed_job_and_unloaded_model_are_unknown() {
    let mut backend = EngineBackend::new(SumEngine { gate: None });
    let model = backend.load_model(b"m", Target::Auto).unwrap();
    let job = backend
      .create_job(&model, &[input_shape()], &[output_shape()])
      .unwrap();
    backend.destroy_job(job.clone()).unwrap();

    let mut pool = BufferPool::new(Backing::Heap, 4);
    let mut set = tensors(&mut pool);
    assert_eq!(
      backend.run_sync(&job, &mut set),
      Err(BackendError::UnknownJob(job.id()))
    );
    backend.unload_model(model.clone()).unwrap();
    assert_eq!(
      backend.unload_model(model),
      Err(BackendError::UnknownModel(1))
    );
  }
}
