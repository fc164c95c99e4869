// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline.rs - 流水线协调器
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
  thread,
  time::{Duration, Instant},
};

use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::{
  buffer::{Backing, BufferPool},
  decode::{Detection, DetectionDecoder, ScoreThresholds},
  error::{BackendError, PipelineError, ResourceError, SourceError, Stage, WithStage},
  input::{Frame, FrameSource, NextFrame},
  labels::LabelTable,
  model::{InferenceBackend, JobHandle, ModelHandle, Rejected, Target},
  output::DetectionSink,
  preprocess::{self, CropRect, PreprocessSpec},
  tensor::{TensorDescriptor, TensorSet, TensorShape},
};

mod cancel;
pub use self::cancel::{CancelLevel, CancelToken};

mod completion;
use self::completion::CompletionSlot;

mod stats;
pub use self::stats::{CycleTimings, PipelineStats};

/// `Idle → Running → Draining → Stopped`，`Running`/`Draining` 可转入终止状态 `Error`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
  Idle,
  Running,
  Draining,
  Stopped,
  Error,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InferenceMode {
  #[default]
  Sync,
  Async,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoordinatorOptions {
  pub mode: InferenceMode,
  pub target: Target,
  /// 每次取帧的最长等待
  pub frame_timeout: Duration,
  /// 连续采集失败的重试上限，`SourceError::Closed` 不重试
  pub source_retries: u32,
  /// 几何参数错误时跳过当前帧而不是终止
  pub skip_invalid_geometry: bool,
  pub busy_retries: u32,
  pub busy_backoff: Duration,
  /// 完成这么多周期后排空
  pub max_frames: Option<u64>,
  pub backing: Backing,
  /// 等待异步结果时检查强制取消的间隔
  pub cancel_poll: Duration,
}

impl Default for CoordinatorOptions {
  fn default() -> Self {
    Self {
      mode: InferenceMode::Sync,
      target: Target::Auto,
      frame_timeout: Duration::from_secs(1),
      source_retries: 3,
      skip_invalid_geometry: true,
      busy_retries: 3,
      busy_backoff: Duration::from_millis(5),
      max_frames: None,
      backing: Backing::Heap,
      cancel_poll: Duration::from_millis(20),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
  /// 帧源结束或达到帧数上限
  Completed,
  /// 收到取消请求，已排空
  Cancelled,
  /// 强制终止，进行中的推理被放弃
  Aborted,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleStatus {
  Processed,
  Skipped,
  Empty,
  EndOfStream,
  Aborted,
}

/// 交给消费者的单周期结果，只在回调期间有效
#[derive(Debug)]
pub struct CycleReport<'a> {
  pub cycle: u64,
  pub frame: &'a Frame,
  pub detections: &'a [Detection],
  pub labels: &'a LabelTable,
  /// `consume` 尚未计入
  pub timings: CycleTimings,
}

/// 停止时缓冲池的回收情况
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolUsage {
  pub allocated: usize,
  pub returned: usize,
}

pub struct CoordinatorBuilder<S, B, D> {
  source: S,
  backend: B,
  decoder: D,
  model: Vec<u8>,
  crop: Option<CropRect>,
  thresholds: ScoreThresholds,
  labels: LabelTable,
  options: CoordinatorOptions,
  cancel: CancelToken,
}

impl<S: FrameSource, B: InferenceBackend, D: DetectionDecoder> CoordinatorBuilder<S, B, D> {
  pub fn model(mut self, model: Vec<u8>) -> Self {
    self.model = model;
    self
  }

  pub fn crop(mut self, crop: Option<CropRect>) -> Self {
    self.crop = crop;
    self
  }

  pub fn thresholds(mut self, thresholds: ScoreThresholds) -> Self {
    self.thresholds = thresholds;
    self
  }

  pub fn labels(mut self, labels: LabelTable) -> Self {
    self.labels = labels;
    self
  }

  pub fn options(mut self, options: CoordinatorOptions) -> Self {
    self.options = options;
    self
  }

  pub fn cancel_token(mut self, cancel: CancelToken) -> Self {
    self.cancel = cancel;
    self
  }

  pub fn build(self) -> Coordinator<S, B, D> {
    Coordinator {
      source: self.source,
      backend: self.backend,
      decoder: self.decoder,
      model_bytes: self.model,
      crop: self.crop,
      thresholds: self.thresholds,
      labels: self.labels,
      options: self.options,
      cancel: self.cancel,
      state: PipelineState::Idle,
      stats: PipelineStats::default(),
      cycle: 0,
      spec: None,
      pool: None,
      model: None,
      job: None,
      tensors: None,
      source_started: false,
      pool_usage: None,
    }
  }
}

/// 逐帧驱动 取帧 → 预处理 → 推理 → 解码 → 消费 → 归还帧
///
/// 张量缓冲区在启动时按模型布局分配一次，之后每个周期复用；任一时刻缓冲区
/// 只属于一个阶段。所有调用都在协调线程上进行，异步推理的结果通过
/// `CompletionSlot` 交回。
pub struct Coordinator<S: FrameSource, B: InferenceBackend, D: DetectionDecoder> {
  source: S,
  backend: B,
  decoder: D,
  model_bytes: Vec<u8>,
  crop: Option<CropRect>,
  thresholds: ScoreThresholds,
  labels: LabelTable,
  options: CoordinatorOptions,
  cancel: CancelToken,
  state: PipelineState,
  stats: PipelineStats,
  cycle: u64,
  spec: Option<PreprocessSpec>,
  pool: Option<BufferPool>,
  model: Option<ModelHandle>,
  job: Option<JobHandle>,
  tensors: Option<TensorSet>,
  source_started: bool,
  pool_usage: Option<PoolUsage>,
}

impl<S: FrameSource, B: InferenceBackend, D: DetectionDecoder> Coordinator<S, B, D> {
  pub fn builder(source: S, backend: B, decoder: D) -> CoordinatorBuilder<S, B, D> {
    CoordinatorBuilder {
      source,
      backend,
      decoder,
      model: Vec::new(),
      crop: None,
      thresholds: ScoreThresholds::default(),
      labels: LabelTable::default(),
      options: CoordinatorOptions::default(),
      cancel: CancelToken::new(),
    }
  }

  pub fn state(&self) -> PipelineState {
    self.state
  }

  pub fn stats(&self) -> &PipelineStats {
    &self.stats
  }

  pub fn cancel_token(&self) -> CancelToken {
    self.cancel.clone()
  }

  pub fn source(&self) -> &S {
    &self.source
  }

  pub fn backend(&self) -> &B {
    &self.backend
  }

  pub fn pool(&self) -> Option<&BufferPool> {
    self.pool.as_ref()
  }

  pub fn set_max_frames(&mut self, max_frames: Option<u64>) {
    self.options.max_frames = max_frames;
  }

  /// 最近一次释放资源时的缓冲池回收情况
  pub fn pool_usage(&self) -> Option<PoolUsage> {
    self.pool_usage
  }

  /// 加载模型、创建任务、分配张量缓冲区并启动帧源
  pub fn start(&mut self) -> Result<(), PipelineError> {
    if self.state != PipelineState::Idle {
      return Err(PipelineError::InvalidState {
        state: self.state,
        operation: "start",
      });
    }

    info!("启动流水线");
    match self.setup() {
      Ok(()) => {
        self.transition(PipelineState::Running);
        Ok(())
      }
      Err(e) => {
        error!("流水线启动失败: {}", e);
        if let Err(e) = self.release_resources(false) {
          warn!("释放资源失败: {}", e);
        }
        self.transition(PipelineState::Error);
        Err(e)
      }
    }
  }

  /// 循环处理直到帧源结束、达到帧数上限或被取消
  pub fn run<K: DetectionSink>(&mut self, sink: &mut K) -> Result<Outcome, PipelineError> {
    self.ensure_running("run")?;

    let outcome = loop {
      if self.cancel.is_forced() {
        info!("收到强制终止请求");
        break Outcome::Aborted;
      }
      if self.cancel.is_cancelled() {
        info!("收到取消请求, 不再开始新的周期");
        break Outcome::Cancelled;
      }
      if self
        .options
        .max_frames
        .is_some_and(|max| self.stats.cycles_completed >= max)
      {
        info!("已处理 {} 帧, 达到上限", self.stats.cycles_completed);
        break Outcome::Completed;
      }

      match self.step(sink) {
        Ok(CycleStatus::EndOfStream) => {
          info!("帧源已结束");
          break Outcome::Completed;
        }
        Ok(CycleStatus::Aborted) => break Outcome::Aborted,
        Ok(_) => {}
        Err(e) => return Err(self.fail(e)),
      }
    };

    self.finish(outcome)
  }

  /// 只处理一个周期，流水线保持运行
  pub fn run_once<K: DetectionSink>(&mut self, sink: &mut K) -> Result<CycleStatus, PipelineError> {
    self.ensure_running("run_once")?;
    match self.step(sink) {
      Ok(CycleStatus::Aborted) => {
        self.finish(Outcome::Aborted)?;
        Ok(CycleStatus::Aborted)
      }
      Ok(status) => Ok(status),
      Err(e) => Err(self.fail(e)),
    }
  }

  /// 排空并按获取的逆序释放资源
  pub fn stop(&mut self) -> Result<(), PipelineError> {
    match self.state {
      PipelineState::Idle => {
        self.transition(PipelineState::Stopped);
        Ok(())
      }
      PipelineState::Running | PipelineState::Draining => self.finish(Outcome::Cancelled).map(|_| ()),
      PipelineState::Stopped => Ok(()),
      PipelineState::Error => Err(PipelineError::InvalidState {
        state: self.state,
        operation: "stop",
      }),
    }
  }

  fn ensure_running(&mut self, operation: &'static str) -> Result<(), PipelineError> {
    if self.state == PipelineState::Idle {
      self.start()?;
    }
    if self.state != PipelineState::Running {
      return Err(PipelineError::InvalidState {
        state: self.state,
        operation,
      });
    }
    Ok(())
  }

  fn transition(&mut self, next: PipelineState) {
    if self.state != next {
      info!("流水线状态: {:?} -> {:?}", self.state, next);
      self.state = next;
    }
  }

  fn setup(&mut self) -> Result<(), PipelineError> {
    let model = self
      .backend
      .load_model(&self.model_bytes, self.options.target)
      .stage(Stage::Setup, 0)?;
    let model = self.model.insert(model);
    let input = match model.inputs.as_slice() {
      [input] => *input,
      inputs => {
        return Err(
          PipelineError::from(BackendError::TensorMismatch(format!(
            "流水线只支持单输入模型, 实际 {} 个输入",
            inputs.len()
          )))
          .in_cycle(Stage::Setup, 0),
        );
      }
    };
    let outputs = self.decoder.output_shapes();
    let job = self
      .backend
      .create_job(model, &[input], &outputs)
      .stage(Stage::Setup, 0)?;
    info!("模型 {} 已就绪, 任务 {}", model.name, job.id());
    self.job = Some(job);

    let source_shape = self.source.shape();
    let mut spec =
      PreprocessSpec::new(source_shape.format, input.format).with_scale(input.width, input.height);
    if let Some(crop) = self.crop {
      spec = spec.with_crop(crop);
    }
    preprocess::validate(&spec, &source_shape, &input).stage(Stage::Setup, 0)?;
    self.spec = Some(spec);
    debug!("预处理参数: {:?}", spec);

    let pool = self
      .pool
      .insert(BufferPool::new(self.options.backing.clone(), 1 + outputs.len()));
    let tensors = allocate_tensors(pool, input, &outputs).stage(Stage::Setup, 0)?;
    self.tensors = Some(tensors);
    self.pool_usage = None;

    self.source.start().stage(Stage::Setup, 0)?;
    self.source_started = true;
    Ok(())
  }

  /// 按获取的逆序释放：帧源、张量缓冲区、任务、模型
  ///
  /// `abandon_backend` 为真时进行中的任务仍持有张量，任务与模型句柄直接放弃。
  fn release_resources(&mut self, abandon_backend: bool) -> Result<(), PipelineError> {
    let mut first_error: Option<PipelineError> = None;
    let cycle = self.cycle;

    if self.source_started {
      self.source_started = false;
      if let Err(e) = self.source.stop() {
        warn!("停止帧源失败: {}", e);
        first_error.get_or_insert(PipelineError::from(e).in_cycle(Stage::Teardown, cycle));
      }
    }

    if let Some(mut pool) = self.pool.take() {
      if let Some(tensors) = self.tensors.take() {
        for buffer in tensors.into_buffers() {
          if let Err(e) = pool.release(buffer) {
            warn!("归还张量缓冲区失败: {}", e);
          }
        }
      }
      let usage = PoolUsage {
        allocated: pool.created(),
        returned: pool.free_count(),
      };
      let outstanding = pool.clear();
      if outstanding > 0 {
        warn!("{} 个张量缓冲区未能回收", outstanding);
      }
      self.pool_usage = Some(usage);
    }

    if abandon_backend {
      let job = self.job.take();
      let model = self.model.take();
      if job.is_some() || model.is_some() {
        warn!("强制终止, 放弃任务与模型句柄");
      }
    } else {
      let job = self.job.take().map(|job| self.destroy_job(job));
      if let Some(Err(e)) = job {
        warn!("销毁任务失败: {}", e);
        first_error.get_or_insert(PipelineError::from(e).in_cycle(Stage::Teardown, cycle));
      }
      let model = self.model.take().map(|model| self.backend.unload_model(model));
      if let Some(Err(e)) = model {
        warn!("卸载模型失败: {}", e);
        first_error.get_or_insert(PipelineError::from(e).in_cycle(Stage::Teardown, cycle));
      }
    }

    first_error.map_or(Ok(()), Err)
  }

  /// 异步回调返回前任务仍记为忙，按退避重试
  fn destroy_job(&mut self, job: JobHandle) -> Result<(), BackendError> {
    let mut attempts = 0;
    loop {
      match self.backend.destroy_job(job.clone()) {
        Err(BackendError::JobBusy(id)) if attempts < self.options.busy_retries => {
          attempts += 1;
          debug!("销毁任务时任务 {} 忙, 第 {} 次重试", id, attempts);
          thread::sleep(self.options.busy_backoff);
        }
        result => return result,
      }
    }
  }

  fn finish(&mut self, outcome: Outcome) -> Result<Outcome, PipelineError> {
    self.transition(PipelineState::Draining);
    // 张量已交回说明后端没有进行中的任务，仍可正常销毁
    let abandon = outcome == Outcome::Aborted && self.tensors.is_none();
    match self.release_resources(abandon) {
      Ok(()) => {
        self.transition(PipelineState::Stopped);
        info!("流水线结束: {:?}, 统计: {:?}", outcome, self.stats);
        Ok(outcome)
      }
      Err(e) => {
        error!("释放资源失败: {}", e);
        self.transition(PipelineState::Error);
        Err(e)
      }
    }
  }

  fn fail(&mut self, err: PipelineError) -> PipelineError {
    error!("流水线失败: {}", err);
    if let Err(e) = self.release_resources(false) {
      warn!("释放资源失败: {}", e);
    }
    self.transition(PipelineState::Error);
    err
  }

  fn step<K: DetectionSink>(&mut self, sink: &mut K) -> Result<CycleStatus, PipelineError> {
    let cycle = self.cycle + 1;
    let started = Instant::now();
    let frame = match self.acquire(cycle)? {
      NextFrame::Frame(frame) => frame,
      NextFrame::Empty => {
        self.stats.empty_polls += 1;
        debug!("等待帧超时");
        return Ok(CycleStatus::Empty);
      }
      NextFrame::EndOfStream => return Ok(CycleStatus::EndOfStream),
    };
    self.cycle = cycle;
    let acquire = started.elapsed();

    let result = self.process(cycle, &frame, acquire, sink);
    self.source.release_frame(frame).stage(Stage::Release, cycle)?;

    match result {
      Err(e) if e.is_geometry() => {
        self.stats.geometry_errors += 1;
        if !self.options.skip_invalid_geometry {
          return Err(e);
        }
        self.stats.cycles_skipped += 1;
        warn!("跳过第 {} 周期: {}", cycle, e);
        Ok(CycleStatus::Skipped)
      }
      result => result,
    }
  }

  fn acquire(&mut self, cycle: u64) -> Result<NextFrame, PipelineError> {
    let mut failures = 0;
    loop {
      match self.source.next_frame(self.options.frame_timeout) {
        Ok(next) => return Ok(next),
        Err(SourceError::Closed) => {
          return Err(PipelineError::from(SourceError::Closed).in_cycle(Stage::Acquire, cycle));
        }
        Err(e) if failures < self.options.source_retries => {
          failures += 1;
          self.stats.source_retries += 1;
          warn!(
            "采集失败 ({}/{}): {}",
            failures, self.options.source_retries, e
          );
        }
        Err(e) => return Err(PipelineError::from(e).in_cycle(Stage::Acquire, cycle)),
      }
    }
  }

  fn process<K: DetectionSink>(
    &mut self,
    cycle: u64,
    frame: &Frame,
    acquire: Duration,
    sink: &mut K,
  ) -> Result<CycleStatus, PipelineError> {
    let not_running = PipelineError::InvalidState {
      state: self.state,
      operation: "process",
    };
    let Some(spec) = self.spec else {
      return Err(not_running);
    };
    let Some(mut tensors) = self.tensors.take() else {
      return Err(not_running);
    };

    let started = Instant::now();
    let converted = match tensors.inputs.first_mut() {
      Some(input) => preprocess::convert(frame.tensor(), input, &spec).map_err(PipelineError::from),
      None => Err(BackendError::TensorMismatch("缺少输入张量".into()).into()),
    };
    if let Err(e) = converted {
      self.tensors = Some(tensors);
      return Err(e.in_cycle(Stage::Preprocess, cycle));
    }
    let preprocess = started.elapsed();

    let started = Instant::now();
    let Some(tensors) = self.infer(cycle, tensors)? else {
      return Ok(CycleStatus::Aborted);
    };
    let inference = started.elapsed();

    let started = Instant::now();
    let decoded = self.decoder.decode(&tensors.outputs, &self.thresholds);
    self.tensors = Some(tensors);
    let detections = decoded.stage(Stage::Decode, cycle)?;
    let decode = started.elapsed();

    let mut timings = CycleTimings {
      acquire,
      preprocess,
      inference,
      decode,
      consume: Duration::ZERO,
    };
    let started = Instant::now();
    let report = CycleReport {
      cycle,
      frame,
      detections: &detections,
      labels: &self.labels,
      timings,
    };
    sink
      .consume(&report)
      .map_err(|e| PipelineError::Consumer(e.to_string()).in_cycle(Stage::Consume, cycle))?;
    timings.consume = started.elapsed();

    debug!(
      "第 {} 周期 (帧 {}): {} 个检测, 推理 {:.2?}, 总计 {:.2?}",
      cycle,
      frame.sequence(),
      detections.len(),
      timings.inference,
      timings.total()
    );
    self.stats.record(timings, detections.len());
    Ok(CycleStatus::Processed)
  }

  /// 返回 `None` 表示强制取消
  ///
  /// 同步模式下张量已放回协调器；异步模式下张量留在后端不再回收。
  fn infer(&mut self, cycle: u64, tensors: TensorSet) -> Result<Option<TensorSet>, PipelineError> {
    let Some(job) = self.job.as_ref() else {
      self.tensors = Some(tensors);
      return Err(PipelineError::InvalidState {
        state: self.state,
        operation: "infer",
      });
    };

    match self.options.mode {
      InferenceMode::Sync => {
        let mut tensors = tensors;
        if self.cancel.is_forced() {
          warn!("强制终止: 第 {} 周期不再提交推理", cycle);
          self.tensors = Some(tensors);
          return Ok(None);
        }
        let mut attempts = 0;
        loop {
          match self.backend.run_sync(job, &mut tensors) {
            Ok(()) if self.cancel.is_forced() => {
              warn!("强制终止: 丢弃第 {} 周期的推理结果", cycle);
              self.tensors = Some(tensors);
              return Ok(None);
            }
            Ok(()) => return Ok(Some(tensors)),
            Err(BackendError::JobBusy(id)) if attempts < self.options.busy_retries => {
              attempts += 1;
              self.stats.busy_retries += 1;
              debug!("任务 {} 忙, 第 {} 次重试", id, attempts);
              thread::sleep(self.options.busy_backoff);
            }
            Err(e) => {
              self.tensors = Some(tensors);
              return Err(PipelineError::from(e).in_cycle(Stage::Inference, cycle));
            }
          }
        }
      }
      InferenceMode::Async => {
        let slot = CompletionSlot::new();
        let mut pending = tensors;
        let mut attempts = 0;
        loop {
          match self.backend.run_async(job, pending, slot.completer()) {
            Ok(()) => break,
            Err(Rejected {
              error: BackendError::JobBusy(id),
              tensors,
            }) if attempts < self.options.busy_retries => {
              attempts += 1;
              self.stats.busy_retries += 1;
              debug!("任务 {} 忙, 第 {} 次重试", id, attempts);
              pending = tensors;
              thread::sleep(self.options.busy_backoff);
            }
            Err(Rejected { error, tensors }) => {
              self.tensors = Some(tensors);
              return Err(PipelineError::from(error).in_cycle(Stage::Inference, cycle));
            }
          }
        }

        loop {
          if let Some((tensors, result)) = slot.wait(self.options.cancel_poll) {
            return match result {
              Ok(()) => Ok(Some(tensors)),
              Err(e) => {
                self.tensors = Some(tensors);
                Err(PipelineError::from(e).in_cycle(Stage::Inference, cycle))
              }
            };
          }
          if self.cancel.is_forced() {
            warn!("强制终止: 放弃第 {} 周期进行中的推理", cycle);
            return Ok(None);
          }
        }
      }
    }
  }
}

impl<S: FrameSource, B: InferenceBackend, D: DetectionDecoder> Drop for Coordinator<S, B, D> {
  fn drop(&mut self) {
    if matches!(self.state, PipelineState::Running | PipelineState::Draining) {
      warn!("流水线未停止即被丢弃, 释放资源");
      if let Err(e) = self.release_resources(false) {
        warn!("释放资源失败: {}", e);
      }
    }
  }
}

fn allocate_tensors(
  pool: &mut BufferPool,
  input: TensorShape,
  outputs: &[TensorShape],
) -> Result<TensorSet, ResourceError> {
  let mut made: Vec<TensorDescriptor> = Vec::with_capacity(1 + outputs.len());
  for shape in std::iter::once(input).chain(outputs.iter().copied()) {
    let made_one = pool
      .acquire(shape.byte_len())
      .and_then(|buffer| {
        TensorDescriptor::new(shape, buffer).map_err(|(e, buffer)| {
          if let Err(e) = pool.release(buffer) {
            warn!("归还张量缓冲区失败: {}", e);
          }
          e
        })
      });
    match made_one {
      Ok(tensor) => made.push(tensor),
      Err(e) => {
        // 已分配的部分归还缓冲池
        for tensor in made {
          if let Err(e) = pool.release(tensor.into_buffer()) {
            warn!("归还张量缓冲区失败: {}", e);
          }
        }
        return Err(e);
      }
    }
  }

  let outputs = made.split_off(1);
  debug!(
    "分配张量缓冲区: 输入 {:?}, 输出 {} 个",
    input,
    outputs.len()
  );
  Ok(TensorSet {
    inputs: made,
    outputs,
  })
}
