// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 运行模式
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

use std::{thread, time::Duration};

use anyhow::{Context, bail};
use tracing::{info, warn};

use crate::{
  decode::DetectionDecoder,
  input::FrameSource,
  model::InferenceBackend,
  output::DetectionSink,
  pipeline::{CancelLevel, Coordinator, CycleStatus, Outcome, PipelineStats},
};

/// 强制取消后等待协调线程退出的时间
const FORCED_EXIT_DELAY: Duration = Duration::from_secs(1);
const ONE_SHOT_ATTEMPTS: usize = 10;

#[derive(Debug, Clone, PartialEq)]
pub struct TaskSummary {
  pub outcome: Outcome,
  pub stats: PipelineStats,
}

pub trait Task<S: FrameSource, B: InferenceBackend, D: DetectionDecoder, K>: Sized {
  type Error;
  fn run_task(self, coordinator: Coordinator<S, B, D>, sink: K) -> Result<TaskSummary, Self::Error>;
}

/// 只处理一帧
#[derive(Debug, Default)]
pub struct OneShotTask;

impl<S, B, D, K> Task<S, B, D, K> for OneShotTask
where
  S: FrameSource,
  B: InferenceBackend,
  D: DetectionDecoder,
  K: DetectionSink,
{
  type Error = anyhow::Error;

  fn run_task(self, mut coordinator: Coordinator<S, B, D>, mut sink: K) -> Result<TaskSummary, Self::Error> {
    info!("开始任务...");
    coordinator.start()?;

    let mut attempts = 0;
    let status = loop {
      attempts += 1;
      match coordinator.run_once(&mut sink)? {
        CycleStatus::Empty if attempts < ONE_SHOT_ATTEMPTS => continue,
        status => break status,
      }
    };

    match status {
      CycleStatus::Processed => {
        if let Some(timings) = coordinator.stats().last_cycle {
          info!(
            "推理完成，耗时: {:.2?}, 总计: {:.2?}",
            timings.inference,
            timings.total()
          );
        }
      }
      CycleStatus::Aborted => {
        return Ok(TaskSummary {
          outcome: Outcome::Aborted,
          stats: coordinator.stats().clone(),
        });
      }
      CycleStatus::Empty | CycleStatus::EndOfStream => {
        coordinator.stop()?;
        bail!("没有输入帧");
      }
      CycleStatus::Skipped => {
        coordinator.stop()?;
        bail!("输入帧预处理失败");
      }
    }

    coordinator.stop()?;
    Ok(TaskSummary {
      outcome: Outcome::Completed,
      stats: coordinator.stats().clone(),
    })
  }
}

/// 持续处理直到帧源结束、达到帧数或收到中断信号
///
/// 第一次中断排空后退出，超过宽限时间仍未退出则强制结束进程；
/// 第二次中断放弃进行中的推理。
#[derive(Debug)]
pub struct ContinuousTask {
  frame_number: Option<u64>,
  grace: Duration,
}

impl Default for ContinuousTask {
  fn default() -> Self {
    Self {
      frame_number: None,
      grace: Duration::from_secs(30),
    }
  }
}

impl ContinuousTask {
  pub fn with_frame_number(mut self, frame_number: Option<u64>) -> Self {
    self.frame_number = frame_number;
    self
  }

  pub fn with_grace(mut self, grace: Duration) -> Self {
    self.grace = grace;
    self
  }
}

impl<S, B, D, K> Task<S, B, D, K> for ContinuousTask
where
  S: FrameSource,
  B: InferenceBackend,
  D: DetectionDecoder,
  K: DetectionSink,
{
  type Error = anyhow::Error;

  fn run_task(self, mut coordinator: Coordinator<S, B, D>, mut sink: K) -> Result<TaskSummary, Self::Error> {
    info!("开始任务...");
    let cancel = coordinator.cancel_token();
    let grace = self.grace;

    ctrlc::set_handler(move || match cancel.cancel() {
      CancelLevel::Graceful => {
        info!("收到中断信号，准备退出...");
        thread::spawn(move || {
          thread::sleep(grace);
          warn!("排空超时, 强制退出程序");
          std::process::exit(1);
        });
      }
      _ => {
        warn!("再次收到中断信号，放弃进行中的推理");
        thread::spawn(|| {
          thread::sleep(FORCED_EXIT_DELAY);
          warn!("强制退出程序");
          std::process::exit(130);
        });
      }
    })
    .context("无法设置 Ctrl-C 处理函数")?;

    if self.frame_number.is_some() {
      coordinator.set_max_frames(self.frame_number);
    }

    let outcome = coordinator.run(&mut sink)?;
    let stats = coordinator.stats().clone();
    info!(
      "任务结束: {:?}, 完成 {} 帧, 跳过 {} 帧, 共 {} 个检测",
      outcome, stats.cycles_completed, stats.cycles_skipped, stats.detections_emitted
    );
    if outcome == Outcome::Aborted {
      warn!("任务被强制终止");
    }
    Ok(TaskSummary { outcome, stats })
  }
}
