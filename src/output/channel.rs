// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/channel.rs - 转发到通道的消费者
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

use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};

use thiserror::Error;
use tracing::warn;

use super::{CycleRecord, DetectionSink};
use crate::pipeline::CycleReport;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ChannelSinkError {
  #[error("接收端已关闭")]
  Disconnected,
}

/// 把结果副本放入有界通道，交给其他线程消费
///
/// 协调线程不会在这里阻塞：通道满时丢弃本周期的记录并计数。
pub struct ChannelSink {
  tx: SyncSender<CycleRecord>,
  dropped: u64,
}

impl ChannelSink {
  pub fn bounded(capacity: usize) -> (Self, Receiver<CycleRecord>) {
    let (tx, rx) = mpsc::sync_channel(capacity);
    (Self { tx, dropped: 0 }, rx)
  }

  pub fn dropped(&self) -> u64 {
    self.dropped
  }
}

impl DetectionSink for ChannelSink {
  type Error = ChannelSinkError;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error> {
    match self.tx.try_send(CycleRecord::from_report(report)) {
      Ok(()) => Ok(()),
      Err(TrySendError::Full(record)) => {
        self.dropped += 1;
        warn!("结果通道已满, 丢弃第 {} 周期的记录", record.cycle);
        Ok(())
      }
      Err(TrySendError::Disconnected(_)) => Err(ChannelSinkError::Disconnected),
    }
  }
}
