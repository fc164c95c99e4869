// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/stats.rs - 流水线计数器
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

use std::time::Duration;

use serde::Serialize;

/// 单个周期各阶段耗时
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CycleTimings {
  pub acquire: Duration,
  pub preprocess: Duration,
  pub inference: Duration,
  pub decode: Duration,
  pub consume: Duration,
}

impl CycleTimings {
  pub fn total(&self) -> Duration {
    self.acquire + self.preprocess + self.inference + self.decode + self.consume
  }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PipelineStats {
  pub cycles_completed: u64,
  pub cycles_skipped: u64,
  pub geometry_errors: u64,
  pub source_retries: u64,
  pub empty_polls: u64,
  pub detections_emitted: u64,
  pub busy_retries: u64,
  pub last_cycle: Option<CycleTimings>,
}

impl PipelineStats {
  /// 记录一个完成的周期
  pub fn record(&mut self, timings: CycleTimings, detections: usize) {
    self.cycles_completed += 1;
    self.detections_emitted += detections as u64;
    self.last_cycle = Some(timings);
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn record_accumulates() {
    let mut stats = PipelineStats::default();
    let timings = CycleTimings {
      inference: Duration::from_millis(20),
      decode: Duration::from_millis(2),
      ..Default::default()
    };
    stats.record(timings, 3);
    stats.record(timings, 0);
    assert_eq!(stats.cycles_completed, 2);
    assert_eq!(stats.detections_emitted, 3);
    assert_eq!(stats.last_cycle.map(|t| t.total()), Some(Duration::from_millis(22)));
  }
}
