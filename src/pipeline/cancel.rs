// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/cancel.rs - 取消令牌
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

use std::sync::{
  Arc,
  atomic::{AtomicU32, Ordering},
};

/// 取消请求的级别
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum CancelLevel {
  None,
  /// 完成当前周期后排空
  Graceful,
  /// 立即终止，不再等待进行中的推理
  Forced,
}

/// 协作式取消标志，可跨线程克隆。第一次 `cancel` 为优雅停止，第二次为强制终止。
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
  count: Arc<AtomicU32>,
}

impl CancelToken {
  pub fn new() -> Self {
    Self::default()
  }

  /// 递增取消级别并返回新的级别
  pub fn cancel(&self) -> CancelLevel {
    let previous = self
      .count
      .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| Some(n.saturating_add(1)))
      .unwrap_or_else(|n| n);
    Self::level_of(previous.saturating_add(1))
  }

  pub fn level(&self) -> CancelLevel {
    Self::level_of(self.count.load(Ordering::SeqCst))
  }

  pub fn is_cancelled(&self) -> bool {
    self.level() != CancelLevel::None
  }

  pub fn is_forced(&self) -> bool {
    self.level() == CancelLevel::Forced
  }

  fn level_of(count: u32) -> CancelLevel {
    match count {
      0 => CancelLevel::None,
      1 => CancelLevel::Graceful,
      _ => CancelLevel::Forced,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn escalates_on_repeat() {
    let token = CancelToken::new();
    let shared = token.clone();
    assert_eq!(token.level(), CancelLevel::None);
    assert_eq!(shared.cancel(), CancelLevel::Graceful);
    assert!(token.is_cancelled() && !token.is_forced());
    assert_eq!(shared.cancel(), CancelLevel::Forced);
    assert_eq!(shared.cancel(), CancelLevel::Forced);
    assert!(token.is_forced());
  }
}
