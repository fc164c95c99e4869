// 该文件是 Shanan （山南西风） 项目的一部分。
// src/pipeline/completion.rs - 异步推理结果交接
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

use std::{sync::Arc, time::Duration};

use parking_lot::{Condvar, Mutex};

use crate::{error::BackendError, model::Completion, tensor::TensorSet};

type Delivered = (TensorSet, Result<(), BackendError>);

/// 工作线程回调与协调线程之间的单次交接
///
/// 回调只写入结果并唤醒等待者，不会回到后端接口。
#[derive(Clone, Default)]
pub(crate) struct CompletionSlot {
  inner: Arc<(Mutex<Option<Delivered>>, Condvar)>,
}

impl CompletionSlot {
  pub(crate) fn new() -> Self {
    Self::default()
  }

  pub(crate) fn completer(&self) -> Completion {
    let inner = self.inner.clone();
    Box::new(move |tensors, result| {
      let (slot, ready) = &*inner;
      *slot.lock() = Some((tensors, result));
      ready.notify_one();
    })
  }

  /// 最多等待 `timeout`，期间结果到达则取走
  pub(crate) fn wait(&self, timeout: Duration) -> Option<Delivered> {
    let (slot, ready) = &*self.inner;
    let mut guard = slot.lock();
    if guard.is_none() {
      let _ = ready.wait_for(&mut guard, timeout);
    }
    guard.take()
  }
}

#[cfg(test)]
mod tests {
  use std::thread;

  use super::*;

  #[test]
  fn delivers_across_threads() {
    let slot = CompletionSlot::new();
    assert!(slot.wait(Duration::from_millis(5)).is_none());

    let complete = slot.completer();
    let handle = thread::spawn(move || complete(TensorSet::default(), Err(BackendError::Disconnected)));
    let mut delivered = None;
    for _ in 0..100 {
      delivered = slot.wait(Duration::from_millis(50));
      if delivered.is_some() {
        break;
      }
    }
    handle.join().unwrap();
    let (tensors, result) = delivered.unwrap();
    assert!(tensors.inputs.is_empty());
    assert_eq!(result, Err(BackendError::Disconnected));
  }
}
