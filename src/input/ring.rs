// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/ring.rs - 帧环形缓冲区
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
  sync::Arc,
  time::{Duration, Instant},
};

use parking_lot::{Condvar, Mutex};
use tracing::trace;

use crate::{
  buffer::{Backing, Buffer, BufferPool},
  error::ResourceError,
};

/// 帧源的固定槽位。克隆得到的是同一个环的句柄。
#[derive(Clone)]
pub struct FrameRing {
  inner: Arc<RingInner>,
}

struct RingInner {
  pool: Mutex<BufferPool>,
  available: Condvar,
  slot_size: usize,
  slots: usize,
}

impl FrameRing {
  pub fn new(backing: Backing, slots: usize, slot_size: usize) -> Result<Self, ResourceError> {
    let mut pool = BufferPool::new(backing, slots);
    pool.reserve(slot_size, slots)?;
    Ok(Self {
      inner: Arc::new(RingInner {
        pool: Mutex::new(pool),
        available: Condvar::new(),
        slot_size,
        slots,
      }),
    })
  }

  pub fn slots(&self) -> usize {
    self.inner.slots
  }

  pub fn slot_size(&self) -> usize {
    self.inner.slot_size
  }

  pub fn free_slots(&self) -> usize {
    self.inner.pool.lock().free_count()
  }

  /// 取一个空闲槽位，全部被借出时最多等待 `timeout`。
  pub fn acquire(&self, timeout: Duration) -> Result<Option<Buffer>, ResourceError> {
    let deadline = Instant::now() + timeout;
    let mut pool = self.inner.pool.lock();
    while pool.free_count() == 0 {
      trace!("帧环无空闲槽位，等待归还");
      if self.inner.available.wait_until(&mut pool, deadline).timed_out() {
        if pool.free_count() == 0 {
          return Ok(None);
        }
        break;
      }
    }
    pool.acquire(self.inner.slot_size).map(Some)
  }

  pub fn give_back(&self, buffer: Buffer) -> Result<(), ResourceError> {
    self.inner.pool.lock().release(buffer)?;
    self.inner.available.notify_one();
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use std::thread;

  use super::*;

  #[test]
  fn acquire_times_out_when_all_slots_outstanding() {
    let ring = FrameRing::new(Backing::Heap, 1, 8).unwrap();
    let held = ring.acquire(Duration::from_millis(10)).unwrap().unwrap();
    assert_eq!(ring.free_slots(), 0);
    assert!(ring.acquire(Duration::from_millis(20)).unwrap().is_none());
    ring.give_back(held).unwrap();
    assert_eq!(ring.free_slots(), 1);
  }

  #[test]
  fn blocked_acquire_wakes_on_release() {
    let ring = FrameRing::new(Backing::Heap, 1, 8).unwrap();
    let held = ring.acquire(Duration::from_millis(10)).unwrap().unwrap();

    let releaser = ring.clone();
    let handle = thread::spawn(move || {
      thread::sleep(Duration::from_millis(30));
      releaser.give_back(held).unwrap();
    });

    let slot = ring.acquire(Duration::from_secs(5)).unwrap();
    assert!(slot.is_some());
    handle.join().unwrap();
  }
}
