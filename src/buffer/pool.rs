// 该文件是 Shanan （山南西风） 项目的一部分。
// src/buffer/pool.rs - 缓冲池
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
  path::PathBuf,
  sync::atomic::{AtomicU64, Ordering},
};

use tracing::{debug, info, warn};

use super::{Buffer, SharedRegion, Storage};
use crate::error::ResourceError;

static NEXT_POOL_ID: AtomicU64 = AtomicU64::new(1);

/// 缓冲区的底层存储方式
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Backing {
  #[default]
  Heap,
  /// 共享内存，`dir` 为空时使用系统临时目录
  Shared { dir: Option<PathBuf> },
}

/// 固定大小缓冲区池
///
/// 缓冲区在首次需要时创建（或由 `reserve` 预先创建），之后在周期之间复用，
/// 共享内存映射每个缓冲区只建立一次。归还的缓冲区内容不会被清零。
pub struct BufferPool {
  id: u64,
  backing: Backing,
  capacity: usize,
  created: usize,
  next_buffer: u64,
  free: Vec<Buffer>,
}

impl BufferPool {
  pub fn new(backing: Backing, capacity: usize) -> Self {
    let id = NEXT_POOL_ID.fetch_add(1, Ordering::Relaxed);
    debug!("创建缓冲池 {}: {:?}, 容量 {}", id, backing, capacity);
    Self {
      id,
      backing,
      capacity,
      created: 0,
      next_buffer: 0,
      free: Vec::new(),
    }
  }

  pub fn backing(&self) -> &Backing {
    &self.backing
  }

  pub fn capacity(&self) -> usize {
    self.capacity
  }

  pub fn created(&self) -> usize {
    self.created
  }

  pub fn free_count(&self) -> usize {
    self.free.len()
  }

  /// 已被取出、尚未归还的缓冲区数量
  pub fn outstanding(&self) -> usize {
    self.created - self.free.len()
  }

  /// 预先创建 `count` 个 `size` 字节的空闲缓冲区。
  pub fn reserve(&mut self, size: usize, count: usize) -> Result<(), ResourceError> {
    for _ in 0..count {
      let buffer = self.allocate(size)?;
      self.free.push(buffer);
    }
    Ok(())
  }

  /// 取出一个恰好 `size` 字节的缓冲区，没有空闲的则在容量内新建。
  pub fn acquire(&mut self, size: usize) -> Result<Buffer, ResourceError> {
    if let Some(pos) = self.free.iter().position(|b| b.len() == size) {
      return Ok(self.free.swap_remove(pos));
    }
    self.allocate(size)
  }

  pub fn release(&mut self, buffer: Buffer) -> Result<(), ResourceError> {
    if buffer.pool_id() != self.id {
      warn!("缓冲区 {} 不属于缓冲池 {}", buffer.id(), self.id);
      return Err(ResourceError::ForeignBuffer { id: buffer.id() });
    }
    self.free.push(buffer);
    Ok(())
  }

  /// 释放所有空闲缓冲区。返回时仍未归还的缓冲区数量。
  pub fn clear(&mut self) -> usize {
    let released = self.free.len();
    self.free.clear();
    self.created -= released;
    let outstanding = self.created;
    if outstanding > 0 {
      warn!("缓冲池 {} 清理时仍有 {} 个缓冲区未归还", self.id, outstanding);
    } else {
      info!("缓冲池 {} 已释放 {} 个缓冲区", self.id, released);
    }
    outstanding
  }

  fn allocate(&mut self, size: usize) -> Result<Buffer, ResourceError> {
    if size == 0 {
      return Err(ResourceError::ZeroSized);
    }
    if self.created >= self.capacity {
      return Err(ResourceError::PoolExhausted {
        capacity: self.capacity,
        size,
      });
    }

    let storage = match &self.backing {
      Backing::Heap => Storage::Heap(vec![0u8; size].into_boxed_slice()),
      Backing::Shared { dir } => {
        let region = SharedRegion::create(dir.as_deref(), size)
          .map_err(|source| ResourceError::OutOfResources { size, source })?;
        Storage::Shared(region)
      }
    };

    let id = self.next_buffer;
    self.next_buffer += 1;
    self.created += 1;
    debug!("缓冲池 {} 分配缓冲区 {}: {} 字节", self.id, id, size);
    Ok(Buffer::new(id, self.id, storage))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn acquire_release_restores_free_count() {
    let mut pool = BufferPool::new(Backing::Heap, 4);
    for (w, h) in [(2u32, 2u32), (640, 480), (1, 1)] {
      let size = (w * h * 3) as usize;
      pool.reserve(size, 1).unwrap();
      let before = pool.free_count();
      let buffer = pool.acquire(size).unwrap();
      assert_eq!(buffer.len(), size);
      assert_eq!(pool.free_count(), before - 1);
      pool.release(buffer).unwrap();
      assert_eq!(pool.free_count(), before);
      pool.clear();
    }
  }

  #[test]
  fn reuses_buffer_of_matching_size() {
    let mut pool = BufferPool::new(Backing::Heap, 2);
    let first = pool.acquire(12).unwrap();
    let id = first.id();
    pool.release(first).unwrap();
    let again = pool.acquire(12).unwrap();
    assert_eq!(again.id(), id);
    assert_eq!(pool.created(), 1);
  }

  #[test]
  fn capacity_bounds_allocation() {
    let mut pool = BufferPool::new(Backing::Heap, 1);
    let _held = pool.acquire(8).unwrap();
    assert!(matches!(
      pool.acquire(8),
      Err(ResourceError::PoolExhausted { capacity: 1, size: 8 })
    ));
  }

  #[test]
  fn rejects_zero_sized_and_foreign_buffers() {
    let mut pool = BufferPool::new(Backing::Heap, 2);
    assert!(matches!(pool.acquire(0), Err(ResourceError::ZeroSized)));

    let mut other = BufferPool::new(Backing::Heap, 1);
    let foreign = other.acquire(4).unwrap();
    assert!(matches!(
      pool.release(foreign),
      Err(ResourceError::ForeignBuffer { .. })
    ));
  }

  #[test]
  fn shared_backing_exposes_descriptor() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = BufferPool::new(
      Backing::Shared {
        dir: Some(dir.path().to_path_buf()),
      },
      1,
    );
    let mut buffer = pool.acquire(64).unwrap();
    assert!(buffer.is_shared());
    assert!(buffer.fd().is_some());
    buffer.as_mut()[63] = 7;
    assert_eq!(buffer.as_ref()[63], 7);
    pool.release(buffer).unwrap();
    assert_eq!(pool.clear(), 0);
  }

  #[test]
  fn shared_backing_reports_out_of_resources() {
    let mut pool = BufferPool::new(
      Backing::Shared {
        dir: Some(PathBuf::from("/nonexistent/shanan-pipeline")),
      },
      1,
    );
    assert!(matches!(
      pool.acquire(16),
      Err(ResourceError::OutOfResources { size: 16, .. })
    ));
  }
}
