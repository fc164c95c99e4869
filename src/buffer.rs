// 该文件是 Shanan （山南西风） 项目的一部分。
// src/buffer.rs - 固定大小缓冲区
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

//! # 缓冲区
//!
//! `Buffer` 是一段字节大小固定的内存，要么位于堆上，要么由共享内存
//! 文件映射而来。共享内存缓冲区可以导出文件描述符，供推理引擎直接读写，
//! 无需额外拷贝。
//!
//! `Buffer` 不实现 `Clone`：同一时刻只有一个阶段持有它，所有权的转移
//! 就是值的移动。

#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd};

mod pool;
mod shared;

pub use self::pool::{Backing, BufferPool};
pub(crate) use self::shared::SharedRegion;

pub(crate) enum Storage {
  Heap(Box<[u8]>),
  Shared(SharedRegion),
}

pub struct Buffer {
  id: u64,
  pool: u64,
  storage: Storage,
}

impl Buffer {
  pub(crate) fn new(id: u64, pool: u64, storage: Storage) -> Self {
    Self { id, pool, storage }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub(crate) fn pool_id(&self) -> u64 {
    self.pool
  }

  pub fn len(&self) -> usize {
    match &self.storage {
      Storage::Heap(data) => data.len(),
      Storage::Shared(region) => region.len(),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn is_shared(&self) -> bool {
    matches!(self.storage, Storage::Shared(_))
  }

  /// 共享内存缓冲区的文件描述符，堆缓冲区返回 `None`。
  #[cfg(unix)]
  pub fn fd(&self) -> Option<BorrowedFd<'_>> {
    match &self.storage {
      Storage::Heap(_) => None,
      Storage::Shared(region) => Some(region.as_fd()),
    }
  }
}

impl AsRef<[u8]> for Buffer {
  fn as_ref(&self) -> &[u8] {
    match &self.storage {
      Storage::Heap(data) => data,
      Storage::Shared(region) => region.as_slice(),
    }
  }
}

impl AsMut<[u8]> for Buffer {
  fn as_mut(&mut self) -> &mut [u8] {
    match &mut self.storage {
      Storage::Heap(data) => data,
      Storage::Shared(region) => region.as_mut_slice(),
    }
  }
}

impl std::fmt::Debug for Buffer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Buffer")
      .field("id", &self.id)
      .field("pool", &self.pool)
      .field("len", &self.len())
      .field("shared", &self.is_shared())
      .finish()
  }
}
