// 该文件是 Shanan （山南西风） 项目的一部分。
// src/buffer/shared.rs - 共享内存映射
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

use std::{fs::File, path::Path};

#[cfg(unix)]
use std::os::fd::{AsFd, BorrowedFd};

use memmap2::{MmapMut, MmapOptions};
use tracing::debug;

/// 匿名临时文件 + `MAP_SHARED` 映射。
///
/// 文件创建后即被 unlink，只能通过描述符访问；映射在整个生命周期内复用。
pub(crate) struct SharedRegion {
  file: File,
  map: MmapMut,
}

impl SharedRegion {
  pub(crate) fn create(dir: Option<&Path>, size: usize) -> std::io::Result<Self> {
    let file = match dir {
      Some(dir) => tempfile::tempfile_in(dir)?,
      None => tempfile::tempfile()?,
    };
    file.set_len(size as u64)?;

    // SAFETY: 文件已 unlink 且只由本结构持有，映射期间不会被截断。
    let map = unsafe { MmapOptions::new().len(size).map_mut(&file)? };
    debug!("创建共享内存映射: {} 字节", size);

    Ok(Self { file, map })
  }

  pub(crate) fn len(&self) -> usize {
    self.map.len()
  }

  pub(crate) fn as_slice(&self) -> &[u8] {
    &self.map
  }

  pub(crate) fn as_mut_slice(&mut self) -> &mut [u8] {
    &mut self.map
  }
}

#[cfg(unix)]
impl AsFd for SharedRegion {
  fn as_fd(&self) -> BorrowedFd<'_> {
    self.file.as_fd()
  }
}
