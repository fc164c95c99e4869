// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input.rs - 帧源
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

use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
  FromUrl,
  buffer::Buffer,
  error::SourceError,
  tensor::{TensorDescriptor, TensorShape},
};

mod ring;
pub use self::ring::FrameRing;

mod synthetic;
pub use self::synthetic::{SourceEvent, SyntheticSource, SyntheticSourceError};

#[cfg(feature = "read_image_file")]
mod image_file;
#[cfg(feature = "read_image_file")]
pub use self::image_file::{ImageFileSource, ImageFileSourceError};

#[cfg(feature = "gstreamer_input")]
mod gstreamer;
#[cfg(feature = "gstreamer_input")]
pub use self::gstreamer::{GStreamerSource, GStreamerSourceBuilder, GStreamerSourceError};

/// 从帧源借出的一帧，在一个流水线周期内有效。
///
/// 每一帧都必须通过 `FrameSource::release_frame` 恰好归还一次。
#[derive(Debug)]
pub struct Frame {
  sequence: u64,
  timestamp: DateTime<Utc>,
  tensor: TensorDescriptor,
}

impl Frame {
  pub fn new(sequence: u64, timestamp: DateTime<Utc>, tensor: TensorDescriptor) -> Self {
    Self {
      sequence,
      timestamp,
      tensor,
    }
  }

  pub fn sequence(&self) -> u64 {
    self.sequence
  }

  pub fn timestamp(&self) -> DateTime<Utc> {
    self.timestamp
  }

  pub fn tensor(&self) -> &TensorDescriptor {
    &self.tensor
  }

  pub fn shape(&self) -> &TensorShape {
    self.tensor.shape()
  }

  pub fn into_buffer(self) -> Buffer {
    self.tensor.into_buffer()
  }
}

#[derive(Debug)]
pub enum NextFrame {
  Frame(Frame),
  /// 超时内没有新帧
  Empty,
  /// 有限帧源已经读完
  EndOfStream,
}

/// 采集后端的统一接口
///
/// 帧按采集顺序交付。帧源使用固定的环形缓冲区，所有槽位都被借出时
/// `next_frame` 会阻塞直到有帧归还或超时。
pub trait FrameSource: Send {
  /// 帧的形状（格式与尺寸），在整个实例生命周期内固定
  fn shape(&self) -> TensorShape;

  fn start(&mut self) -> Result<(), SourceError>;

  fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame, SourceError>;

  fn release_frame(&mut self, frame: Frame) -> Result<(), SourceError>;

  fn stop(&mut self) -> Result<(), SourceError> {
    Ok(())
  }
}

impl<S: FrameSource + ?Sized> FrameSource for Box<S> {
  fn shape(&self) -> TensorShape {
    (**self).shape()
  }

  fn start(&mut self) -> Result<(), SourceError> {
    (**self).start()
  }

  fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame, SourceError> {
    (**self).next_frame(timeout)
  }

  fn release_frame(&mut self, frame: Frame) -> Result<(), SourceError> {
    (**self).release_frame(frame)
  }

  fn stop(&mut self) -> Result<(), SourceError> {
    (**self).stop()
  }
}

#[derive(Error, Debug)]
pub enum InputError {
  #[error("Synthetic source error: {0}")]
  Synthetic(#[from] SyntheticSourceError),
  #[cfg(feature = "read_image_file")]
  #[error("Image file input error: {0}")]
  ImageFile(#[from] ImageFileSourceError),
  #[cfg(feature = "gstreamer_input")]
  #[error("GStreamer input error: {0}")]
  GStreamer(#[from] GStreamerSourceError),
  #[error("URI scheme mismatch")]
  SchemeMismatch,
}

/// 按 URL 方案选择帧源
pub enum InputWrapper {
  Synthetic(SyntheticSource),
  #[cfg(feature = "read_image_file")]
  ImageFile(ImageFileSource),
  #[cfg(feature = "gstreamer_input")]
  GStreamer(GStreamerSource),
}

impl FromUrl for InputWrapper {
  type Error = InputError;

  fn from_url(url: &url::Url) -> Result<Self, Self::Error> {
    use crate::FromUrlWithScheme;

    if url.scheme() == SyntheticSource::SCHEME {
      return Ok(InputWrapper::Synthetic(SyntheticSource::from_url(url)?));
    }
    #[cfg(feature = "read_image_file")]
    {
      if url.scheme() == ImageFileSource::SCHEME {
        return Ok(InputWrapper::ImageFile(ImageFileSource::from_url(url)?));
      }
    }
    #[cfg(feature = "gstreamer_input")]
    {
      if url.scheme() == GStreamerSourceBuilder::SCHEME {
        let source = GStreamerSourceBuilder::from_url(url)?.build()?;
        return Ok(InputWrapper::GStreamer(source));
      }
    }
    Err(InputError::SchemeMismatch)
  }
}

impl InputWrapper {
  fn inner(&self) -> &dyn FrameSource {
    match self {
      InputWrapper::Synthetic(source) => source,
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageFile(source) => source,
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(source) => source,
    }
  }

  fn inner_mut(&mut self) -> &mut dyn FrameSource {
    match self {
      InputWrapper::Synthetic(source) => source,
      #[cfg(feature = "read_image_file")]
      InputWrapper::ImageFile(source) => source,
      #[cfg(feature = "gstreamer_input")]
      InputWrapper::GStreamer(source) => source,
    }
  }
}

impl FrameSource for InputWrapper {
  fn shape(&self) -> TensorShape {
    self.inner().shape()
  }

  fn start(&mut self) -> Result<(), SourceError> {
    self.inner_mut().start()
  }

  fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame, SourceError> {
    self.inner_mut().next_frame(timeout)
  }

  fn release_frame(&mut self, frame: Frame) -> Result<(), SourceError> {
    self.inner_mut().release_frame(frame)
  }

  fn stop(&mut self) -> Result<(), SourceError> {
    self.inner_mut().stop()
  }
}

/// 从 URL 查询参数中读取数值
pub(crate) fn query_value<T: std::str::FromStr>(url: &url::Url, key: &str) -> Option<T> {
  url
    .query_pairs()
    .find(|(k, _)| k == key)
    .and_then(|(_, v)| v.parse().ok())
}
