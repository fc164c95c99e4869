// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/synthetic.rs - 合成测试帧源
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

use std::{collections::VecDeque, time::Duration};

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info};
use url::Url;

use super::{Frame, FrameRing, FrameSource, NextFrame, query_value};
use crate::{
  FromUrl, FromUrlWithScheme,
  buffer::Backing,
  error::{ResourceError, SourceError},
  tensor::{PixelFormat, TensorDescriptor, TensorShape},
};

const DEFAULT_SLOTS: usize = 2;

#[derive(Error, Debug)]
pub enum SyntheticSourceError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("Unknown pixel format: {0}")]
  UnknownFormat(String),
  #[error("Ring allocation failed: {0}")]
  Ring(#[from] ResourceError),
}

/// 预先排队的帧源事件，在生成普通帧之前依次消费
#[derive(Debug, Clone)]
pub enum SourceEvent {
  Empty,
  Fail(SourceError),
}

/// 生成确定性渐变图案的帧源
///
/// `test://pattern?width=640&height=480&format=nv12&frames=100&slots=2`
pub struct SyntheticSource {
  shape: TensorShape,
  ring: FrameRing,
  started: bool,
  sequence: u64,
  limit: Option<u64>,
  close_after: Option<u64>,
  events: VecDeque<SourceEvent>,
}

impl FromUrlWithScheme for SyntheticSource {
  const SCHEME: &'static str = "test";
}

impl FromUrl for SyntheticSource {
  type Error = SyntheticSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(SyntheticSourceError::SchemeMismatch);
    }

    let format = match url.query_pairs().find(|(k, _)| k == "format") {
      Some((_, name)) => {
        PixelFormat::parse(&name).ok_or_else(|| SyntheticSourceError::UnknownFormat(name.to_string()))?
      }
      None => PixelFormat::Rgb,
    };
    let width = query_value(url, "width").unwrap_or(640);
    let height = query_value(url, "height").unwrap_or(480);
    let slots = query_value(url, "slots").unwrap_or(DEFAULT_SLOTS);

    let mut source = Self::new(TensorShape::image(format, width, height), slots, Backing::Heap)?;
    source.limit = query_value(url, "frames");
    Ok(source)
  }
}

impl SyntheticSource {
  pub fn new(shape: TensorShape, slots: usize, backing: Backing) -> Result<Self, SyntheticSourceError> {
    let ring = FrameRing::new(backing, slots, shape.byte_len())?;
    Ok(Self {
      shape,
      ring,
      started: false,
      sequence: 0,
      limit: None,
      close_after: None,
      events: VecDeque::new(),
    })
  }

  /// 生成 `frames` 帧后报告 `EndOfStream`
  pub fn with_limit(mut self, frames: u64) -> Self {
    self.limit = Some(frames);
    self
  }

  /// 生成 `frames` 帧后报告 `SourceError::Closed`
  pub fn close_after(mut self, frames: u64) -> Self {
    self.close_after = Some(frames);
    self
  }

  pub fn push_event(&mut self, event: SourceEvent) {
    self.events.push_back(event);
  }

  pub fn ring(&self) -> &FrameRing {
    &self.ring
  }

  pub fn produced(&self) -> u64 {
    self.sequence
  }
}

impl FrameSource for SyntheticSource {
  fn shape(&self) -> TensorShape {
    self.shape
  }

  fn start(&mut self) -> Result<(), SourceError> {
    info!(
      "合成帧源启动: {} {}x{}",
      self.shape.format.name(),
      self.shape.width,
      self.shape.height
    );
    self.started = true;
    Ok(())
  }

  fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame, SourceError> {
    if !self.started {
      return Err(SourceError::NotStarted);
    }
    if let Some(event) = self.events.pop_front() {
      return match event {
        SourceEvent::Empty => Ok(NextFrame::Empty),
        SourceEvent::Fail(err) => Err(err),
      };
    }
    if self.close_after.is_some_and(|n| self.sequence >= n) {
      return Err(SourceError::Closed);
    }
    if self.limit.is_some_and(|n| self.sequence >= n) {
      return Ok(NextFrame::EndOfStream);
    }

    let Some(mut buffer) = self
      .ring
      .acquire(timeout)
      .map_err(|e| SourceError::Capture(e.to_string()))?
    else {
      return Ok(NextFrame::Empty);
    };

    let seed = self.sequence as usize;
    for (i, byte) in buffer.as_mut().iter_mut().enumerate() {
      *byte = ((i + seed) % 251) as u8;
    }

    let tensor = TensorDescriptor::new(self.shape, buffer).map_err(|(e, buffer)| {
      let _ = self.ring.give_back(buffer);
      SourceError::Capture(e.to_string())
    })?;

    let frame = Frame::new(self.sequence, Utc::now(), tensor);
    debug!("合成帧 {}", self.sequence);
    self.sequence += 1;
    Ok(NextFrame::Frame(frame))
  }

  fn release_frame(&mut self, frame: Frame) -> Result<(), SourceError> {
    let buffer = frame.into_buffer();
    let id = buffer.id();
    self
      .ring
      .give_back(buffer)
      .map_err(|_| SourceError::ForeignFrame(id))
  }

  fn stop(&mut self) -> Result<(), SourceError> {
    info!("合成帧源停止, 共生成 {} 帧", self.sequence);
    self.started = false;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn frame(next: NextFrame) -> Frame {
    match next {
      NextFrame::Frame(frame) => frame,
      _ => panic!("expected a frame"),
    }
  }

  #[test]
  fn parses_url() {
    let url = Url::parse("test://pattern?width=4&height=2&format=nv12&frames=3").unwrap();
    let source = SyntheticSource::from_url(&url).unwrap();
    assert_eq!(source.shape(), TensorShape::image(PixelFormat::Nv12, 4, 2));
    assert_eq!(source.limit, Some(3));
  }

  #[test]
  fn frames_in_order_until_end_of_stream() {
    let shape = TensorShape::image(PixelFormat::Rgb, 2, 2);
    let mut source = SyntheticSource::new(shape, 2, Backing::Heap).unwrap().with_limit(2);
    source.start().unwrap();

    for expected in 0..2 {
      let f = frame(source.next_frame(Duration::from_millis(10)).unwrap());
      assert_eq!(f.sequence(), expected);
      source.release_frame(f).unwrap();
    }
    assert!(matches!(
      source.next_frame(Duration::from_millis(10)),
      Ok(NextFrame::EndOfStream)
    ));
  }

  #[test]
  fn blocks_when_ring_is_exhausted() {
    let shape = TensorShape::image(PixelFormat::Rgb, 2, 2);
    let mut source = SyntheticSource::new(shape, 1, Backing::Heap).unwrap();
    source.start().unwrap();

    let held = frame(source.next_frame(Duration::from_millis(10)).unwrap());
    assert!(matches!(
      source.next_frame(Duration::from_millis(20)),
      Ok(NextFrame::Empty)
    ));
    source.release_frame(held).unwrap();
    assert!(matches!(
      source.next_frame(Duration::from_millis(10)),
      Ok(NextFrame::Frame(_))
    ));
  }

  #[test]
  fn requires_start_and_reports_closed() {
    let shape = TensorShape::image(PixelFormat::Rgb, 2, 2);
    let mut source = SyntheticSource::new(shape, 1, Backing::Heap).unwrap().close_after(0);
    assert_eq!(
      source.next_frame(Duration::ZERO).err(),
      Some(SourceError::NotStarted)
    );
    source.start().unwrap();
    assert_eq!(source.next_frame(Duration::ZERO).err(), Some(SourceError::Closed));
  }
}
