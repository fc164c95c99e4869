// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/image_file.rs - 图像文件帧源
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

use std::{path::Path, time::Duration};

use chrono::Utc;
use image::{ImageReader, RgbImage};
use thiserror::Error;
use tracing::{error, info};
use url::Url;

use super::{Frame, FrameRing, FrameSource, NextFrame, query_value};
use crate::{
  FromUrl, FromUrlWithScheme,
  buffer::Backing,
  error::{ResourceError, SourceError},
  tensor::{PixelFormat, TensorDescriptor, TensorShape},
};

#[derive(Error, Debug)]
pub enum ImageFileSourceError {
  #[error("URI schema mismatch")]
  SchemaMismatch,
  #[error("I/O error: {0}")]
  IoError(#[from] std::io::Error),
  #[error("Image loading error: {0}")]
  ImageLoadError(#[from] image::ImageError),
  #[error("Ring allocation failed: {0}")]
  Ring(#[from] ResourceError),
}

/// 把一张图像按 RGB 帧重复交付 `repeat` 次
///
/// `image:///path/to/file.png?repeat=10`
pub struct ImageFileSource {
  image: RgbImage,
  shape: TensorShape,
  ring: FrameRing,
  repeat: u64,
  sequence: u64,
  started: bool,
}

impl FromUrlWithScheme for ImageFileSource {
  const SCHEME: &'static str = "image";
}

impl FromUrl for ImageFileSource {
  type Error = ImageFileSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI scheme mismatch: expected '{}', found '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(ImageFileSourceError::SchemaMismatch);
    }

    let repeat = query_value(url, "repeat").unwrap_or(1);
    Self::open(url.path(), repeat)
  }
}

impl ImageFileSource {
  pub fn open(path: impl AsRef<Path>, repeat: u64) -> Result<Self, ImageFileSourceError> {
    let image = ImageReader::open(path.as_ref())?.decode()?.into_rgb8();
    Self::from_image(image, repeat)
  }

  pub fn from_image(image: RgbImage, repeat: u64) -> Result<Self, ImageFileSourceError> {
    let (width, height) = image.dimensions();
    let shape = TensorShape::image(PixelFormat::Rgb, width, height);
    let ring = FrameRing::new(Backing::Heap, 2, shape.byte_len())?;
    Ok(Self {
      image,
      shape,
      ring,
      repeat,
      sequence: 0,
      started: false,
    })
  }
}

impl FrameSource for ImageFileSource {
  fn shape(&self) -> TensorShape {
    self.shape
  }

  fn start(&mut self) -> Result<(), SourceError> {
    info!(
      "图像帧源启动: {}x{}, 重复 {} 次",
      self.shape.width, self.shape.height, self.repeat
    );
    self.started = true;
    Ok(())
  }

  fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame, SourceError> {
    if !self.started {
      return Err(SourceError::NotStarted);
    }
    if self.sequence >= self.repeat {
      return Ok(NextFrame::EndOfStream);
    }

    let Some(mut buffer) = self
      .ring
      .acquire(timeout)
      .map_err(|e| SourceError::Capture(e.to_string()))?
    else {
      return Ok(NextFrame::Empty);
    };
    buffer.as_mut().copy_from_slice(self.image.as_raw());

    let tensor = TensorDescriptor::new(self.shape, buffer).map_err(|(e, buffer)| {
      let _ = self.ring.give_back(buffer);
      SourceError::Capture(e.to_string())
    })?;
    let frame = Frame::new(self.sequence, Utc::now(), tensor);
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
    self.started = false;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use image::Rgb;

  use super::*;

  #[test]
  fn delivers_image_repeatedly() {
    let image = RgbImage::from_fn(3, 2, |x, y| Rgb([x as u8, y as u8, 9]));
    let mut source = ImageFileSource::from_image(image, 2).unwrap();
    source.start().unwrap();

    for expected in 0..2 {
      let NextFrame::Frame(frame) = source.next_frame(Duration::from_millis(10)).unwrap() else {
        panic!("expected frame");
      };
      assert_eq!(frame.sequence(), expected);
      assert_eq!(&frame.tensor().bytes()[3..6], &[1, 0, 9]);
      source.release_frame(frame).unwrap();
    }
    assert!(matches!(
      source.next_frame(Duration::from_millis(10)),
      Ok(NextFrame::EndOfStream)
    ));
  }

  #[test]
  fn opens_png_from_disk() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("frame.png");
    RgbImage::from_pixel(4, 4, Rgb([10, 20, 30])).save(&path).unwrap();

    let url = Url::parse(&format!("image://{}?repeat=3", path.display())).unwrap();
    let source = ImageFileSource::from_url(&url).unwrap();
    assert_eq!(source.shape(), TensorShape::image(PixelFormat::Rgb, 4, 4));
    assert_eq!(source.repeat, 3);
  }
}
