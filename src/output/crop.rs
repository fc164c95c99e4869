// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/crop.rs - 保存检测区域裁剪图
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
  fs::{self, File},
  io::{BufWriter, Write},
  path::{Path, PathBuf},
};

use image::{RgbImage, codecs::jpeg::JpegEncoder};
use thiserror::Error;
use tracing::{debug, warn};
use url::Url;

use super::DetectionSink;
use crate::{
  FromUrl, FromUrlWithScheme,
  buffer::{Backing, BufferPool},
  error::{GeometryError, ResourceError},
  input::Frame,
  pipeline::CycleReport,
  preprocess::{self, CropRect, PreprocessSpec},
  tensor::{PixelFormat, TensorDescriptor, TensorShape},
};

const DEFAULT_QUALITY: u8 = 80;

#[derive(Error, Debug)]
pub enum CropSinkError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("无效的 JPEG 质量: {0}")]
  InvalidQuality(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("图像错误: {0}")]
  ImageError(#[from] image::ImageError),
  #[error("资源错误: {0}")]
  Resource(#[from] ResourceError),
  #[error("裁剪区域无效: {0}")]
  Geometry(#[from] GeometryError),
}

/// 把每个检测框从原始帧中裁剪出来保存为 JPEG
///
/// `crop:///var/lib/crops?quality=80`，文件名为 `<帧序号>_<检测序号>_<标签>.jpg`。
/// 换算到像素后为空或越界的框跳过。
pub struct CropSink {
  directory: PathBuf,
  quality: u8,
  skipped: u64,
}

impl FromUrlWithScheme for CropSink {
  const SCHEME: &'static str = "crop";
}

impl FromUrl for CropSink {
  type Error = CropSinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(CropSinkError::SchemeMismatch);
    }
    let mut sink = Self::new(url.path());
    if let Some((_, value)) = url.query_pairs().find(|(k, _)| k == "quality") {
      let quality = value
        .parse::<u8>()
        .ok()
        .filter(|q| (1..=100).contains(q))
        .ok_or_else(|| CropSinkError::InvalidQuality(value.to_string()))?;
      sink = sink.quality(quality);
    }
    Ok(sink)
  }
}

impl CropSink {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      quality: DEFAULT_QUALITY,
      skipped: 0,
    }
  }

  pub fn quality(mut self, quality: u8) -> Self {
    self.quality = quality;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  /// 因为区域为空或越界而没有保存的检测数
  pub fn skipped(&self) -> u64 {
    self.skipped
  }

  fn crop_path(&self, sequence: u64, index: usize, label: &str) -> PathBuf {
    let label: String = label
      .chars()
      .map(|c| if c.is_alphanumeric() { c } else { '_' })
      .collect();
    self
      .directory
      .join(format!("{}_{}_{}.jpg", sequence, index, label))
  }

  fn save(&self, image: &RgbImage, path: &Path) -> Result<(), CropSinkError> {
    let mut writer = BufWriter::new(File::create(path)?);
    JpegEncoder::new_with_quality(&mut writer, self.quality).encode_image(image)?;
    writer.flush()?;
    debug!("保存裁剪图: {}", path.display());
    Ok(())
  }
}

/// 把帧中的一块区域转换为 RGB 图像
fn crop_rgb(frame: &Frame, rect: CropRect) -> Result<RgbImage, CropSinkError> {
  let shape = *frame.shape();
  let dest_shape = TensorShape::image(PixelFormat::Rgb, rect.width, rect.height);
  let spec = PreprocessSpec::new(shape.format, PixelFormat::Rgb).with_crop(rect);
  preprocess::validate(&spec, &shape, &dest_shape)?;

  let mut pool = BufferPool::new(Backing::Heap, 1);
  let buffer = pool.acquire(dest_shape.byte_len())?;
  let mut dest = TensorDescriptor::new(dest_shape, buffer).map_err(|(e, _)| e)?;
  preprocess::convert(frame.tensor(), &mut dest, &spec)?;
  let pixels = dest.into_buffer().as_ref().to_vec();

  RgbImage::from_raw(rect.width, rect.height, pixels).ok_or_else(|| {
    CropSinkError::IoError(std::io::Error::other("裁剪数据长度与尺寸不符"))
  })
}

impl DetectionSink for CropSink {
  type Error = CropSinkError;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error> {
    if report.detections.is_empty() {
      return Ok(());
    }
    fs::create_dir_all(&self.directory)?;

    let shape = *report.frame.shape();
    for (index, detection) in report.detections.iter().enumerate() {
      let (x, y, w, h) = detection.bbox.to_pixels(shape.width, shape.height);
      let image = match crop_rgb(report.frame, CropRect::new(x, y, w, h)) {
        Ok(image) => image,
        Err(CropSinkError::Geometry(e)) => {
          self.skipped += 1;
          warn!(
            "第 {} 周期检测 {} 的区域无效, 跳过裁剪: {}",
            report.cycle, index, e
          );
          continue;
        }
        Err(e) => return Err(e),
      };
      let label = report.labels.display(detection.class_id);
      let path = self.crop_path(report.frame.sequence(), index, &label);
      self.save(&image, &path)?;
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use chrono::Utc;

  use super::*;
  use crate::{
    decode::{BoundingBox, Detection},
    labels::LabelTable,
    pipeline::CycleTimings,
  };

  fn frame(pool: &mut BufferPool) -> Frame {
    let shape = TensorShape::image(PixelFormat::Rgb, 8, 8);
    let mut buffer = pool.acquire(shape.byte_len()).unwrap();
    for (i, px) in buffer.as_mut().chunks_exact_mut(3).enumerate() {
      px.copy_from_slice(&[(i % 8) as u8, (i / 8) as u8, 0]);
    }
    Frame::new(7, Utc::now(), TensorDescriptor::new(shape, buffer).unwrap())
  }

  fn detection(top: f32, left: f32, bottom: f32, right: f32) -> Detection {
    Detection {
      class_id: 1,
      score: 0.9,
      bbox: BoundingBox {
        top,
        left,
        bottom,
        right,
      },
    }
  }

  #[test]
  fn parses_directory_and_quality() {
    let url = Url::parse("crop:///tmp/crops?quality=95").unwrap();
    let sink = CropSink::from_url(&url).unwrap();
    assert_eq!(sink.directory(), Path::new("/tmp/crops"));
    assert_eq!(sink.quality, 95);

    let url = Url::parse("crop:///tmp/crops?quality=0").unwrap();
    assert!(matches!(
      CropSink::from_url(&url),
      Err(CropSinkError::InvalidQuality(_))
    ));
    let url = Url::parse("jsonl:///tmp/crops").unwrap();
    assert!(matches!(
      CropSink::from_url(&url),
      Err(CropSinkError::SchemeMismatch)
    ));
  }

  #[test]
  fn crop_keeps_source_pixels() {
    let mut pool = BufferPool::new(Backing::Heap, 1);
    let frame = frame(&mut pool);
    let image = crop_rgb(&frame, CropRect::new(2, 3, 4, 2)).unwrap();
    assert_eq!(image.dimensions(), (4, 2));
    assert_eq!(image.get_pixel(0, 0).0, [2, 3, 0]);
    assert_eq!(image.get_pixel(3, 1).0, [5, 4, 0]);
  }

  #[test]
  fn empty_and_out_of_bounds_boxes_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let mut pool = BufferPool::new(Backing::Heap, 1);
    let frame = frame(&mut pool);
    let detections = [
      detection(0.0, 0.0, 0.5, 0.5),
      // 右边界超出画面
      detection(0.0, 0.5, 0.5, 1.5),
      // 反向的框换算后宽度为 0
      detection(0.5, 0.5, 0.25, 0.25),
    ];
    let labels = LabelTable::default();
    let report = CycleReport {
      cycle: 1,
      frame: &frame,
      detections: &detections,
      labels: &labels,
      timings: CycleTimings::default(),
    };

    let mut sink = CropSink::new(dir.path());
    sink.consume(&report).unwrap();
    assert_eq!(sink.skipped(), 2);

    let saved: Vec<_> = fs::read_dir(dir.path())
      .unwrap()
      .map(|e| e.unwrap().path())
      .collect();
    assert_eq!(saved.len(), 1);
    let image = image::open(&saved[0]).unwrap();
    assert_eq!((image.width(), image.height()), (4, 4));
  }
}
