// 该文件是 Shanan （山南西风） 项目的一部分。
// src/preprocess.rs - 像素格式转换、裁剪与缩放
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

//! # 预处理
//!
//! 把采集帧转换为模型输入：像素格式转换、可选裁剪、可选缩放（最近邻）。
//!
//! 所有几何参数在写入目标张量之前完成校验，校验失败时目标缓冲区保持不变。
//! 缩放比例为 `目标尺寸 / 裁剪尺寸`，越界裁剪直接报错，不做静默截断。

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::{
  error::GeometryError,
  tensor::{ElementType, PixelFormat, TensorDescriptor, TensorShape},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CropRect {
  pub x: u32,
  pub y: u32,
  pub width: u32,
  pub height: u32,
}

impl CropRect {
  pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
    Self {
      x,
      y,
      width,
      height,
    }
  }

  fn validate(&self, source_width: u32, source_height: u32) -> Result<(), GeometryError> {
    if self.width == 0 || self.height == 0 {
      return Err(GeometryError::EmptyCrop);
    }
    let right = self.x as u64 + self.width as u64;
    let bottom = self.y as u64 + self.height as u64;
    if right > source_width as u64 || bottom > source_height as u64 {
      return Err(GeometryError::CropOutOfBounds {
        x: self.x,
        y: self.y,
        width: self.width,
        height: self.height,
        source_width,
        source_height,
      });
    }
    Ok(())
  }
}

/// 一次转换的参数
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreprocessSpec {
  pub source_format: PixelFormat,
  pub dest_format: PixelFormat,
  pub crop: Option<CropRect>,
  /// 缩放目标 (宽, 高)；为空时目标尺寸等于裁剪尺寸
  pub scale: Option<(u32, u32)>,
}

impl PreprocessSpec {
  pub fn new(source_format: PixelFormat, dest_format: PixelFormat) -> Self {
    Self {
      source_format,
      dest_format,
      crop: None,
      scale: None,
    }
  }

  pub fn with_crop(mut self, crop: CropRect) -> Self {
    self.crop = Some(crop);
    self
  }

  pub fn with_scale(mut self, width: u32, height: u32) -> Self {
    self.scale = Some((width, height));
    self
  }
}

/// 只校验几何参数，返回实际生效的裁剪区域
///
/// 帧源的形状在启动时已知，协调器据此在取第一帧之前拒绝无效配置。
pub fn validate(
  spec: &PreprocessSpec,
  source: &TensorShape,
  dest: &TensorShape,
) -> Result<CropRect, GeometryError> {
  check_image(source, spec.source_format)?;
  check_image(dest, spec.dest_format)?;

  if spec.dest_format == PixelFormat::Nv12 {
    return Err(GeometryError::UnsupportedConversion {
      from: spec.source_format.name(),
      to: spec.dest_format.name(),
    });
  }
  if spec.source_format == PixelFormat::Nv12 && (source.width % 2 != 0 || source.height % 2 != 0) {
    return Err(GeometryError::OddDimensions {
      format: PixelFormat::Nv12.name(),
      width: source.width,
      height: source.height,
    });
  }

  let crop = spec
    .crop
    .unwrap_or_else(|| CropRect::new(0, 0, source.width, source.height));
  crop.validate(source.width, source.height)?;

  let (target_w, target_h) = spec.scale.unwrap_or((crop.width, crop.height));
  if target_w == 0 || target_h == 0 {
    return Err(GeometryError::EmptyCrop);
  }
  if dest.width != target_w || dest.height != target_h {
    return Err(GeometryError::ScaleMismatch {
      width: target_w,
      height: target_h,
      actual_width: dest.width,
      actual_height: dest.height,
    });
  }
  Ok(crop)
}

/// 转换 `source` 到 `dest`。只写入 `dest` 的缓冲区，不会重新分配或释放。
pub fn convert(
  source: &TensorDescriptor,
  dest: &mut TensorDescriptor,
  spec: &PreprocessSpec,
) -> Result<(), GeometryError> {
  let src_shape = *source.shape();
  let dst_shape = *dest.shape();
  let crop = validate(spec, &src_shape, &dst_shape)?;
  let (target_w, target_h) = (dst_shape.width, dst_shape.height);

  trace!(
    "预处理 {} {}x{} -> {} {}x{}, 裁剪 {:?}",
    spec.source_format.name(),
    src_shape.width,
    src_shape.height,
    spec.dest_format.name(),
    target_w,
    target_h,
    crop
  );

  let sampler = Sampler {
    data: source.bytes(),
    format: spec.source_format,
    width: src_shape.width as usize,
    height: src_shape.height as usize,
  };
  let out = dest.bytes_mut();
  let (dw, dh) = (target_w as usize, target_h as usize);
  let (cw, ch) = (crop.width as usize, crop.height as usize);

  if spec.scale.is_none() && spec.source_format == spec.dest_format && is_interleaved(spec.dest_format) {
    copy_rows(&sampler, out, &crop);
    return Ok(());
  }

  for dy in 0..dh {
    let sy = crop.y as usize + dy * ch / dh;
    for dx in 0..dw {
      let sx = crop.x as usize + dx * cw / dw;
      let rgb = sampler.rgb(sx, sy);
      write_pixel(out, spec.dest_format, dw, dh, dx, dy, rgb);
    }
  }
  Ok(())
}

fn check_image(shape: &TensorShape, expected: PixelFormat) -> Result<(), GeometryError> {
  if shape.format == PixelFormat::Raw || shape.element != ElementType::U8 {
    return Err(GeometryError::NotAnImage(shape.format.name()));
  }
  if shape.format != expected {
    return Err(GeometryError::UnsupportedConversion {
      from: expected.name(),
      to: shape.format.name(),
    });
  }
  Ok(())
}

fn is_interleaved(format: PixelFormat) -> bool {
  matches!(format, PixelFormat::Rgb | PixelFormat::Bgr)
}

fn copy_rows(sampler: &Sampler, out: &mut [u8], crop: &CropRect) {
  let row_bytes = crop.width as usize * 3;
  for row in 0..crop.height as usize {
    let sy = crop.y as usize + row;
    let start = (sy * sampler.width + crop.x as usize) * 3;
    out[row * row_bytes..(row + 1) * row_bytes]
      .copy_from_slice(&sampler.data[start..start + row_bytes]);
  }
}

struct Sampler<'a> {
  data: &'a [u8],
  format: PixelFormat,
  width: usize,
  height: usize,
}

impl Sampler<'_> {
  fn rgb(&self, x: usize, y: usize) -> [u8; 3] {
    let plane = self.width * self.height;
    match self.format {
      PixelFormat::Rgb => {
        let i = (y * self.width + x) * 3;
        [self.data[i], self.data[i + 1], self.data[i + 2]]
      }
      PixelFormat::Bgr => {
        let i = (y * self.width + x) * 3;
        [self.data[i + 2], self.data[i + 1], self.data[i]]
      }
      PixelFormat::RgbPlanar => {
        let i = y * self.width + x;
        [self.data[i], self.data[plane + i], self.data[2 * plane + i]]
      }
      PixelFormat::Nv12 => {
        let luma = self.data[y * self.width + x];
        let uv = plane + (y / 2) * self.width + (x / 2) * 2;
        yuv_to_rgb(luma, self.data[uv], self.data[uv + 1])
      }
      PixelFormat::Raw => [0, 0, 0],
    }
  }
}

fn write_pixel(
  out: &mut [u8],
  format: PixelFormat,
  width: usize,
  height: usize,
  x: usize,
  y: usize,
  rgb: [u8; 3],
) {
  match format {
    PixelFormat::Rgb => {
      let i = (y * width + x) * 3;
      out[i..i + 3].copy_from_slice(&rgb);
    }
    PixelFormat::Bgr => {
      let i = (y * width + x) * 3;
      out[i] = rgb[2];
      out[i + 1] = rgb[1];
      out[i + 2] = rgb[0];
    }
    PixelFormat::RgbPlanar => {
      let plane = width * height;
      let i = y * width + x;
      for (c, value) in rgb.into_iter().enumerate() {
        out[c * plane + i] = value;
      }
    }
    PixelFormat::Nv12 | PixelFormat::Raw => {}
  }
}

/// BT.601 有限范围 YUV 转 RGB（整数近似）
pub fn yuv_to_rgb(y: u8, u: u8, v: u8) -> [u8; 3] {
  let c = y as i32 - 16;
  let d = u as i32 - 128;
  let e = v as i32 - 128;
  let clamp = |x: i32| x.clamp(0, 255) as u8;
  [
    clamp((298 * c + 409 * e + 128) >> 8),
    clamp((298 * c - 100 * d - 208 * e + 128) >> 8),
    clamp((298 * c + 516 * d + 128) >> 8),
  ]
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::buffer::{Backing, BufferPool};

  fn tensor(pool: &mut BufferPool, shape: TensorShape, fill: u8) -> TensorDescriptor {
    let mut buffer = pool.acquire(shape.byte_len()).unwrap();
    buffer.as_mut().fill(fill);
    TensorDescriptor::new(shape, buffer).unwrap()
  }

  fn gradient(pool: &mut BufferPool, width: u32, height: u32) -> TensorDescriptor {
    let mut t = tensor(pool, TensorShape::image(PixelFormat::Rgb, width, height), 0);
    let w = width as usize;
    for (i, px) in t.bytes_mut().chunks_exact_mut(3).enumerate() {
      let (x, y) = (i % w, i / w);
      px.copy_from_slice(&[x as u8, y as u8, (x + y) as u8]);
    }
    t
  }

  #[test]
  fn crop_inside_bounds_touches_exact_destination() {
    let mut pool = BufferPool::new(Backing::Heap, 4);
    let src = gradient(&mut pool, 8, 6);
    let mut dst = tensor(&mut pool, TensorShape::image(PixelFormat::Rgb, 3, 2), 0xAA);

    let spec = PreprocessSpec::new(PixelFormat::Rgb, PixelFormat::Rgb).with_crop(CropRect::new(4, 3, 3, 2));
    convert(&src, &mut dst, &spec).unwrap();

    assert_eq!(dst.bytes().len(), 3 * 2 * 3);
    assert_eq!(&dst.bytes()[..3], &[4, 3, 7]);
    assert_eq!(&dst.bytes()[15..18], &[6, 4, 10]);
  }

  #[test]
  fn crop_outside_bounds_leaves_destination_untouched() {
    let mut pool = BufferPool::new(Backing::Heap, 4);
    let src = gradient(&mut pool, 8, 6);
    let mut dst = tensor(&mut pool, TensorShape::image(PixelFormat::Rgb, 4, 4), 0x5A);

    for crop in [CropRect::new(6, 0, 4, 4), CropRect::new(0, 4, 4, 4), CropRect::new(9, 9, 4, 4)] {
      let spec = PreprocessSpec::new(PixelFormat::Rgb, PixelFormat::Rgb).with_crop(crop);
      let err = convert(&src, &mut dst, &spec).unwrap_err();
      assert!(matches!(err, GeometryError::CropOutOfBounds { .. }));
      assert!(dst.bytes().iter().all(|&b| b == 0x5A));
    }
  }

  #[test]
  fn scale_uses_dest_over_crop_ratio() {
    let mut pool = BufferPool::new(Backing::Heap, 4);
    let src = gradient(&mut pool, 8, 8);
    let mut dst = tensor(&mut pool, TensorShape::image(PixelFormat::RgbPlanar, 4, 4), 0);

    let spec = PreprocessSpec::new(PixelFormat::Rgb, PixelFormat::RgbPlanar).with_scale(4, 4);
    convert(&src, &mut dst, &spec).unwrap();

    // 每隔一个像素采样，R 平面即源 x 坐标
    assert_eq!(&dst.bytes()[..4], &[0, 2, 4, 6]);
    // G 平面第二行对应源 y = 2
    assert_eq!(dst.bytes()[16 + 4], 2);
  }

  #[test]
  fn scale_mismatch_is_rejected() {
    let mut pool = BufferPool::new(Backing::Heap, 4);
    let src = gradient(&mut pool, 8, 8);
    let mut dst = tensor(&mut pool, TensorShape::image(PixelFormat::Rgb, 4, 4), 1);
    let spec = PreprocessSpec::new(PixelFormat::Rgb, PixelFormat::Rgb).with_scale(5, 4);
    assert!(matches!(
      convert(&src, &mut dst, &spec),
      Err(GeometryError::ScaleMismatch { .. })
    ));
    assert!(dst.bytes().iter().all(|&b| b == 1));
  }

  #[test]
  fn nv12_to_bgr() {
    let mut pool = BufferPool::new(Backing::Heap, 4);
    let mut src = tensor(&mut pool, TensorShape::image(PixelFormat::Nv12, 2, 2), 0);
    // 纯白：Y=235, U=V=128
    src.bytes_mut()[..4].fill(235);
    src.bytes_mut()[4..].fill(128);
    let mut dst = tensor(&mut pool, TensorShape::image(PixelFormat::Bgr, 2, 2), 0);

    convert(&src, &mut dst, &PreprocessSpec::new(PixelFormat::Nv12, PixelFormat::Bgr)).unwrap();
    assert!(dst.bytes().iter().all(|&b| b == 255));
  }

  #[test]
  fn rejects_odd_nv12_and_empty_crop() {
    let mut pool = BufferPool::new(Backing::Heap, 4);
    let src = tensor(&mut pool, TensorShape::image(PixelFormat::Nv12, 3, 2), 0);
    let mut dst = tensor(&mut pool, TensorShape::image(PixelFormat::Rgb, 3, 2), 0);
    assert!(matches!(
      convert(&src, &mut dst, &PreprocessSpec::new(PixelFormat::Nv12, PixelFormat::Rgb)),
      Err(GeometryError::OddDimensions { .. })
    ));

    let rgb = gradient(&mut pool, 4, 4);
    let spec = PreprocessSpec::new(PixelFormat::Rgb, PixelFormat::Rgb).with_crop(CropRect::new(1, 1, 0, 2));
    assert_eq!(convert(&rgb, &mut dst, &spec), Err(GeometryError::EmptyCrop));
  }

  #[test]
  fn validate_checks_shapes_without_buffers() {
    let source = TensorShape::image(PixelFormat::Nv12, 16, 16);
    let dest = TensorShape::image(PixelFormat::Rgb, 8, 8);
    let spec = PreprocessSpec::new(PixelFormat::Nv12, PixelFormat::Rgb).with_scale(8, 8);
    assert_eq!(validate(&spec, &source, &dest), Ok(CropRect::new(0, 0, 16, 16)));

    let spec = spec.with_crop(CropRect::new(10, 10, 16, 16));
    assert!(matches!(
      validate(&spec, &source, &dest),
      Err(GeometryError::CropOutOfBounds { .. })
    ));
    let spec = spec.with_crop(CropRect::new(0, 0, 0, 4));
    assert_eq!(validate(&spec, &source, &dest), Err(GeometryError::EmptyCrop));
  }

  #[test]
  fn yuv_reference_points() {
    assert_eq!(yuv_to_rgb(16, 128, 128), [0, 0, 0]);
    assert_eq!(yuv_to_rgb(235, 128, 128), [255, 255, 255]);
  }
}
