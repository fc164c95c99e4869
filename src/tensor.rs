// 该文件是 Shanan （山南西风） 项目的一部分。
// src/tensor.rs - 张量描述
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

use serde::{Deserialize, Serialize};

use crate::{buffer::Buffer, error::ResourceError};

const RGB_CHANNELS: u32 = 3;

/// 像素/数据布局
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PixelFormat {
  /// YUV 4:2:0 半平面：Y 平面后接交错的 UV 平面
  Nv12,
  /// 交错 RGB (NHWC)
  Rgb,
  /// 交错 BGR (NHWC)
  Bgr,
  /// 平面 RGB (NCHW)
  RgbPlanar,
  /// 非图像数据，例如模型输出
  Raw,
}

impl PixelFormat {
  pub fn name(self) -> &'static str {
    match self {
      PixelFormat::Nv12 => "nv12",
      PixelFormat::Rgb => "rgb",
      PixelFormat::Bgr => "bgr",
      PixelFormat::RgbPlanar => "rgb_planar",
      PixelFormat::Raw => "raw",
    }
  }

  pub fn parse(name: &str) -> Option<Self> {
    match name.to_ascii_lowercase().as_str() {
      "nv12" => Some(PixelFormat::Nv12),
      "rgb" => Some(PixelFormat::Rgb),
      "bgr" => Some(PixelFormat::Bgr),
      "rgb_planar" | "nchw" => Some(PixelFormat::RgbPlanar),
      "raw" => Some(PixelFormat::Raw),
      _ => None,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElementType {
  U8,
  F32,
}

impl ElementType {
  pub fn size(self) -> usize {
    match self {
      ElementType::U8 => 1,
      ElementType::F32 => 4,
    }
  }
}

/// 张量的逻辑形状与格式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TensorShape {
  pub format: PixelFormat,
  pub width: u32,
  pub height: u32,
  pub channels: u32,
  pub element: ElementType,
}

impl TensorShape {
  pub fn image(format: PixelFormat, width: u32, height: u32) -> Self {
    let channels = match format {
      PixelFormat::Nv12 => 1,
      PixelFormat::Raw => 1,
      _ => RGB_CHANNELS,
    };
    Self {
      format,
      width,
      height,
      channels,
      element: ElementType::U8,
    }
  }

  /// `rows` 行 `cols` 列的矩阵
  pub fn matrix(rows: u32, cols: u32, element: ElementType) -> Self {
    Self {
      format: PixelFormat::Raw,
      width: cols,
      height: rows,
      channels: 1,
      element,
    }
  }

  pub fn vector(len: u32, element: ElementType) -> Self {
    Self::matrix(1, len, element)
  }

  pub fn element_count(&self) -> usize {
    match self.format {
      PixelFormat::Nv12 => {
        let (w, h) = (self.width as usize, self.height as usize);
        w * h + 2 * w.div_ceil(2) * h.div_ceil(2)
      }
      _ => self.width as usize * self.height as usize * self.channels as usize,
    }
  }

  pub fn byte_len(&self) -> usize {
    self.element_count() * self.element.size()
  }
}

/// 缓冲区 + 形状。声明的字节数必须与缓冲区容量完全一致。
#[derive(Debug)]
pub struct TensorDescriptor {
  shape: TensorShape,
  buffer: Buffer,
}

impl TensorDescriptor {
  pub fn new(shape: TensorShape, buffer: Buffer) -> Result<Self, (ResourceError, Buffer)> {
    let declared = shape.byte_len();
    if declared != buffer.len() {
      let actual = buffer.len();
      return Err((ResourceError::SizeMismatch { declared, actual }, buffer));
    }
    Ok(Self { shape, buffer })
  }

  pub fn shape(&self) -> &TensorShape {
    &self.shape
  }

  pub fn buffer(&self) -> &Buffer {
    &self.buffer
  }

  pub fn into_buffer(self) -> Buffer {
    self.buffer
  }

  pub fn bytes(&self) -> &[u8] {
    self.buffer.as_ref()
  }

  pub fn bytes_mut(&mut self) -> &mut [u8] {
    self.buffer.as_mut()
  }

  /// 按本机字节序读取第 `index` 个 f32 元素
  pub fn f32_at(&self, index: usize) -> Option<f32> {
    let start = index.checked_mul(4)?;
    let raw = self.bytes().get(start..start + 4)?;
    Some(f32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
  }

  pub fn f32_len(&self) -> usize {
    self.bytes().len() / 4
  }

  pub fn to_f32_vec(&self) -> Vec<f32> {
    self
      .bytes()
      .chunks_exact(4)
      .map(|c| f32::from_ne_bytes([c[0], c[1], c[2], c[3]]))
      .collect()
  }

  /// 从头写入 f32 数据，超出容量的部分被截断。返回写入的元素数。
  pub fn write_f32(&mut self, values: &[f32]) -> usize {
    let bytes = self.bytes_mut();
    let mut written = 0;
    for (dst, value) in bytes.chunks_exact_mut(4).zip(values) {
      dst.copy_from_slice(&value.to_ne_bytes());
      written += 1;
    }
    written
  }
}

/// 一次推理任务绑定的输入输出张量
#[derive(Debug, Default)]
pub struct TensorSet {
  pub inputs: Vec<TensorDescriptor>,
  pub outputs: Vec<TensorDescriptor>,
}

impl TensorSet {
  pub fn input_shapes(&self) -> Vec<TensorShape> {
    self.inputs.iter().map(|t| *t.shape()).collect()
  }

  pub fn output_shapes(&self) -> Vec<TensorShape> {
    self.outputs.iter().map(|t| *t.shape()).collect()
  }

  pub fn into_buffers(self) -> impl Iterator<Item = Buffer> {
    self
      .inputs
      .into_iter()
      .chain(self.outputs)
      .map(TensorDescriptor::into_buffer)
  }
}
