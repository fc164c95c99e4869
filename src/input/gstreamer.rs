// 该文件是 Shanan （山南西风） 项目的一部分。
// src/input/gstreamer.rs - GStreamer 帧源
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

//! # GStreamer 帧源
//!
//! 以 appsink 结尾的 GStreamer 管道，按 URL 构建：
//!
//! - `gst://camera/dev/video0?width=640&height=480&fps=15&target=nv12`
//! - `gst://file/path/to/video.mp4?width=640&height=480&rotate=90`
//!
//! 管道在末尾统一做 `videoconvert ! videoscale`，输出尺寸和格式固定，
//! 因此帧环的槽位大小在启动前即可确定。
//!
//! 使用前需要安装 GStreamer 开发库（`libgstreamer1.0-dev`、
//! `libgstreamer-plugins-base1.0-dev`），并启用 `gstreamer_input` 特性。

use std::{collections::HashMap, time::Duration};

use chrono::Utc;
use gstreamer::{self as gst, prelude::*};
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use thiserror::Error;
use tracing::{error, info, warn};
use url::Url;

use super::{Frame, FrameRing, FrameSource, NextFrame};
use crate::{
  FromUrl, FromUrlWithScheme,
  buffer::Backing,
  error::{ResourceError, SourceError},
  tensor::{PixelFormat, TensorDescriptor, TensorShape},
};

const DEFAULT_SLOTS: usize = 2;

#[derive(Error, Debug)]
pub enum GStreamerSourceError {
  #[error("URI scheme mismatch")]
  SchemeMismatch,
  #[error("GStreamer error: {0}")]
  GStreamerError(#[from] gst::glib::Error),
  #[error("GStreamer boolean error: {0}")]
  GStreamerBoolError(#[from] gst::glib::BoolError),
  #[error("Failed to get appsink element")]
  AppSinkNotFound,
  #[error("Failed to convert element to appsink")]
  AppSinkConversionFailed,
  #[error("Unsupported target format: {0}")]
  UnsupportedFormat(String),
  #[error("Pipeline error: {0}")]
  PipelineError(String),
  #[error("Ring allocation failed: {0}")]
  Ring(#[from] ResourceError),
}

enum PipelineItem {
  FileSource(String),
  CameraSource {
    camera: String,
    io_mode: Option<u32>,
    fps: u32,
  },
  VideoFlip {
    method: u32,
  },
  Target {
    format: PixelFormat,
    width: u32,
    height: u32,
  },
}

impl PipelineItem {
  fn to_pipeline(&self) -> String {
    match self {
      PipelineItem::FileSource(path) => format!("filesrc location={} ! decodebin", path),
      PipelineItem::CameraSource {
        camera,
        io_mode,
        fps,
      } => {
        let io_mode = io_mode
          .map(|mode| format!(" io-mode={}", mode))
          .unwrap_or_default();
        format!("v4l2src device={}{} ! videorate ! video/x-raw,framerate={}/1", camera, io_mode, fps)
      }
      PipelineItem::VideoFlip { method } => format!("videoflip method={}", method),
      PipelineItem::Target {
        format,
        width,
        height,
      } => format!(
        "videoconvert ! videoscale ! video/x-raw,format={},width={},height={}",
        caps_format(*format),
        width,
        height
      ),
    }
  }
}

fn caps_format(format: PixelFormat) -> &'static str {
  match format {
    PixelFormat::Nv12 => "NV12",
    PixelFormat::Bgr => "BGR",
    _ => "RGB",
  }
}

/// GStreamer 帧源构建器
pub struct GStreamerSourceBuilder {
  items: Vec<PipelineItem>,
  shape: TensorShape,
  slots: usize,
}

impl FromUrlWithScheme for GStreamerSourceBuilder {
  const SCHEME: &'static str = "gst";
}

impl FromUrl for GStreamerSourceBuilder {
  type Error = GStreamerSourceError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(GStreamerSourceError::SchemeMismatch);
    }

    let query: HashMap<String, String> = url
      .query_pairs()
      .map(|(k, v)| (String::from(k), String::from(v)))
      .collect();
    let number = |key: &str, default: u32| {
      query
        .get(key)
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
    };

    let mut items = Vec::new();
    match url.host_str() {
      Some("camera") => items.push(PipelineItem::CameraSource {
        camera: url.path().to_string(),
        io_mode: query.get("io-mode").and_then(|v| v.parse().ok()),
        fps: number("fps", 15),
      }),
      Some("file") => items.push(PipelineItem::FileSource(url.path().to_string())),
      _ => return Err(GStreamerSourceError::SchemeMismatch),
    }

    if let Some(method) = query.get("rotate").and_then(|r| match r.as_str() {
      "90" => Some(1),
      "180" => Some(2),
      "270" => Some(3),
      _ => None,
    }) {
      items.push(PipelineItem::VideoFlip { method });
    }

    let format = match query.get("target") {
      Some(name) => match PixelFormat::parse(name) {
        Some(f @ (PixelFormat::Nv12 | PixelFormat::Rgb | PixelFormat::Bgr)) => f,
        _ => return Err(GStreamerSourceError::UnsupportedFormat(name.clone())),
      },
      None => PixelFormat::Rgb,
    };
    let (width, height) = (number("width", 640), number("height", 480));
    items.push(PipelineItem::Target {
      format,
      width,
      height,
    });

    Ok(Self {
      items,
      shape: TensorShape::image(format, width, height),
      slots: number("slots", DEFAULT_SLOTS as u32) as usize,
    })
  }
}

impl GStreamerSourceBuilder {
  pub fn build(self) -> Result<GStreamerSource, GStreamerSourceError> {
    gst::init()?;

    let basic_pipeline = self
      .items
      .iter()
      .map(PipelineItem::to_pipeline)
      .collect::<Vec<String>>()
      .join(" ! ");
    let full_pipeline = format!("{} ! appsink max-buffers=2 drop=true name=sink", basic_pipeline);
    info!("GStreamer pipeline description: {}", full_pipeline);

    let pipeline = gst::parse::launch(&full_pipeline)?
      .downcast::<gst::Pipeline>()
      .map_err(|_| GStreamerSourceError::PipelineError("Failed to create pipeline".to_string()))?;
    let appsink = pipeline
      .by_name("sink")
      .ok_or(GStreamerSourceError::AppSinkNotFound)?
      .downcast::<gst_app::AppSink>()
      .map_err(|_| GStreamerSourceError::AppSinkConversionFailed)?;

    let ring = FrameRing::new(Backing::Heap, self.slots, self.shape.byte_len())?;

    Ok(GStreamerSource {
      pipeline,
      appsink,
      ring,
      shape: self.shape,
      sequence: 0,
      started: false,
    })
  }
}

/// 基于 appsink 的帧源
pub struct GStreamerSource {
  pipeline: gst::Pipeline,
  appsink: gst_app::AppSink,
  ring: FrameRing,
  shape: TensorShape,
  sequence: u64,
  started: bool,
}

impl Drop for GStreamerSource {
  fn drop(&mut self) {
    if let Err(e) = self.pipeline.set_state(gst::State::Null) {
      warn!("Failed to stop GStreamer pipeline: {}", e);
    }
  }
}

impl GStreamerSource {
  /// 检查总线上的错误与 EOS
  fn poll_bus(&self) -> Option<Result<NextFrame, SourceError>> {
    let bus = self.pipeline.bus()?;
    let message = bus.pop_filtered(&[gst::MessageType::Error, gst::MessageType::Eos])?;
    match message.view() {
      gst::MessageView::Eos(..) => Some(Ok(NextFrame::EndOfStream)),
      gst::MessageView::Error(err) => {
        error!("GStreamer 管道错误: {} ({:?})", err.error(), err.debug());
        Some(Err(SourceError::Closed))
      }
      _ => None,
    }
  }

  fn copy_sample(&self, sample: &gst::Sample, out: &mut [u8]) -> Result<(), SourceError> {
    let buffer = sample
      .buffer()
      .ok_or_else(|| SourceError::Capture("No buffer in sample".to_string()))?;
    let caps = sample
      .caps()
      .ok_or_else(|| SourceError::Capture("No caps in sample".to_string()))?;
    let info = gst_video::VideoInfo::from_caps(caps)
      .map_err(|_| SourceError::Capture("Failed to get video info from caps".to_string()))?;
    if info.width() != self.shape.width || info.height() != self.shape.height {
      return Err(SourceError::Capture(format!(
        "帧尺寸 {}x{} 与配置 {}x{} 不一致",
        info.width(),
        info.height(),
        self.shape.width,
        self.shape.height
      )));
    }

    let map = buffer
      .map_readable()
      .map_err(|e| SourceError::Capture(format!("Failed to map buffer for reading: {}", e)))?;
    let data = map.as_slice();

    let (w, h) = (self.shape.width as usize, self.shape.height as usize);
    // (行字节数, 行数) 每个平面
    let planes: Vec<(usize, usize)> = match self.shape.format {
      PixelFormat::Nv12 => vec![(w, h), (w, h / 2)],
      _ => vec![(w * 3, h)],
    };

    let mut written = 0;
    for (plane, &(row_bytes, rows)) in planes.iter().enumerate() {
      let offset = info.offset()[plane];
      let stride = info.stride()[plane] as usize;
      for row in 0..rows {
        let start = offset + row * stride;
        let src = data.get(start..start + row_bytes).ok_or_else(|| {
          SourceError::Capture(format!("Buffer too small: {} bytes", data.len()))
        })?;
        out[written..written + row_bytes].copy_from_slice(src);
        written += row_bytes;
      }
    }
    Ok(())
  }
}

impl FrameSource for GStreamerSource {
  fn shape(&self) -> TensorShape {
    self.shape
  }

  fn start(&mut self) -> Result<(), SourceError> {
    self
      .pipeline
      .set_state(gst::State::Playing)
      .map_err(|e| SourceError::Capture(e.to_string()))?;
    self.started = true;
    info!("GStreamer 帧源已启动");
    Ok(())
  }

  fn next_frame(&mut self, timeout: Duration) -> Result<NextFrame, SourceError> {
    if !self.started {
      return Err(SourceError::NotStarted);
    }
    if let Some(result) = self.poll_bus() {
      return result;
    }

    let Some(mut slot) = self
      .ring
      .acquire(timeout)
      .map_err(|e| SourceError::Capture(e.to_string()))?
    else {
      return Ok(NextFrame::Empty);
    };

    let sample = self
      .appsink
      .try_pull_sample(gst::ClockTime::from_mseconds(timeout.as_millis() as u64));
    let Some(sample) = sample else {
      let _ = self.ring.give_back(slot);
      if self.appsink.is_eos() {
        return Ok(NextFrame::EndOfStream);
      }
      return Ok(NextFrame::Empty);
    };

    if let Err(e) = self.copy_sample(&sample, slot.as_mut()) {
      let _ = self.ring.give_back(slot);
      return Err(e);
    }

    let tensor = TensorDescriptor::new(self.shape, slot).map_err(|(e, buffer)| {
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
    self
      .pipeline
      .set_state(gst::State::Null)
      .map(|_| ())
      .map_err(|e| SourceError::Capture(e.to_string()))
  }
}
