// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/json_lines.rs - 按日期分目录的 JSON Lines 记录
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
  fs::{self, File, OpenOptions},
  io::{BufWriter, Write},
  path::{Path, PathBuf},
};

use chrono::{DateTime, Datelike, Utc};
use thiserror::Error;
use tracing::debug;
use url::Url;

use super::{CycleRecord, DetectionSink};
use crate::{FromUrl, FromUrlWithScheme, pipeline::CycleReport};

#[derive(Error, Debug)]
pub enum JsonLinesSinkError {
  #[error("URI 方案不匹配")]
  SchemeMismatch,
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("序列化错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 每个周期一行 JSON，写入 `<dir>/YYYY/MM/DD/HH.jsonl`
///
/// `jsonl:///var/lib/records?always` 时没有检测的周期也记录。
pub struct JsonLinesSink {
  directory: PathBuf,
  always: bool,
  current: Option<(PathBuf, BufWriter<File>)>,
}

impl FromUrlWithScheme for JsonLinesSink {
  const SCHEME: &'static str = "jsonl";
}

impl FromUrl for JsonLinesSink {
  type Error = JsonLinesSinkError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(JsonLinesSinkError::SchemeMismatch);
    }
    let always = url.query_pairs().any(|(k, _)| k == "always");
    Ok(Self::new(url.path()).always(always))
  }
}

impl JsonLinesSink {
  pub fn new(directory: impl Into<PathBuf>) -> Self {
    Self {
      directory: directory.into(),
      always: false,
      current: None,
    }
  }

  pub fn always(mut self, always: bool) -> Self {
    self.always = always;
    self
  }

  pub fn directory(&self) -> &Path {
    &self.directory
  }

  fn record_path(&self, now: DateTime<Utc>) -> PathBuf {
    self
      .directory
      .join(now.year().to_string())
      .join(format!("{:02}", now.month()))
      .join(format!("{:02}", now.day()))
      .join(format!("{}.jsonl", now.format("%H")))
  }

  fn writer(&mut self, path: PathBuf) -> Result<&mut BufWriter<File>, JsonLinesSinkError> {
    let reuse = matches!(&self.current, Some((current, _)) if *current == path);
    if !reuse {
      if let Some((_, mut old)) = self.current.take() {
        old.flush()?;
      }
      if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
      }
      debug!("打开记录文件: {}", path.display());
      let file = OpenOptions::new().create(true).append(true).open(&path)?;
      self.current = Some((path, BufWriter::new(file)));
    }
    match &mut self.current {
      Some((_, writer)) => Ok(writer),
      None => Err(JsonLinesSinkError::IoError(std::io::Error::other("记录文件未打开"))),
    }
  }
}

impl DetectionSink for JsonLinesSink {
  type Error = JsonLinesSinkError;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error> {
    if !self.always && report.detections.is_empty() {
      return Ok(());
    }
    let record = CycleRecord::from_report(report);
    let path = self.record_path(record.timestamp);
    let writer = self.writer(path)?;
    serde_json::to_writer(&mut *writer, &record)?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok(())
  }
}
