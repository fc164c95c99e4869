// 该文件是 Shanan （山南西风） 项目的一部分。
// src/output/logging.rs - 日志输出
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

use std::convert::Infallible;

use tracing::info;
use url::Url;

use super::{DetectionSink, OutputError};
use crate::{FromUrl, FromUrlWithScheme, pipeline::CycleReport};

/// 把检测结果写入日志；`log://?empty` 时没有检测的周期也记录
#[derive(Debug, Default, Clone)]
pub struct LogSink {
  log_empty: bool,
}

impl FromUrlWithScheme for LogSink {
  const SCHEME: &'static str = "log";
}

impl FromUrl for LogSink {
  type Error = OutputError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(OutputError::SchemeMismatch);
    }
    Ok(LogSink {
      log_empty: url.query_pairs().any(|(k, _)| k == "empty"),
    })
  }
}

impl DetectionSink for LogSink {
  type Error = Infallible;

  fn consume(&mut self, report: &CycleReport<'_>) -> Result<(), Self::Error> {
    if report.detections.is_empty() {
      if self.log_empty {
        info!("第 {} 帧: 未检测到物体", report.frame.sequence());
      }
      return Ok(());
    }

    info!(
      "第 {} 帧: 检测到 {} 个物体, 推理耗时 {:.2?}",
      report.frame.sequence(),
      report.detections.len(),
      report.timings.inference
    );
    for (i, det) in report.detections.iter().enumerate() {
      let b = det.bbox;
      info!(
        "物体 {}: 类别: {} - 置信度: {:.3} - 位置: [{:.3}, {:.3}, {:.3}, {:.3}]",
        i,
        report.labels.display(det.class_id),
        det.score,
        b.top,
        b.left,
        b.bottom,
        b.right
      );
    }
    Ok(())
  }
}
