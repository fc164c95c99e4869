// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/continuous.rs - 持续推理示例
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

use anyhow::Result;
use clap::Parser;
use tracing::info;

use shanan_pipeline::task::{ContinuousTask, Task};

mod common;

fn main() -> Result<()> {
  common::init_tracing();

  let args = common::Args::parse();
  let setup = common::build(&args)?;

  let summary = ContinuousTask::default()
    .with_frame_number(args.frame_number)
    .with_grace(setup.config.forced_exit_grace())
    .run_task(setup.coordinator, setup.sink)?;

  info!("运行结果: {:?}", summary.outcome);
  info!("统计: {:?}", summary.stats);
  Ok(())
}
