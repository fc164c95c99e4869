// 该文件是 Shanan （山南西风） 项目的一部分。
// src/bin/common/mod.rs - 示例程序公共部分
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

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;
use url::Url;

use shanan_pipeline::{
  FromUrl,
  config::PipelineConfig,
  decode::DetectionDecoder,
  input::InputWrapper,
  model::{EngineBackend, RknnEngine, RknnEngineBuilder},
  output::OutputWrapper,
  pipeline::Coordinator,
};

/// Shanan 推理流水线参数
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 配置文件 (TOML)，命令行参数优先
  #[arg(long, value_name = "CONFIG")]
  pub config: Option<PathBuf>,
  /// 模型，例如 rknn:///opt/models/yolo26n.rknn
  #[arg(long, value_name = "MODEL")]
  pub model: Option<Url>,
  /// 输入来源，例如 gst://camera/dev/video0 或 image:///tmp/a.png
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,
  /// 输出，例如 log://、jsonl:///var/lib/records 或 crop:///var/lib/crops
  #[arg(long, value_name = "OUTPUT", default_value = "log://")]
  pub output: Url,

  #[arg(long, value_name = "FRAME_NUMBER")]
  pub frame_number: Option<u64>,
}

pub type RknnCoordinator =
  Coordinator<InputWrapper, EngineBackend<RknnEngine>, Box<dyn DetectionDecoder>>;

pub struct Setup {
  pub config: PipelineConfig,
  pub coordinator: RknnCoordinator,
  pub sink: OutputWrapper,
}

pub fn init_tracing() {
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
  tracing_subscriber::fmt().with_env_filter(filter).init();
}

pub fn build(args: &Args) -> Result<Setup> {
  let mut config = match &args.config {
    Some(path) => PipelineConfig::from_file(path)?,
    None => PipelineConfig::default(),
  };
  if let Some(model) = &args.model {
    config.model.url = Some(model.to_string());
  }
  if args.frame_number.is_some() {
    config.runtime.max_frames = args.frame_number;
  }

  let model_url = config
    .model
    .url
    .as_deref()
    .context("未指定模型, 请使用 --model 或在配置文件中设置 [model] url")?;
  let model_url = Url::parse(model_url).context("模型 URL 格式错误")?;

  info!("模型: {}", model_url);
  info!("输入来源: {}", args.input);
  info!("输出路径: {}", args.output);

  let decoder = config.decoder();
  let (engine, model) = RknnEngineBuilder::from_url(&model_url)?
    .with_input(config.model_input())
    .outputs(decoder.output_shapes())
    .build()?;

  let source = InputWrapper::from_url(&args.input)?;
  let sink = OutputWrapper::from_url(&args.output)?;

  let coordinator = Coordinator::builder(source, EngineBackend::new(engine), decoder)
    .model(model)
    .crop(config.preprocess.crop)
    .thresholds(config.thresholds())
    .labels(config.labels()?)
    .options(config.coordinator_options())
    .build();

  Ok(Setup {
    config,
    coordinator,
    sink,
  })
}
