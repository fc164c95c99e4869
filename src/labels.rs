// 该文件是 Shanan （山南西风） 项目的一部分。
// src/labels.rs - 类别名称表
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

use std::{fmt, path::Path, sync::Arc};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum LabelError {
  #[error("无法读取类别文件: {0}")]
  Io(#[from] std::io::Error),
  #[error("类别文件格式错误: {0}")]
  Parse(#[from] toml::de::Error),
}

#[derive(Deserialize)]
struct LabelFile {
  names: Vec<String>,
}

/// 不可变的类别名称表，克隆只增加引用计数
#[derive(Clone, PartialEq, Eq)]
pub struct LabelTable {
  names: Arc<[String]>,
}

impl fmt::Debug for LabelTable {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("LabelTable")
      .field("len", &self.names.len())
      .finish()
  }
}

impl Default for LabelTable {
  fn default() -> Self {
    Self::coco()
  }
}

impl LabelTable {
  pub fn new<S: Into<String>>(names: impl IntoIterator<Item = S>) -> Self {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  pub fn coco() -> Self {
    Self::new(COCO_NAMES)
  }

  /// 从 TOML 文件加载：`names = ["person", "bicycle", ...]`
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, LabelError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let table = Self::parse(&content)?;
    info!("从 {} 加载 {} 个类别", path.display(), table.len());
    Ok(table)
  }

  pub fn parse(content: &str) -> Result<Self, LabelError> {
    let file: LabelFile = toml::from_str(content)?;
    Ok(Self::new(file.names))
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }

  pub fn name(&self, class_id: u32) -> Option<&str> {
    self
      .names
      .get(class_id as usize)
      .map(String::as_str)
      .filter(|name| !name.is_empty())
  }

  /// 未知类别显示为编号
  pub fn display(&self, class_id: u32) -> String {
    match self.name(class_id) {
      Some(name) => name.to_string(),
      None => format!("class-{}", class_id),
    }
  }
}

const COCO_NAMES: [&str; 80] = [
  "person",
  "bicycle",
  "car",
  "motorcycle",
  "airplane",
  "bus",
  "train",
  "truck",
  "boat",
  "traffic light",
  "fire hydrant",
  "stop sign",
  "parking meter",
  "bench",
  "bird",
  "cat",
  "dog",
  "horse",
  "sheep",
  "cow",
  "elephant",
  "bear",
  "zebra",
  "giraffe",
  "backpack",
  "umbrella",
  "handbag",
  "tie",
  "suitcase",
  "frisbee",
  "skis",
  "snowboard",
  "sports ball",
  "kite",
  "baseball bat",
  "baseball glove",
  "skateboard",
  "surfboard",
  "tennis racket",
  "bottle",
  "wine glass",
  "cup",
  "fork",
  "knife",
  "spoon",
  "bowl",
  "banana",
  "apple",
  "sandwich",
  "orange",
  "broccoli",
  "carrot",
  "hot dog",
  "pizza",
  "donut",
  "cake",
  "chair",
  "couch",
  "potted plant",
  "bed",
  "dining table",
  "toilet",
  "tv",
  "laptop",
  "mouse",
  "remote",
  "keyboard",
  "cell phone",
  "microwave",
  "oven",
  "toaster",
  "sink",
  "refrigerator",
  "book",
  "clock",
  "vase",
  "scissors",
  "teddy bear",
  "hair drier",
  "toothbrush",
];
