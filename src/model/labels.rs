// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/model/labels.rs - 类别表
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

use std::path::Path;

use tracing::debug;

use super::ModelError;

/// PCB 缺陷数据集类别名称
pub const PCB_DEFECT_CLASSES: [&str; 6] = [
  "missing_hole",
  "mouse_bite",
  "open_circuit",
  "short",
  "spur",
  "spurious_copper",
];

/// 类别 id 到名称的固定映射
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelTable {
  names: Box<[String]>,
}

impl Default for LabelTable {
  fn default() -> Self {
    Self::pcb_defects()
  }
}

impl LabelTable {
  pub fn new<I, S>(names: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Self {
      names: names.into_iter().map(Into::into).collect(),
    }
  }

  pub fn pcb_defects() -> Self {
    Self::new(PCB_DEFECT_CLASSES)
  }

  /// 从文本文件读取，每行一个类别名，行号即类别 id，忽略空行
  pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ModelError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)?;
    let table = Self::new(
      content
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty()),
    );
    if table.is_empty() {
      return Err(ModelError::ModelInvalid(format!(
        "类别表为空: {}",
        path.display()
      )));
    }
    debug!("从 {} 读取 {} 个类别", path.display(), table.len());
    Ok(table)
  }

  pub fn get(&self, class_id: u32) -> Option<&str> {
    self.names.get(class_id as usize).map(String::as_str)
  }

  pub fn len(&self) -> usize {
    self.names.len()
  }

  pub fn is_empty(&self) -> bool {
    self.names.is_empty()
  }
}
