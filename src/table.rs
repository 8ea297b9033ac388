// 该文件是 Maskterial 项目的一部分。
// src/table.rs - 指标表格
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

use crate::eval::MetricTable;

/// 单行 Markdown 管道表格，数值保留三位小数并居中
pub fn create_small_table(metrics: &MetricTable) -> String {
  let cells: Vec<(&str, String)> = metrics
    .iter()
    .map(|(name, value)| (name, format!("{:.3}", value)))
    .collect();
  let widths: Vec<usize> = cells
    .iter()
    .map(|(name, value)| name.chars().count().max(value.chars().count()))
    .collect();

  let mut header = String::from("|");
  let mut rule = String::from("|");
  let mut row = String::from("|");
  for ((name, value), &w) in cells.iter().zip(&widths) {
    header.push_str(&format!(" {:^w$} |", name));
    rule.push_str(&format!(":{}:|", "-".repeat(w)));
    row.push_str(&format!(" {:^w$} |", value));
  }
  format!("{header}\n{rule}\n{row}")
}
