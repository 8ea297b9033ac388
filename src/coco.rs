// 该文件是 Maskterial 项目的一部分。
// src/coco.rs - COCO 数据格式
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
  collections::{BTreeMap, BTreeSet},
  path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::rle::{RleObject, Segmentation};

#[derive(Error, Debug)]
pub enum CocoError {
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 解析错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 框坐标约定
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BoxMode {
  /// `[x_min, y_min, x_max, y_max]`，绝对像素坐标
  #[serde(rename = "XYXY_ABS")]
  XyxyAbs,
  /// `[x, y, w, h]`，绝对像素坐标
  #[serde(rename = "XYWH_ABS")]
  XywhAbs,
}

impl BoxMode {
  /// 转换为 `[x, y, w, h]`
  pub fn to_xywh(self, bbox: [f64; 4]) -> [f64; 4] {
    match self {
      BoxMode::XywhAbs => bbox,
      BoxMode::XyxyAbs => [bbox[0], bbox[1], bbox[2] - bbox[0], bbox[3] - bbox[1]],
    }
  }

  /// 转换为 `[x_min, y_min, x_max, y_max]`
  pub fn to_xyxy(self, bbox: [f64; 4]) -> [f64; 4] {
    match self {
      BoxMode::XyxyAbs => bbox,
      BoxMode::XywhAbs => [bbox[0], bbox[1], bbox[0] + bbox[2], bbox[1] + bbox[3]],
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoImage {
  pub id: u64,
  pub width: u32,
  pub height: u32,
  #[serde(default)]
  pub file_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoAnnotation {
  pub id: u64,
  pub image_id: u64,
  pub category_id: u64,
  /// `[x, y, w, h]`
  #[serde(default)]
  pub bbox: [f64; 4],
  #[serde(default)]
  pub area: f64,
  #[serde(default)]
  pub iscrowd: u8,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub segmentation: Option<Segmentation>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub keypoints: Option<Vec<f64>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoCategory {
  pub id: u64,
  pub name: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub supercategory: Option<String>,
}

/// COCO 标注文件。测试集文件不含 `annotations` 字段。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CocoDataset {
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub info: Option<serde_json::Value>,
  pub images: Vec<CocoImage>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub annotations: Option<Vec<CocoAnnotation>>,
  #[serde(default)]
  pub categories: Vec<CocoCategory>,
}

/// 单条预测结果，与 COCO 结果文件中的记录一一对应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CocoResult {
  pub image_id: u64,
  pub category_id: u64,
  /// `[x, y, w, h]`
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub bbox: Option<[f64; 4]>,
  pub score: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub segmentation: Option<RleObject>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub keypoints: Option<Vec<f64>>,
}

/// 带索引的真值数据集
#[derive(Debug, Clone)]
pub struct CocoIndex {
  dataset: CocoDataset,
  images: BTreeMap<u64, usize>,
  anns_by_image: BTreeMap<u64, Vec<usize>>,
}

impl CocoIndex {
  pub fn new(dataset: CocoDataset) -> Self {
    let images = dataset
      .images
      .iter()
      .enumerate()
      .map(|(idx, image)| (image.id, idx))
      .collect();

    let mut anns_by_image: BTreeMap<u64, Vec<usize>> = BTreeMap::new();
    for (idx, ann) in dataset.annotations.iter().flatten().enumerate() {
      anns_by_image.entry(ann.image_id).or_default().push(idx);
    }

    debug!(
      "COCO 索引: {} 张图像, {} 个标注, {} 个类别",
      dataset.images.len(),
      dataset.annotations.as_ref().map_or(0, Vec::len),
      dataset.categories.len()
    );

    Self {
      dataset,
      images,
      anns_by_image,
    }
  }

  pub fn from_json_file(path: &Path) -> Result<Self, CocoError> {
    info!("加载 COCO 标注文件: {}", path.display());
    let data = std::fs::read(path)?;
    let dataset: CocoDataset = serde_json::from_slice(&data)?;
    Ok(Self::new(dataset))
  }

  pub fn dataset(&self) -> &CocoDataset {
    &self.dataset
  }

  /// 文件中是否包含 `annotations` 字段
  pub fn has_annotations(&self) -> bool {
    self.dataset.annotations.is_some()
  }

  pub fn img_ids(&self) -> Vec<u64> {
    self.images.keys().copied().collect()
  }

  pub fn cat_ids(&self) -> Vec<u64> {
    self
      .dataset
      .categories
      .iter()
      .map(|c| c.id)
      .collect::<BTreeSet<_>>()
      .into_iter()
      .collect()
  }

  pub fn image(&self, id: u64) -> Option<&CocoImage> {
    self.images.get(&id).map(|&idx| &self.dataset.images[idx])
  }

  pub fn annotations(&self) -> &[CocoAnnotation] {
    self.dataset.annotations.as_deref().unwrap_or(&[])
  }

  pub fn annotations_for_image(&self, image_id: u64) -> impl Iterator<Item = &CocoAnnotation> {
    let anns = self.annotations();
    self
      .anns_by_image
      .get(&image_id)
      .into_iter()
      .flatten()
      .map(move |&idx| &anns[idx])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const SAMPLE: &str = r#"{
    "images": [
      {"id": 7, "width": 20, "height": 10, "file_name": "b.png"},
      {"id": 3, "width": 20, "height": 10}
    ],
    "annotations": [
      {"id": 1, "image_id": 7, "category_id": 2, "bbox": [1, 1, 3, 2], "area": 6, "iscrowd": 0},
      {"id": 2, "image_id": 3, "category_id": 1, "bbox": [0, 0, 2, 2], "area": 4,
       "segmentation": [[0, 0, 0, 2, 2, 2, 2, 0]]},
      {"id": 3, "image_id": 7, "category_id": 1, "bbox": [5, 5, 1, 1], "area": 1, "iscrowd": 1}
    ],
    "categories": [{"id": 2, "name": "bilayer"}, {"id": 1, "name": "monolayer"}]
  }"#;

  #[test]
  fn index_sorts_ids_and_groups_annotations() {
    let dataset: CocoDataset = serde_json::from_str(SAMPLE).unwrap();
    let index = CocoIndex::new(dataset);
    assert!(index.has_annotations());
    assert_eq!(index.img_ids(), vec![3, 7]);
    assert_eq!(index.cat_ids(), vec![1, 2]);
    assert_eq!(index.image(7).map(|i| i.file_name.as_str()), Some("b.png"));
    let ids: Vec<u64> = index.annotations_for_image(7).map(|a| a.id).collect();
    assert_eq!(ids, vec![1, 3]);
    assert_eq!(index.annotations_for_image(42).count(), 0);
  }

  #[test]
  fn test_split_without_annotations() {
    let dataset: CocoDataset =
      serde_json::from_str(r#"{"images": [{"id": 1, "width": 4, "height": 4}], "categories": []}"#)
        .unwrap();
    let index = CocoIndex::new(dataset);
    assert!(!index.has_annotations());
    assert!(index.annotations().is_empty());
  }

  #[test]
  fn box_mode_conversions() {
    assert_eq!(
      BoxMode::XyxyAbs.to_xywh([1.0, 2.0, 4.0, 7.0]),
      [1.0, 2.0, 3.0, 5.0]
    );
    assert_eq!(
      BoxMode::XywhAbs.to_xyxy([1.0, 2.0, 3.0, 5.0]),
      [1.0, 2.0, 4.0, 7.0]
    );
    assert_eq!(
      serde_json::to_string(&BoxMode::XyxyAbs).unwrap(),
      "\"XYXY_ABS\""
    );
  }
}
