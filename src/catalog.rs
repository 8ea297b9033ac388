// 该文件是 Maskterial 项目的一部分。
// src/catalog.rs - 数据集目录
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
  collections::BTreeMap,
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
  coco::{BoxMode, CocoAnnotation, CocoCategory, CocoDataset, CocoImage},
  model::ImageRecord,
  rle::{Rle, RleError, Segmentation},
};

#[derive(Error, Debug)]
pub enum CatalogError {
  #[error("数据集 `{0}` 未注册")]
  NotRegistered(String),
  #[error("数据集 `{0}` 已注册")]
  AlreadyRegistered(String),
  #[error("数据集 `{0}` 没有标准格式记录, 无法转换为 COCO 格式")]
  NoRecords(String),
  #[error("RLE 错误: {0}")]
  RleError(#[from] RleError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 数据集元数据
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatasetMetadata {
  /// COCO 格式标注文件
  pub json_file: Option<PathBuf>,
  pub thing_classes: Option<Vec<String>>,
  /// 数据集类别编号到训练用连续编号的映射
  pub thing_dataset_id_to_contiguous_id: Option<BTreeMap<u64, u64>>,
}

/// 标准格式记录中的单个标注，`category_id` 为连续编号
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordAnnotation {
  pub bbox: [f64; 4],
  pub bbox_mode: BoxMode,
  pub category_id: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub segmentation: Option<Segmentation>,
  #[serde(default)]
  pub iscrowd: u8,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub keypoints: Option<Vec<f64>>,
}

/// 标准格式的单张图像记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
  pub file_name: String,
  pub image_id: u64,
  pub height: u32,
  pub width: u32,
  #[serde(default)]
  pub annotations: Vec<RecordAnnotation>,
}

impl ImageRecord for DatasetRecord {
  fn image_id(&self) -> u64 {
    self.image_id
  }
}

#[derive(Debug, Clone)]
struct DatasetEntry {
  metadata: DatasetMetadata,
  records: Option<Vec<DatasetRecord>>,
}

/// 按名称注册的数据集
#[derive(Debug, Clone, Default)]
pub struct DatasetCatalog {
  datasets: BTreeMap<String, DatasetEntry>,
}

impl DatasetCatalog {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn register(
    &mut self,
    name: &str,
    metadata: DatasetMetadata,
    records: Option<Vec<DatasetRecord>>,
  ) -> Result<(), CatalogError> {
    if self.datasets.contains_key(name) {
      return Err(CatalogError::AlreadyRegistered(name.to_string()));
    }
    info!(
      "注册数据集 `{}`: {} 条记录",
      name,
      records.as_ref().map_or(0, Vec::len)
    );
    self
      .datasets
      .insert(name.to_string(), DatasetEntry { metadata, records });
    Ok(())
  }

  pub fn contains(&self, name: &str) -> bool {
    self.datasets.contains_key(name)
  }

  pub fn metadata(&self, name: &str) -> Result<&DatasetMetadata, CatalogError> {
    self
      .datasets
      .get(name)
      .map(|entry| &entry.metadata)
      .ok_or_else(|| CatalogError::NotRegistered(name.to_string()))
  }

  pub fn records(&self, name: &str) -> Result<&[DatasetRecord], CatalogError> {
    let entry = self
      .datasets
      .get(name)
      .ok_or_else(|| CatalogError::NotRegistered(name.to_string()))?;
    entry
      .records
      .as_deref()
      .ok_or_else(|| CatalogError::NoRecords(name.to_string()))
  }

  /// 由标准格式记录构造 COCO 数据集。
  ///
  /// 类别编号经反向映射还原为数据集编号；面积优先取分割面积，否则取框面积；
  /// 标注编号从 1 开始。没有任何标注时不输出 `annotations` 字段。
  pub fn to_coco_dataset(&self, name: &str) -> Result<CocoDataset, CatalogError> {
    let metadata = self.metadata(name)?;
    let records = self.records(name)?;

    let reverse: BTreeMap<u64, u64> = metadata
      .thing_dataset_id_to_contiguous_id
      .iter()
      .flatten()
      .map(|(&dataset_id, &contiguous_id)| (contiguous_id, dataset_id))
      .collect();
    let reverse_id = |contiguous_id: u64| reverse.get(&contiguous_id).copied().unwrap_or(contiguous_id);

    let categories = metadata
      .thing_classes
      .iter()
      .flatten()
      .enumerate()
      .map(|(idx, name)| CocoCategory {
        id: reverse_id(idx as u64),
        name: name.clone(),
        supercategory: None,
      })
      .collect();

    let mut images = Vec::with_capacity(records.len());
    let mut annotations = Vec::new();
    for record in records {
      images.push(CocoImage {
        id: record.image_id,
        width: record.width,
        height: record.height,
        file_name: record.file_name.clone(),
      });

      for ann in &record.annotations {
        let bbox = ann.bbox_mode.to_xywh(ann.bbox).map(|x| (x * 1000.0).round() / 1000.0);
        let area = match &ann.segmentation {
          Some(Segmentation::Polygons(polygons)) => polygons.iter().map(|p| polygon_area(p)).sum(),
          Some(Segmentation::Rle(object)) => Rle::try_from(object)?.area() as f64,
          None => bbox[2] * bbox[3],
        };
        annotations.push(CocoAnnotation {
          id: annotations.len() as u64 + 1,
          image_id: record.image_id,
          category_id: reverse_id(ann.category_id),
          bbox,
          area,
          iscrowd: ann.iscrowd,
          segmentation: ann.segmentation.clone(),
          keypoints: ann.keypoints.clone(),
        });
      }
    }

    info!(
      "转换数据集 `{}`: {} 张图像, {} 个标注",
      name,
      images.len(),
      annotations.len()
    );

    let info = serde_json::json!({
      "date_created": chrono::Local::now().to_rfc3339(),
      "description": "Automatically generated COCO json file for Maskterial.",
    });

    Ok(CocoDataset {
      info: Some(info),
      images,
      annotations: (!annotations.is_empty()).then_some(annotations),
      categories,
    })
  }

  /// 写出 COCO 格式文件。`allow_cached` 为 true 且文件已存在时直接复用。
  pub fn convert_to_coco_json(
    &self,
    name: &str,
    output_file: &Path,
    allow_cached: bool,
  ) -> Result<(), CatalogError> {
    if allow_cached && output_file.exists() {
      warn!(
        "使用已缓存的 COCO 格式标注 `{}`, 如果数据集已修改请删除该缓存文件",
        output_file.display()
      );
      return Ok(());
    }

    let dataset = self.to_coco_dataset(name)?;
    if let Some(parent) = output_file.parent() {
      std::fs::create_dir_all(parent)?;
    }
    info!("缓存 COCO 格式标注到 `{}`", output_file.display());
    std::fs::write(output_file, serde_json::to_vec(&dataset)?)?;
    Ok(())
  }
}

/// 鞋带公式计算多边形面积
fn polygon_area(xy: &[f64]) -> f64 {
  let n = xy.len() / 2;
  if n < 3 {
    return 0.0;
  }
  let twice: f64 = (0..n)
    .map(|i| {
      let j = (i + 1) % n;
      xy[2 * i] * xy[2 * j + 1] - xy[2 * j] * xy[2 * i + 1]
    })
    .sum();
  twice.abs() / 2.0
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::coco::CocoIndex;

  struct ScratchDir(PathBuf);

  impl ScratchDir {
    fn create(name: &str) -> ScratchDir {
      let dir = std::env::temp_dir().join(format!(
        "maskterial-{}-{}-{:?}",
        name,
        std::process::id(),
        std::thread::current().id(),
      ));
      let _ = std::fs::remove_dir_all(&dir);
      ScratchDir(dir)
    }
  }

  impl Drop for ScratchDir {
    fn drop(&mut self) {
      let _ = std::fs::remove_dir_all(&self.0);
    }
  }

  fn record(image_id: u64, annotations: Vec<RecordAnnotation>) -> DatasetRecord {
    DatasetRecord {
      file_name: format!("{image_id}.png"),
      image_id,
      height: 32,
      width: 32,
      annotations,
    }
  }

  fn annotation(category_id: u64, segmentation: Option<Segmentation>) -> RecordAnnotation {
    RecordAnnotation {
      bbox: [2.0, 2.0, 6.0, 5.0],
      bbox_mode: BoxMode::XyxyAbs,
      category_id,
      segmentation,
      iscrowd: 0,
      keypoints: None,
    }
  }

  fn catalog() -> DatasetCatalog {
    let mut catalog = DatasetCatalog::new();
    let metadata = DatasetMetadata {
      json_file: None,
      thing_classes: Some(vec!["monolayer".into(), "bilayer".into()]),
      thing_dataset_id_to_contiguous_id: Some(BTreeMap::from([(1, 0), (2, 1)])),
    };
    let records = vec![
      record(1, vec![
        annotation(0, None),
        annotation(1, Some(Segmentation::Polygons(vec![vec![0.0, 0.0, 0.0, 4.0, 4.0, 4.0, 4.0, 0.0]]))),
      ]),
      record(2, vec![]),
    ];
    catalog.register("flakes_val", metadata, Some(records)).unwrap();
    catalog
  }

  #[test]
  fn conversion_restores_dataset_ids_and_areas() {
    let dataset = catalog().to_coco_dataset("flakes_val").unwrap();
    let ids: Vec<u64> = dataset.categories.iter().map(|c| c.id).collect();
    assert_eq!(ids, vec![1, 2]);

    let anns = dataset.annotations.unwrap();
    assert_eq!(anns.len(), 2);
    assert_eq!(anns[0].id, 1);
    assert_eq!(anns[0].category_id, 1);
    assert_eq!(anns[0].bbox, [2.0, 2.0, 4.0, 3.0]);
    assert_eq!(anns[0].area, 12.0);
    assert_eq!(anns[1].category_id, 2);
    assert_eq!(anns[1].area, 16.0);
    assert_eq!(dataset.images.len(), 2);
  }

  #[test]
  fn dataset_without_annotations_omits_key() {
    let mut catalog = DatasetCatalog::new();
    catalog
      .register("empty", DatasetMetadata::default(), Some(vec![record(1, vec![])]))
      .unwrap();
    let json = serde_json::to_value(catalog.to_coco_dataset("empty").unwrap()).unwrap();
    assert!(json.get("annotations").is_none());
  }

  #[test]
  fn cached_file_is_reused_only_when_allowed() {
    let dir = ScratchDir::create("catalog");
    let path = dir.0.join("flakes_val_coco_format.json");

    let catalog = catalog();
    catalog.convert_to_coco_json("flakes_val", &path, true).unwrap();
    let index = CocoIndex::from_json_file(&path).unwrap();
    assert_eq!(index.annotations().len(), 2);

    std::fs::write(&path, "{\"images\": []}").unwrap();
    catalog.convert_to_coco_json("flakes_val", &path, true).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), "{\"images\": []}");

    catalog.convert_to_coco_json("flakes_val", &path, false).unwrap();
    let index = CocoIndex::from_json_file(&path).unwrap();
    assert_eq!(index.img_ids(), vec![1, 2]);
  }

  #[test]
  fn unknown_dataset_is_reported() {
    let catalog = DatasetCatalog::new();
    assert!(matches!(
      catalog.metadata("missing"),
      Err(CatalogError::NotRegistered(_))
    ));
    assert!(!catalog.contains("missing"));
  }
}
