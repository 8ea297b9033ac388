// 该文件是 Maskterial 项目的一部分。
// tests/task.rs - 推理任务集成测试
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
  cell::Cell,
  collections::BTreeMap,
  path::{Path, PathBuf},
  rc::Rc,
  time::Duration,
};

use maskterial::{
  Flake,
  catalog::{DatasetCatalog, DatasetMetadata, DatasetRecord, RecordAnnotation},
  coco::BoxMode,
  eval::EvalResults,
  evaluator::DatasetEvaluator,
  mask::Mask,
  model::{Instances, Model, ModelOutput},
  rle::Segmentation,
  task::{InferenceOnDataset, Task, evaluate_on_dataset},
};

fn init_tracing() {
  let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

struct SleepyModel(Duration);

impl Model for SleepyModel {
  type Input = u64;
  type Output = u64;
  type Error = std::io::Error;

  fn infer(&self, input: &u64) -> Result<u64, Self::Error> {
    std::thread::sleep(self.0);
    Ok(*input * 2)
  }
}

struct CountingEvaluator {
  processed: Rc<Cell<usize>>,
}

impl DatasetEvaluator<u64, u64> for CountingEvaluator {
  type Error = std::io::Error;

  fn reset(&mut self) {
    self.processed.set(0);
  }

  fn process(&mut self, input: &u64, output: &u64) -> Result<(), Self::Error> {
    assert_eq!(*output, *input * 2);
    self.processed.set(self.processed.get() + 1);
    Ok(())
  }

  fn evaluate(&mut self) -> Result<EvalResults, Self::Error> {
    Ok(EvalResults::new())
  }
}

fn batches(n: u64) -> std::vec::IntoIter<u64> {
  (0..n).collect::<Vec<_>>().into_iter()
}

#[test]
fn every_batch_is_processed_without_time_limit() {
  init_tracing();
  let processed = Rc::new(Cell::new(0));
  let evaluator = CountingEvaluator {
    processed: processed.clone(),
  };
  let results = InferenceOnDataset::default()
    .run_task(batches(12), SleepyModel(Duration::ZERO), evaluator)
    .unwrap();
  assert_eq!(results, Some(EvalResults::new()));
  assert_eq!(processed.get(), 12);
}

#[test]
fn inference_stops_when_eta_exceeds_limit() {
  init_tracing();
  let processed = Rc::new(Cell::new(0));
  let evaluator = CountingEvaluator {
    processed: processed.clone(),
  };
  let results = InferenceOnDataset::default()
    .with_max_time(Some(Duration::ZERO))
    .with_num_warmup(Some(1))
    .run_task(batches(30), SleepyModel(Duration::from_millis(50)), evaluator)
    .unwrap();
  assert_eq!(results, None);
  assert!(processed.get() < 30);
}

/// 测试用临时目录，离开作用域时删除
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
    std::fs::create_dir_all(&dir).unwrap();
    ScratchDir(dir)
  }
}

impl std::ops::Deref for ScratchDir {
  type Target = Path;

  fn deref(&self) -> &Path {
    self.0.as_path()
  }
}

impl Drop for ScratchDir {
  fn drop(&mut self) {
    let _ = std::fs::remove_dir_all(&self.0);
  }
}

fn square_mask() -> Mask {
  Mask::from_fn(64, 64, |r, c| (10..30).contains(&r) && (10..30).contains(&c))
}

/// 把每张图像的真值掩码原样作为单层薄片输出
struct OracleModel;

impl Model for OracleModel {
  type Input = Vec<DatasetRecord>;
  type Output = Vec<ModelOutput>;
  type Error = std::io::Error;

  fn infer(&self, input: &Vec<DatasetRecord>) -> Result<Vec<ModelOutput>, Self::Error> {
    input
      .iter()
      .map(|_| {
        let flake = Flake::builder(square_mask())
          .false_positive_probability(0.1)
          .build()
          .map_err(std::io::Error::other)?;
        let instances = Instances::from_flakes(&[flake]).map_err(std::io::Error::other)?;
        Ok(ModelOutput {
          instances: Some(instances),
          proposals: None,
        })
      })
      .collect()
  }
}

#[test]
fn oracle_model_scores_full_segm_ap() {
  init_tracing();
  let dir = ScratchDir::create("oracle");

  let records: Vec<DatasetRecord> = (1..=3)
    .map(|image_id| DatasetRecord {
      file_name: format!("{image_id}.png"),
      image_id,
      height: 64,
      width: 64,
      annotations: vec![RecordAnnotation {
        bbox: [10.0, 10.0, 30.0, 30.0],
        bbox_mode: BoxMode::XyxyAbs,
        category_id: 0,
        segmentation: Some(Segmentation::Rle(square_mask().to_rle().to_object())),
        iscrowd: 0,
        keypoints: None,
      }],
    })
    .collect();
  let metadata = DatasetMetadata {
    json_file: Some(dir.join("flakes_val_coco_format.json")),
    thing_classes: Some(vec!["monolayer".to_string()]),
    thing_dataset_id_to_contiguous_id: Some(BTreeMap::from([(1, 0)])),
  };

  let mut catalog = DatasetCatalog::new();
  catalog
    .register("flakes_val", metadata, Some(records))
    .unwrap();
  catalog
    .convert_to_coco_json("flakes_val", &dir.join("flakes_val_coco_format.json"), false)
    .unwrap();

  let results = evaluate_on_dataset(&catalog, "flakes_val", OracleModel, None)
    .unwrap()
    .unwrap();
  let segm = &results["segm"];
  assert_eq!(segm.get("AP"), Some(100.0));
  assert_eq!(segm.get("AP50,0-100"), Some(100.0));
  assert_eq!(segm.get("AR75"), Some(100.0));
  assert!(segm.get("AP,100-200").unwrap().is_nan());
}
