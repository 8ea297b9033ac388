// 该文件是 Maskterial 项目的一部分。
// src/evaluator.rs - 薄片 COCO 评估器
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
  collections::{BTreeSet, HashMap},
  path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  catalog::{DatasetCatalog, DatasetMetadata},
  coco::{BoxMode, CocoIndex, CocoResult},
  comm::{Communicator, LocalCommunicator},
  eval::{AREA_LABELS, EvalError, EvalResults, FlakeCocoEval, IouType, MetricTable},
  model::{ImageRecord, ModelOutput, Proposals},
  rle::bbox_iou,
  table::create_small_table,
};

const FLAKE_COCO_SCHEME: &str = "flake-coco";
const DEFAULT_MAX_DETS: [usize; 3] = [1, 10, 100];

/// 单张图像的预测，至少包含实例或候选框之一
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
  pub image_id: u64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub instances: Option<Vec<CocoResult>>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub proposals: Option<Proposals>,
}

/// 流式推理中的评估器
pub trait DatasetEvaluator<Batch, Output> {
  type Error;

  fn reset(&mut self);
  fn process(&mut self, inputs: &Batch, outputs: &Output) -> Result<(), Self::Error>;
  fn evaluate(&mut self) -> Result<EvalResults, Self::Error>;
}

/// `box_proposals.json` 的内容
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProposalDump {
  pub boxes: Vec<Vec<[f64; 4]>>,
  pub objectness_logits: Vec<Vec<f64>>,
  pub ids: Vec<u64>,
  pub bbox_mode: BoxMode,
}

pub struct FlakeCocoEvaluatorBuilder {
  dataset_name: String,
  tasks: Option<Vec<IouType>>,
  distributed: bool,
  output_dir: Option<PathBuf>,
  max_dets_per_image: Option<usize>,
  kpt_oks_sigmas: Vec<f64>,
  allow_cached_coco: bool,
  communicator: Option<Box<dyn Communicator<Vec<Prediction>>>>,
}

impl FromUrlWithScheme for FlakeCocoEvaluatorBuilder {
  const SCHEME: &'static str = FLAKE_COCO_SCHEME;
}

/// `flake-coco:///<dataset>?tasks=segm,bbox&output_dir=/p&max_dets=100&distributed=false&allow_cached=true&kpt_oks_sigmas=0.1,0.2`
impl FromUrl for FlakeCocoEvaluatorBuilder {
  type Error = EvalError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      error!(
        "URI 方案不匹配: 期望 '{}', 实际为 '{}'",
        Self::SCHEME,
        url.scheme()
      );
      return Err(EvalError::SchemeMismatch {
        expected: Self::SCHEME,
        found: url.scheme().to_string(),
      });
    }

    let dataset_name = match url.host_str() {
      Some(host) if !host.is_empty() => host.to_string(),
      _ => url.path().trim_start_matches('/').to_string(),
    };
    if dataset_name.is_empty() {
      return Err(EvalError::InvalidConfig("dataset", "数据集名称为空".to_string()));
    }

    let query_pairs: HashMap<_, _> = url.query_pairs().collect();
    let mut builder = FlakeCocoEvaluatorBuilder::new(dataset_name);

    if let Some(tasks) = query_pairs.get("tasks") {
      let tasks = tasks
        .split(',')
        .filter(|t| !t.is_empty())
        .map(str::parse)
        .collect::<Result<Vec<IouType>, _>>()?;
      builder = builder.tasks(tasks);
    }
    if let Some(v) = query_pairs.get("distributed") {
      builder = builder.distributed(parse_value("distributed", v)?);
    }
    if let Some(v) = query_pairs.get("output_dir") {
      builder = builder.output_dir(v.to_string());
    }
    if let Some(v) = query_pairs.get("max_dets") {
      builder = builder.max_dets_per_image(parse_value("max_dets", v)?);
    }
    if let Some(v) = query_pairs.get("allow_cached") {
      builder = builder.allow_cached_coco(parse_value("allow_cached", v)?);
    }
    if let Some(v) = query_pairs.get("kpt_oks_sigmas") {
      let sigmas = v
        .split(',')
        .filter(|s| !s.is_empty())
        .map(|s| parse_value("kpt_oks_sigmas", s))
        .collect::<Result<Vec<f64>, _>>()?;
      builder = builder.kpt_oks_sigmas(sigmas);
    }

    debug!("评估器配置: {}", url);
    Ok(builder)
  }
}

fn parse_value<T: std::str::FromStr>(key: &'static str, value: &str) -> Result<T, EvalError>
where
  T::Err: std::fmt::Display,
{
  value
    .parse()
    .map_err(|e: T::Err| EvalError::InvalidConfig(key, format!("`{}`: {}", value, e)))
}

impl FlakeCocoEvaluatorBuilder {
  pub fn new(dataset_name: impl Into<String>) -> Self {
    Self {
      dataset_name: dataset_name.into(),
      tasks: None,
      distributed: true,
      output_dir: None,
      max_dets_per_image: None,
      kpt_oks_sigmas: Vec::new(),
      allow_cached_coco: true,
      communicator: None,
    }
  }

  pub fn dataset_name(&self) -> &str {
    &self.dataset_name
  }

  /// 缺省时由预测内容推断
  pub fn tasks(mut self, tasks: Vec<IouType>) -> Self {
    self.tasks = Some(tasks);
    self
  }

  pub fn distributed(mut self, distributed: bool) -> Self {
    self.distributed = distributed;
    self
  }

  pub fn output_dir(mut self, output_dir: impl Into<PathBuf>) -> Self {
    self.output_dir = Some(output_dir.into());
    self
  }

  /// maxDets 变为 `[1, 10, n]`
  pub fn max_dets_per_image(mut self, max_dets: usize) -> Self {
    self.max_dets_per_image = Some(max_dets);
    self
  }

  pub fn kpt_oks_sigmas(mut self, sigmas: Vec<f64>) -> Self {
    self.kpt_oks_sigmas = sigmas;
    self
  }

  pub fn allow_cached_coco(mut self, allow: bool) -> Self {
    self.allow_cached_coco = allow;
    self
  }

  pub fn communicator(mut self, communicator: impl Communicator<Vec<Prediction>> + 'static) -> Self {
    self.communicator = Some(Box::new(communicator));
    self
  }

  pub fn build(self, catalog: &DatasetCatalog) -> Result<FlakeCocoEvaluator, EvalError> {
    let mut metadata = catalog.metadata(&self.dataset_name)?.clone();

    let json_file = match metadata.json_file.clone() {
      Some(path) => path,
      None => {
        let output_dir = self
          .output_dir
          .as_ref()
          .ok_or_else(|| EvalError::MissingOutputDir(self.dataset_name.clone()))?;
        info!("尝试将数据集 `{}` 转换为 COCO 格式 ...", self.dataset_name);
        let cache_path = output_dir.join(format!("{}_coco_format.json", self.dataset_name));
        catalog.convert_to_coco_json(&self.dataset_name, &cache_path, self.allow_cached_coco)?;
        metadata.json_file = Some(cache_path.clone());
        cache_path
      }
    };

    let coco = CocoIndex::from_json_file(&json_file)?;
    // 测试集的标注文件不含 annotations
    let do_evaluation = coco.has_annotations();

    let max_dets = match self.max_dets_per_image {
      Some(n) => vec![1, 10, n],
      None => DEFAULT_MAX_DETS.to_vec(),
    };

    Ok(FlakeCocoEvaluator {
      dataset_name: self.dataset_name,
      tasks: self.tasks,
      distributed: self.distributed,
      output_dir: self.output_dir,
      max_dets,
      kpt_oks_sigmas: self.kpt_oks_sigmas,
      metadata,
      coco,
      do_evaluation,
      communicator: self
        .communicator
        .unwrap_or_else(|| Box::new(LocalCommunicator)),
      predictions: Vec::new(),
    })
  }
}

/// 以薄片面积分段计算 AP/AR 的 COCO 评估器，也可评估候选框召回
pub struct FlakeCocoEvaluator {
  dataset_name: String,
  tasks: Option<Vec<IouType>>,
  distributed: bool,
  output_dir: Option<PathBuf>,
  max_dets: Vec<usize>,
  kpt_oks_sigmas: Vec<f64>,
  metadata: DatasetMetadata,
  coco: CocoIndex,
  do_evaluation: bool,
  communicator: Box<dyn Communicator<Vec<Prediction>>>,
  predictions: Vec<Prediction>,
}

impl FlakeCocoEvaluator {
  pub fn dataset_name(&self) -> &str {
    &self.dataset_name
  }

  pub fn metadata(&self) -> &DatasetMetadata {
    &self.metadata
  }

  pub fn coco(&self) -> &CocoIndex {
    &self.coco
  }

  pub fn max_dets(&self) -> &[usize] {
    &self.max_dets
  }

  pub fn predictions(&self) -> &[Prediction] {
    &self.predictions
  }

  pub fn reset(&mut self) {
    self.predictions.clear();
  }

  /// 记录一批输入对应的模型输出，没有实例也没有候选框的图像不会被记录
  pub fn process<R: ImageRecord>(&mut self, inputs: &[R], outputs: &[ModelOutput]) {
    for (input, output) in inputs.iter().zip(outputs) {
      let image_id = input.image_id();
      let prediction = Prediction {
        image_id,
        instances: output
          .instances
          .as_ref()
          .map(|instances| instances.to_coco_results(image_id)),
        proposals: output.proposals.clone(),
      };
      if prediction.instances.is_some() || prediction.proposals.is_some() {
        self.predictions.push(prediction);
      }
    }
  }

  /// 汇总预测并计算指标。`img_ids` 为 `None` 时评估整个数据集。
  pub fn evaluate(&mut self, img_ids: Option<&[u64]>) -> Result<EvalResults, EvalError> {
    let predictions: Vec<Prediction> = if self.distributed {
      self.communicator.synchronize();
      let gathered = self.communicator.gather(self.predictions.clone(), 0);
      if !self.communicator.is_main_process() {
        return Ok(EvalResults::new());
      }
      gathered.into_iter().flatten().collect()
    } else {
      self.predictions.clone()
    };

    if predictions.is_empty() {
      warn!("[FlakeCocoEvaluator] 没有收到有效的预测结果");
      return Ok(EvalResults::new());
    }

    if let Some(output_dir) = &self.output_dir {
      std::fs::create_dir_all(output_dir)?;
      let file_path = output_dir.join("instances_predictions.json");
      write_json(&file_path, &predictions)?;
    }

    let mut results = EvalResults::new();
    if predictions[0].proposals.is_some() {
      self.eval_box_proposals(&predictions, &mut results)?;
    }
    if predictions[0].instances.is_some() {
      self.eval_predictions(&predictions, img_ids, &mut results)?;
    }
    Ok(results)
  }

  fn eval_predictions(
    &self,
    predictions: &[Prediction],
    img_ids: Option<&[u64]>,
    results: &mut EvalResults,
  ) -> Result<(), EvalError> {
    info!("准备 COCO 格式的结果 ...");
    let mut coco_results: Vec<CocoResult> = predictions
      .iter()
      .filter_map(|p| p.instances.as_ref())
      .flatten()
      .cloned()
      .collect();
    let mut tasks = self
      .tasks
      .clone()
      .unwrap_or_else(|| tasks_from_predictions(&coco_results));
    tasks.sort_by_key(|t| t.as_str());
    tasks.dedup();

    if let Some(mapping) = &self.metadata.thing_dataset_id_to_contiguous_id {
      remap_category_ids(&mut coco_results, mapping)?;
    }

    if let Some(output_dir) = &self.output_dir {
      let file_path = output_dir.join("coco_instances_results.json");
      info!("保存结果到 {}", file_path.display());
      write_json(&file_path, &coco_results)?;
    }

    if !self.do_evaluation {
      info!("Annotations are not available for evaluation.");
      return Ok(());
    }

    info!("使用 FlakeCOCO API 评估预测结果 ...");
    let class_names = self.metadata.thing_classes.as_deref();
    for task in tasks {
      let table = if coco_results.is_empty() {
        // 空结果无法载入
        derive_coco_results(None, task, class_names)?
      } else {
        let coco_eval = self.evaluate_predictions_on_coco(&coco_results, task, img_ids)?;
        derive_coco_results(Some(&coco_eval), task, class_names)?
      };
      results.insert(task.to_string(), table);
    }
    Ok(())
  }

  fn evaluate_predictions_on_coco(
    &self,
    coco_results: &[CocoResult],
    iou_type: IouType,
    img_ids: Option<&[u64]>,
  ) -> Result<FlakeCocoEval<'_>, EvalError> {
    if iou_type == IouType::Keypoints && !self.kpt_oks_sigmas.is_empty() {
      let predicted = coco_results
        .first()
        .and_then(|r| r.keypoints.as_ref())
        .map_or(0, |k| k.len() / 3);
      let ground_truth = self
        .coco
        .annotations()
        .first()
        .and_then(|a| a.keypoints.as_ref())
        .map_or(0, |k| k.len() / 3);
      let sigmas = self.kpt_oks_sigmas.len();
      if predicted != sigmas || ground_truth != sigmas {
        return Err(EvalError::KeypointSigmaMismatch {
          predicted,
          ground_truth,
          sigmas,
        });
      }
    }

    // segm 的检测面积取自掩码，结果中的框不参与计算
    let mut coco_eval = FlakeCocoEval::new(&self.coco, coco_results, iou_type)?;
    coco_eval.params_mut().max_dets = self.max_dets.clone();
    if let Some(img_ids) = img_ids {
      coco_eval.params_mut().img_ids = img_ids.to_vec();
    }
    coco_eval.evaluate()?;
    coco_eval.accumulate()?;
    coco_eval.summarize()?;
    Ok(coco_eval)
  }

  fn eval_box_proposals(&self, predictions: &[Prediction], results: &mut EvalResults) -> Result<(), EvalError> {
    if let Some(output_dir) = &self.output_dir {
      let mut dump = ProposalDump {
        boxes: Vec::with_capacity(predictions.len()),
        objectness_logits: Vec::with_capacity(predictions.len()),
        ids: Vec::with_capacity(predictions.len()),
        bbox_mode: BoxMode::XyxyAbs,
      };
      for prediction in predictions {
        let proposals = prediction.proposals.clone().unwrap_or_default();
        dump.ids.push(prediction.image_id);
        dump.boxes.push(proposals.proposal_boxes);
        dump.objectness_logits.push(proposals.objectness_logits);
      }
      write_json(&output_dir.join("box_proposals.json"), &dump)?;
    }

    if !self.do_evaluation {
      info!("Annotations are not available for evaluation.");
      return Ok(());
    }

    info!("评估候选框 ...");
    let mut table = MetricTable::new();
    for limit in [100, 1000] {
      for (area, suffix) in [
        (ProposalArea::All, ""),
        (ProposalArea::Small, "s"),
        (ProposalArea::Medium, "m"),
        (ProposalArea::Large, "l"),
      ] {
        let stats = evaluate_box_proposals(predictions, &self.coco, area, Some(limit));
        table.insert(format!("AR{}@{}", suffix, limit), stats.ar * 100.0);
      }
    }
    info!("候选框指标: \n{}", create_small_table(&table));
    results.insert("box_proposals".to_string(), table);
    Ok(())
  }
}

impl<R: ImageRecord> DatasetEvaluator<Vec<R>, Vec<ModelOutput>> for FlakeCocoEvaluator {
  type Error = EvalError;

  fn reset(&mut self) {
    FlakeCocoEvaluator::reset(self);
  }

  fn process(&mut self, inputs: &Vec<R>, outputs: &Vec<ModelOutput>) -> Result<(), Self::Error> {
    FlakeCocoEvaluator::process(self, inputs, outputs);
    Ok(())
  }

  fn evaluate(&mut self) -> Result<EvalResults, Self::Error> {
    FlakeCocoEvaluator::evaluate(self, None)
  }
}

fn write_json<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<(), EvalError> {
  debug!("写入 {}", path.display());
  std::fs::write(path, serde_json::to_vec(value)?)?;
  Ok(())
}

/// 由结果字段推断评估任务：总是包含 `bbox`
pub fn tasks_from_predictions(results: &[CocoResult]) -> Vec<IouType> {
  let mut tasks = BTreeSet::from([IouType::Bbox]);
  for result in results {
    if result.segmentation.is_some() {
      tasks.insert(IouType::Segm);
    }
    if result.keypoints.is_some() {
      tasks.insert(IouType::Keypoints);
    }
  }
  tasks.into_iter().collect()
}

/// 将连续类别编号还原为数据集类别编号
pub fn remap_category_ids(
  results: &mut [CocoResult],
  dataset_id_to_contiguous_id: &std::collections::BTreeMap<u64, u64>,
) -> Result<(), EvalError> {
  let num_classes = dataset_id_to_contiguous_id.len();
  let contiguous: BTreeSet<u64> = dataset_id_to_contiguous_id.values().copied().collect();
  let is_contiguous = contiguous.len() == num_classes
    && contiguous.first() == Some(&0)
    && contiguous.last() == Some(&(num_classes as u64 - 1));
  if !is_contiguous {
    return Err(EvalError::NonContiguousIds(num_classes));
  }

  let reverse: HashMap<u64, u64> = dataset_id_to_contiguous_id
    .iter()
    .map(|(&dataset_id, &contiguous_id)| (contiguous_id, dataset_id))
    .collect();
  for result in results.iter_mut() {
    let class = result.category_id;
    result.category_id = *reverse
      .get(&class)
      .ok_or(EvalError::CategoryOutOfRange { class, num_classes })?;
  }
  Ok(())
}

/// 30 项汇总指标的名称，与 [`FlakeCocoEval::summarize`] 的顺序一致
pub fn metric_names() -> Vec<String> {
  let mut names = Vec::with_capacity(30);
  for iou in ["50", "75", ""] {
    for mode in ["AP", "AR"] {
      for (area_idx, label) in AREA_LABELS.iter().enumerate() {
        names.push(metric_key(mode, iou, area_idx, label));
      }
    }
  }
  names
}

fn metric_key(mode: &str, iou: &str, area_idx: usize, label: &str) -> String {
  if area_idx > 0 {
    format!("{}{},{}", mode, iou, label)
  } else {
    format!("{}{}", mode, iou)
  }
}

fn round2(x: f64) -> f64 {
  (x * 100.0).round() / 100.0
}

/// 由汇总结果导出指标表，`None` 表示模型没有任何预测。
///
/// 指标乘以 100 并保留两位小数，无法计算的指标为 NaN。
/// 多于一个类别名时追加逐类别指标，例如 `AP50,100-200_monolayer`。
pub fn derive_coco_results(
  coco_eval: Option<&FlakeCocoEval<'_>>,
  iou_type: IouType,
  class_names: Option<&[String]>,
) -> Result<MetricTable, EvalError> {
  let metrics = metric_names();

  let Some(coco_eval) = coco_eval else {
    warn!("模型没有给出任何预测!");
    return Ok(metrics.into_iter().map(|m| (m, f64::NAN)).collect());
  };

  let mut results: MetricTable = metrics
    .into_iter()
    .zip(coco_eval.stats())
    .map(|(m, &s)| (m, if s >= 0.0 { round2(s * 100.0) } else { f64::NAN }))
    .collect();
  info!(
    "{} 评估结果: \n{}",
    iou_type,
    create_small_table(&results)
  );
  if results.iter().any(|(_, v)| !v.is_finite()) {
    info!("部分指标无法计算, 显示为 NaN");
  }

  let Some(class_names) = class_names.filter(|names| names.len() > 1) else {
    return Ok(results);
  };

  for mode in ["AP", "AR"] {
    for (area_idx, label) in AREA_LABELS.iter().enumerate() {
      for (iou, iou_thr) in [("50", Some(0.5)), ("75", Some(0.75)), ("", None)] {
        for (class_index, class_name) in class_names.iter().enumerate() {
          let value = if mode == "AP" {
            coco_eval.mean_precision(iou_thr, Some(class_index), area_idx)?
          } else {
            coco_eval.mean_recall(iou_thr, Some(class_index), area_idx)?
          };
          let key = format!("{}_{}", metric_key(mode, iou, area_idx, label), class_name);
          results.insert(key, if value > -1.0 { round2(value * 100.0) } else { f64::NAN });
        }
      }
    }
  }
  Ok(results)
}

/// 候选框评估的面积段（像素）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProposalArea {
  All,
  Small,
  Medium,
  Large,
}

impl ProposalArea {
  pub fn range(self) -> [f64; 2] {
    match self {
      ProposalArea::All => [0.0, 1e10],
      ProposalArea::Small => [0.0, 32.0 * 32.0],
      ProposalArea::Medium => [32.0 * 32.0, 96.0 * 96.0],
      ProposalArea::Large => [96.0 * 96.0, 1e10],
    }
  }
}

#[derive(Debug, Clone)]
pub struct ProposalRecall {
  /// 各阈值召回的均值，没有正样本时为 NaN
  pub ar: f64,
  pub recalls: Vec<f64>,
  pub thresholds: Vec<f64>,
  pub gt_overlaps: Vec<f64>,
  pub num_pos: usize,
}

/// 候选框召回：每轮取覆盖最好的真值与对应候选框，记录后将二者移出
pub fn evaluate_box_proposals(
  predictions: &[Prediction],
  coco: &CocoIndex,
  area: ProposalArea,
  limit: Option<usize>,
) -> ProposalRecall {
  let [lo, hi] = area.range();
  let mut gt_overlaps = Vec::new();
  let mut num_pos = 0usize;

  for prediction in predictions {
    let Some(proposals) = &prediction.proposals else {
      continue;
    };
    // (框, 目标性分数)，长度不一致时按较短者截断
    let mut ranked: Vec<([f64; 4], f64)> = proposals
      .proposal_boxes
      .iter()
      .copied()
      .zip(proposals.objectness_logits.iter().copied())
      .collect();
    ranked.sort_by(|a, b| b.1.total_cmp(&a.1));

    let anns: Vec<_> = coco
      .annotations_for_image(prediction.image_id)
      .filter(|a| a.iscrowd == 0)
      .collect();
    if anns.is_empty() || ranked.is_empty() {
      continue;
    }

    let gt_boxes: Vec<[f64; 4]> = anns
      .iter()
      .filter(|a| a.area >= lo && a.area <= hi)
      .map(|a| a.bbox)
      .collect();
    num_pos += gt_boxes.len();
    if gt_boxes.is_empty() {
      continue;
    }

    if let Some(limit) = limit {
      ranked.truncate(limit);
    }
    let boxes: Vec<[f64; 4]> = ranked
      .iter()
      .map(|&(bbox, _)| BoxMode::XyxyAbs.to_xywh(bbox))
      .collect();
    let mut overlaps = bbox_iou(&boxes, &gt_boxes, &[]);

    let mut covered = vec![0.0; gt_boxes.len()];
    for slot in covered.iter_mut().take(boxes.len().min(gt_boxes.len())) {
      // (候选框, 真值, 交并比)
      let mut best: Option<(usize, usize, f64)> = None;
      for g in 0..gt_boxes.len() {
        let mut col_best: Option<(usize, f64)> = None;
        for (p, row) in overlaps.iter().enumerate() {
          if col_best.is_none_or(|(_, v)| row[g] > v) {
            col_best = Some((p, row[g]));
          }
        }
        if let Some((p, v)) = col_best {
          if best.is_none_or(|(_, _, b)| v > b) {
            best = Some((p, g, v));
          }
        }
      }
      let Some((box_ind, gt_ind, ovr)) = best else {
        break;
      };
      *slot = ovr;
      for v in overlaps[box_ind].iter_mut() {
        *v = -1.0;
      }
      for row in overlaps.iter_mut() {
        row[gt_ind] = -1.0;
      }
    }
    gt_overlaps.extend(covered);
  }

  gt_overlaps.sort_by(f64::total_cmp);
  let thresholds: Vec<f64> = (0..10).map(|i| 0.5 + 0.05 * i as f64).collect();
  let recalls: Vec<f64> = thresholds
    .iter()
    .map(|&t| gt_overlaps.iter().filter(|&&o| o >= t).count() as f64 / num_pos as f64)
    .collect();
  let ar = recalls.iter().sum::<f64>() / recalls.len() as f64;

  ProposalRecall {
    ar,
    recalls,
    thresholds,
    gt_overlaps,
    num_pos,
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::collections::BTreeMap;

  fn result(category_id: u64) -> CocoResult {
    CocoResult {
      image_id: 1,
      category_id,
      bbox: Some([0.0, 0.0, 1.0, 1.0]),
      score: 0.5,
      segmentation: None,
      keypoints: None,
    }
  }

  #[test]
  fn metric_names_follow_summary_order() {
    let names = metric_names();
    assert_eq!(names.len(), 30);
    assert_eq!(names[0], "AP50");
    assert_eq!(names[1], "AP50,0-100");
    assert_eq!(names[5], "AR50");
    assert_eq!(names[9], "AR50,400-inf");
    assert_eq!(names[10], "AP75");
    assert_eq!(names[20], "AP");
    assert_eq!(names[29], "AR,400-inf");
  }

  #[test]
  fn tasks_are_inferred_from_fields() {
    let mut with_mask = result(0);
    with_mask.segmentation = Some(crate::mask::Mask::new(2, 2).to_rle().to_object());
    assert_eq!(tasks_from_predictions(&[result(0)]), vec![IouType::Bbox]);
    assert_eq!(
      tasks_from_predictions(&[result(0), with_mask]),
      vec![IouType::Bbox, IouType::Segm]
    );
  }

  #[test]
  fn remap_restores_dataset_ids() {
    let mapping = BTreeMap::from([(3, 0), (7, 1)]);
    let mut results = vec![result(0), result(1)];
    remap_category_ids(&mut results, &mapping).unwrap();
    assert_eq!(results[0].category_id, 3);
    assert_eq!(results[1].category_id, 7);
  }

  #[test]
  fn remap_rejects_out_of_range_class() {
    let mapping = BTreeMap::from([(3, 0), (7, 1)]);
    let mut results = vec![result(2)];
    assert!(matches!(
      remap_category_ids(&mut results, &mapping),
      Err(EvalError::CategoryOutOfRange {
        class: 2,
        num_classes: 2
      })
    ));
  }

  #[test]
  fn remap_rejects_gaps() {
    let mapping = BTreeMap::from([(3, 0), (7, 2)]);
    assert!(matches!(
      remap_category_ids(&mut [], &mapping),
      Err(EvalError::NonContiguousIds(2))
    ));
  }

  #[test]
  fn missing_predictions_give_nan_metrics() {
    let table = derive_coco_results(None, IouType::Segm, None).unwrap();
    assert_eq!(table.len(), 30);
    assert!(table.iter().all(|(_, v)| v.is_nan()));
  }

  #[test]
  fn url_configures_every_option() {
    let url = Url::parse(
      "flake-coco:///flakes_val?tasks=segm,bbox&output_dir=/tmp/out&max_dets=50&distributed=false&allow_cached=false&kpt_oks_sigmas=0.1,0.2",
    )
    .unwrap();
    let builder = FlakeCocoEvaluatorBuilder::from_url(&url).unwrap();
    assert_eq!(builder.dataset_name(), "flakes_val");
    assert_eq!(builder.tasks, Some(vec![IouType::Segm, IouType::Bbox]));
    assert!(!builder.distributed);
    assert_eq!(builder.output_dir, Some(PathBuf::from("/tmp/out")));
    assert_eq!(builder.max_dets_per_image, Some(50));
    assert!(!builder.allow_cached_coco);
    assert_eq!(builder.kpt_oks_sigmas, vec![0.1, 0.2]);
  }

  #[test]
  fn url_defaults_and_errors() {
    let builder = FlakeCocoEvaluatorBuilder::from_url(&Url::parse("flake-coco://flakes_val").unwrap()).unwrap();
    assert_eq!(builder.dataset_name(), "flakes_val");
    assert!(builder.distributed);
    assert!(builder.allow_cached_coco);
    assert_eq!(builder.tasks, None);

    assert!(matches!(
      FlakeCocoEvaluatorBuilder::from_url(&Url::parse("coco:///flakes_val").unwrap()),
      Err(EvalError::SchemeMismatch { .. })
    ));
    assert!(matches!(
      FlakeCocoEvaluatorBuilder::from_url(&Url::parse("flake-coco:///flakes_val?tasks=panoptic").unwrap()),
      Err(EvalError::UnsupportedTask(_))
    ));
    assert!(matches!(
      FlakeCocoEvaluatorBuilder::from_url(&Url::parse("flake-coco:///flakes_val?max_dets=many").unwrap()),
      Err(EvalError::InvalidConfig("max_dets", _))
    ));
  }

  #[test]
  fn box_proposal_recall_matches_best_boxes() {
    let dataset: crate::coco::CocoDataset = serde_json::from_str(
      r#"{
        "images": [{"id": 1, "width": 100, "height": 100}],
        "annotations": [
          {"id": 1, "image_id": 1, "category_id": 1, "bbox": [0, 0, 10, 10], "area": 100},
          {"id": 2, "image_id": 1, "category_id": 1, "bbox": [50, 50, 10, 10], "area": 100}
        ],
        "categories": [{"id": 1, "name": "monolayer"}]
      }"#,
    )
    .unwrap();
    let coco = CocoIndex::new(dataset);
    let predictions = vec![Prediction {
      image_id: 1,
      instances: None,
      proposals: Some(Proposals {
        proposal_boxes: vec![[0.0, 0.0, 10.0, 10.0], [50.0, 50.0, 60.0, 55.0]],
        objectness_logits: vec![0.1, 0.9],
      }),
    }];
    let stats = evaluate_box_proposals(&predictions, &coco, ProposalArea::All, Some(100));
    assert_eq!(stats.num_pos, 2);
    assert_eq!(stats.gt_overlaps, vec![0.5, 1.0]);
    // 0.5 只在第一个阈值上计入
    let expected = (1.0 + 0.5 * 9.0) / 10.0;
    assert!((stats.ar - expected).abs() < 1e-12);

    let large = evaluate_box_proposals(&predictions, &coco, ProposalArea::Large, Some(100));
    assert_eq!(large.num_pos, 0);
    assert!(large.ar.is_nan());
  }

  #[test]
  fn proposals_without_matching_logits_are_dropped() {
    let dataset: crate::coco::CocoDataset = serde_json::from_str(
      r#"{
        "images": [{"id": 1, "width": 100, "height": 100}],
        "annotations": [
          {"id": 1, "image_id": 1, "category_id": 1, "bbox": [0, 0, 10, 10], "area": 100}
        ],
        "categories": [{"id": 1, "name": "monolayer"}]
      }"#,
    )
    .unwrap();
    let coco = CocoIndex::new(dataset);
    let predictions = vec![Prediction {
      image_id: 1,
      instances: None,
      proposals: Some(Proposals {
        proposal_boxes: vec![[50.0, 50.0, 60.0, 60.0], [0.0, 0.0, 10.0, 10.0]],
        objectness_logits: vec![0.9],
      }),
    }];
    let stats = evaluate_box_proposals(&predictions, &coco, ProposalArea::All, None);
    assert_eq!(stats.num_pos, 1);
    assert_eq!(stats.gt_overlaps, vec![0.0]);
    assert_eq!(stats.ar, 0.0);
  }
}
