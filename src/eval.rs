// 该文件是 Maskterial 项目的一部分。
// src/eval.rs - 薄片面积分段的 COCO 评估
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

//! COCO 风格的匹配与累积。
//!
//! 匹配、排序和累积规则与 COCO API 相同，区别只在面积分段：
//! 以 nm² 为单位划分 `all`、`0-100`、`100-200`、`200-400`、`400-inf` 五段，
//! 并输出 IoU 0.50、0.75 与 0.50:0.95 平均下的 AP/AR 共 30 项。

use std::{
  collections::{BTreeMap, BTreeSet, HashMap},
  fmt,
  str::FromStr,
  time::Instant,
};

use serde::{Serialize, Serializer, ser::SerializeMap};
use thiserror::Error;
use tracing::{debug, info};

use crate::{
  coco::{CocoIndex, CocoResult},
  rle::{Rle, RleError, bbox_iou},
};

/// 像素面积到 nm² 的换算：`1 / 0.3844²`
pub const PIXELS_PER_NM2: f64 = 1.0 / (0.3844 * 0.3844);
/// 面积分段标签，顺序与 [`FlakeParams::area_rng`] 一致
pub const AREA_LABELS: [&str; 5] = ["all", "0-100", "100-200", "200-400", "400-inf"];
const AREA_MAX: f64 = 1e10;
const IOU_EPS: f64 = 1e-9;

#[derive(Error, Debug)]
pub enum EvalError {
  #[error("不支持的 IoU 类型: {0}")]
  UnsupportedIouType(String),
  #[error("数据集 `{0}` 没有 COCO 标注文件, 必须提供 output_dir 用于转换")]
  MissingOutputDir(String),
  #[error("未知的评估任务: {0}")]
  UnsupportedTask(String),
  #[error("URI 方案不匹配: 期望 `{expected}`, 实际为 `{found}`")]
  SchemeMismatch { expected: &'static str, found: String },
  #[error("配置项 `{0}` 无效: {1}")]
  InvalidConfig(&'static str, String),
  #[error("预测包含 {predicted} 个关键点, 真值包含 {ground_truth} 个, kpt_oks_sigmas 长度为 {sigmas}, 三者必须一致")]
  KeypointSigmaMismatch {
    predicted: usize,
    ground_truth: usize,
    sigmas: usize,
  },
  #[error("预测类别为 {class}, 但数据集只有 {num_classes} 个类别, 类别编号应在 [0, {num_classes}) 内")]
  CategoryOutOfRange { class: u64, num_classes: usize },
  #[error("连续类别编号必须为 0..{0}")]
  NonContiguousIds(usize),
  #[error("结果中的图像 {0} 不在真值数据集中")]
  UnknownImage(u64),
  #[error("标注或结果 {0} 缺少 {1} 字段")]
  MissingField(u64, &'static str),
  #[error("请先调用 evaluate()")]
  NotEvaluated,
  #[error("请先调用 accumulate()")]
  NotAccumulated,
  #[error("RLE 错误: {0}")]
  RleError(#[from] RleError),
  #[error("COCO 数据错误: {0}")]
  CocoError(#[from] crate::coco::CocoError),
  #[error("数据集目录错误: {0}")]
  CatalogError(#[from] crate::catalog::CatalogError),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("JSON 错误: {0}")]
  JsonError(#[from] serde_json::Error),
}

/// 评估类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IouType {
  Bbox,
  Segm,
  Keypoints,
}

impl IouType {
  pub fn as_str(&self) -> &'static str {
    match self {
      IouType::Bbox => "bbox",
      IouType::Segm => "segm",
      IouType::Keypoints => "keypoints",
    }
  }
}

impl fmt::Display for IouType {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for IouType {
  type Err = EvalError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "bbox" => Ok(IouType::Bbox),
      "segm" => Ok(IouType::Segm),
      "keypoints" => Ok(IouType::Keypoints),
      other => Err(EvalError::UnsupportedTask(other.to_string())),
    }
  }
}

/// 评估参数
#[derive(Debug, Clone, PartialEq)]
pub struct FlakeParams {
  pub img_ids: Vec<u64>,
  pub cat_ids: Vec<u64>,
  /// 0.50:0.05:0.95
  pub iou_thrs: Vec<f64>,
  /// 0.00:0.01:1.00
  pub rec_thrs: Vec<f64>,
  pub max_dets: Vec<usize>,
  /// 像素面积 `[min, max]`，闭区间
  pub area_rng: Vec<[f64; 2]>,
  pub area_rng_lbl: Vec<String>,
  pub iou_type: IouType,
}

impl FlakeParams {
  pub fn new(iou_type: IouType) -> Result<Self, EvalError> {
    if iou_type == IouType::Keypoints {
      return Err(EvalError::UnsupportedIouType(iou_type.to_string()));
    }

    let bound = |nm2: f64| (nm2 * PIXELS_PER_NM2).trunc();
    Ok(Self {
      img_ids: Vec::new(),
      cat_ids: Vec::new(),
      iou_thrs: (0..10).map(|i| 0.5 + 0.05 * i as f64).collect(),
      rec_thrs: (0..=100).map(|i| i as f64 / 100.0).collect(),
      max_dets: vec![1, 10, 100],
      area_rng: vec![
        [0.0, AREA_MAX],
        [0.0, bound(100.0)],
        [bound(100.0), bound(200.0)],
        [bound(200.0), bound(400.0)],
        [bound(400.0), AREA_MAX],
      ],
      area_rng_lbl: AREA_LABELS.iter().map(|s| s.to_string()).collect(),
      iou_type,
    })
  }

  fn iou_index(&self, thr: f64) -> Option<usize> {
    self.iou_thrs.iter().position(|&t| (t - thr).abs() < IOU_EPS)
  }
}

/// 参与匹配的真值或检测
#[derive(Debug, Clone)]
struct Instance {
  id: u64,
  image_id: u64,
  category_id: u64,
  area: f64,
  bbox: [f64; 4],
  score: f64,
  iscrowd: bool,
  ignore: bool,
  rle: Option<Rle>,
}

/// 单张图像、单个类别、单个面积段的匹配结果
#[derive(Debug, Clone)]
struct EvalImage {
  dt_scores: Vec<f64>,
  /// `[T][D]`
  dt_matched: Vec<Vec<bool>>,
  /// `[T][D]`
  dt_ignore: Vec<Vec<bool>>,
  gt_ignore: Vec<bool>,
}

/// 累积后的精度与召回，缺失数据记为 -1
#[derive(Debug, Clone)]
pub struct Accumulation {
  shape: [usize; 5],
  precision: Vec<f64>,
  recall: Vec<f64>,
  scores: Vec<f64>,
}

impl Accumulation {
  fn new(t: usize, r: usize, k: usize, a: usize, m: usize) -> Self {
    Self {
      shape: [t, r, k, a, m],
      precision: vec![-1.0; t * r * k * a * m],
      recall: vec![-1.0; t * k * a * m],
      scores: vec![-1.0; t * r * k * a * m],
    }
  }

  /// `[T, R, K, A, M]`
  pub fn shape(&self) -> [usize; 5] {
    self.shape
  }

  fn p_index(&self, t: usize, r: usize, k: usize, a: usize, m: usize) -> usize {
    let [_, rn, kn, an, mn] = self.shape;
    (((t * rn + r) * kn + k) * an + a) * mn + m
  }

  fn r_index(&self, t: usize, k: usize, a: usize, m: usize) -> usize {
    let [_, _, kn, an, mn] = self.shape;
    ((t * kn + k) * an + a) * mn + m
  }

  pub fn precision(&self, t: usize, r: usize, k: usize, a: usize, m: usize) -> f64 {
    self.precision[self.p_index(t, r, k, a, m)]
  }

  pub fn recall(&self, t: usize, k: usize, a: usize, m: usize) -> f64 {
    self.recall[self.r_index(t, k, a, m)]
  }

  pub fn score(&self, t: usize, r: usize, k: usize, a: usize, m: usize) -> f64 {
    self.scores[self.p_index(t, r, k, a, m)]
  }

  /// 选定切片中大于 -1 的条目均值，没有条目时为 -1
  fn mean_valid(&self, ap: bool, ts: &[usize], ks: &[usize], a: usize, ms: &[usize]) -> f64 {
    let rs = if ap { self.shape[1] } else { 1 };
    let mut sum = 0.0;
    let mut n = 0usize;
    for &t in ts {
      for r in 0..rs {
        for &k in ks {
          for &m in ms {
            let v = if ap {
              self.precision(t, r, k, a, m)
            } else {
              self.recall(t, k, a, m)
            };
            if v > -1.0 {
              sum += v;
              n += 1;
            }
          }
        }
      }
    }
    if n == 0 { -1.0 } else { sum / n as f64 }
  }
}

/// 带薄片面积分段的 COCO 评估器
pub struct FlakeCocoEval<'a> {
  gt: &'a CocoIndex,
  params: FlakeParams,
  dts: Vec<Instance>,
  gts: HashMap<(u64, u64), Vec<Instance>>,
  dts_by_key: HashMap<(u64, u64), Vec<usize>>,
  ious: HashMap<(u64, u64), Vec<Vec<f64>>>,
  eval_imgs: Option<Vec<Option<EvalImage>>>,
  eval: Option<Accumulation>,
  stats: Vec<f64>,
}

impl<'a> FlakeCocoEval<'a> {
  /// 载入检测结果。结果编号从 1 开始依次分配，`segm` 使用掩码面积与掩码边界框。
  pub fn new(gt: &'a CocoIndex, results: &[CocoResult], iou_type: IouType) -> Result<Self, EvalError> {
    let mut params = FlakeParams::new(iou_type)?;
    params.img_ids = gt.img_ids();
    params.cat_ids = gt.cat_ids();

    let dts = load_results(gt, results, iou_type)?;
    info!("载入 {} 条 {} 检测结果", dts.len(), iou_type);

    Ok(Self {
      gt,
      params,
      dts,
      gts: HashMap::new(),
      dts_by_key: HashMap::new(),
      ious: HashMap::new(),
      eval_imgs: None,
      eval: None,
      stats: Vec::new(),
    })
  }

  pub fn params(&self) -> &FlakeParams {
    &self.params
  }

  pub fn params_mut(&mut self) -> &mut FlakeParams {
    &mut self.params
  }

  pub fn accumulation(&self) -> Option<&Accumulation> {
    self.eval.as_ref()
  }

  pub fn stats(&self) -> &[f64] {
    &self.stats
  }

  fn prepare(&mut self) -> Result<(), EvalError> {
    let img_ids: BTreeSet<u64> = self.params.img_ids.iter().copied().collect();
    let cat_ids: BTreeSet<u64> = self.params.cat_ids.iter().copied().collect();
    let segm = self.params.iou_type == IouType::Segm;

    self.gts.clear();
    for ann in self.gt.annotations() {
      if !img_ids.contains(&ann.image_id) || !cat_ids.contains(&ann.category_id) {
        continue;
      }
      let rle = if segm {
        let image = self
          .gt
          .image(ann.image_id)
          .ok_or(EvalError::UnknownImage(ann.image_id))?;
        let segmentation = ann
          .segmentation
          .as_ref()
          .ok_or(EvalError::MissingField(ann.id, "segmentation"))?;
        Some(segmentation.to_rle(image.height, image.width)?)
      } else {
        None
      };
      let iscrowd = ann.iscrowd != 0;
      self
        .gts
        .entry((ann.image_id, ann.category_id))
        .or_default()
        .push(Instance {
          id: ann.id,
          image_id: ann.image_id,
          category_id: ann.category_id,
          area: ann.area,
          bbox: ann.bbox,
          score: 0.0,
          iscrowd,
          ignore: iscrowd,
          rle,
        });
    }

    self.dts_by_key.clear();
    for (idx, dt) in self.dts.iter().enumerate() {
      if img_ids.contains(&dt.image_id) && cat_ids.contains(&dt.category_id) {
        self
          .dts_by_key
          .entry((dt.image_id, dt.category_id))
          .or_default()
          .push(idx);
      }
    }
    Ok(())
  }

  /// 按分数降序（稳定）排列并截断到 `max_det`
  fn sorted_dts(&self, key: (u64, u64), max_det: usize) -> Vec<&Instance> {
    let mut dts: Vec<&Instance> = self
      .dts_by_key
      .get(&key)
      .map(|ids| ids.iter().map(|&i| &self.dts[i]).collect())
      .unwrap_or_default();
    dts.sort_by(|a, b| b.score.total_cmp(&a.score));
    dts.truncate(max_det);
    dts
  }

  fn gts_for(&self, key: (u64, u64)) -> &[Instance] {
    self.gts.get(&key).map(Vec::as_slice).unwrap_or(&[])
  }

  fn compute_iou(&self, key: (u64, u64), max_det: usize) -> Vec<Vec<f64>> {
    let gt = self.gts_for(key);
    let dt = self.sorted_dts(key, max_det);
    if gt.is_empty() || dt.is_empty() {
      return Vec::new();
    }
    let iscrowd: Vec<bool> = gt.iter().map(|g| g.iscrowd).collect();

    match self.params.iou_type {
      IouType::Segm => {
        let g: Vec<Rle> = gt.iter().filter_map(|g| g.rle.clone()).collect();
        let d: Vec<Rle> = dt.iter().filter_map(|d| d.rle.clone()).collect();
        Rle::iou(&d, &g, &iscrowd)
      }
      _ => {
        let g: Vec<[f64; 4]> = gt.iter().map(|g| g.bbox).collect();
        let d: Vec<[f64; 4]> = dt.iter().map(|d| d.bbox).collect();
        bbox_iou(&d, &g, &iscrowd)
      }
    }
  }

  fn evaluate_img(&self, key: (u64, u64), area_rng: [f64; 2], max_det: usize) -> Option<EvalImage> {
    let gt = self.gts_for(key);
    let dt = self.sorted_dts(key, max_det);
    if gt.is_empty() && dt.is_empty() {
      return None;
    }

    let out_of_range = |area: f64| area < area_rng[0] || area > area_rng[1];
    let ignore: Vec<bool> = gt.iter().map(|g| g.ignore || out_of_range(g.area)).collect();
    // 未忽略的真值排在前面
    let mut gt_order: Vec<usize> = (0..gt.len()).collect();
    gt_order.sort_by_key(|&i| ignore[i]);
    let gt_ignore: Vec<bool> = gt_order.iter().map(|&i| ignore[i]).collect();
    let iscrowd: Vec<bool> = gt_order.iter().map(|&i| gt[i].iscrowd).collect();

    let ious = self.ious.get(&key);
    let n_thr = self.params.iou_thrs.len();
    let mut gt_matched = vec![vec![false; gt.len()]; n_thr];
    let mut dt_matched = vec![vec![false; dt.len()]; n_thr];
    let mut dt_ignore = vec![vec![false; dt.len()]; n_thr];

    if let Some(ious) = ious.filter(|ious| !ious.is_empty()) {
      for (t, &thr) in self.params.iou_thrs.iter().enumerate() {
        for d in 0..dt.len() {
          let mut best = thr.min(1.0 - 1e-10);
          let mut m: Option<usize> = None;
          for g in 0..gt_order.len() {
            if gt_matched[t][g] && !iscrowd[g] {
              continue;
            }
            // 已匹配到有效真值后，不再考虑被忽略的真值
            if m.is_some_and(|mi| !gt_ignore[mi]) && gt_ignore[g] {
              break;
            }
            let iou = ious[d][gt_order[g]];
            if iou < best {
              continue;
            }
            best = iou;
            m = Some(g);
          }
          if let Some(mi) = m {
            dt_ignore[t][d] = gt_ignore[mi];
            dt_matched[t][d] = true;
            gt_matched[t][mi] = true;
          }
        }
      }
    }

    for t in 0..n_thr {
      for (d, det) in dt.iter().enumerate() {
        if !dt_matched[t][d] && out_of_range(det.area) {
          dt_ignore[t][d] = true;
        }
      }
    }

    Some(EvalImage {
      dt_scores: dt.iter().map(|d| d.score).collect(),
      dt_matched,
      dt_ignore,
      gt_ignore,
    })
  }

  /// 逐图像、逐类别、逐面积段完成匹配
  pub fn evaluate(&mut self) -> Result<(), EvalError> {
    let tic = Instant::now();
    info!("逐图像评估, IoU 类型: {}", self.params.iou_type);

    let p = &mut self.params;
    p.img_ids.sort_unstable();
    p.img_ids.dedup();
    p.cat_ids.sort_unstable();
    p.cat_ids.dedup();
    p.max_dets.sort_unstable();

    self.prepare()?;

    let max_det = self.params.max_dets.last().copied().unwrap_or(0);
    let mut ious = HashMap::new();
    for &img in &self.params.img_ids {
      for &cat in &self.params.cat_ids {
        ious.insert((img, cat), self.compute_iou((img, cat), max_det));
      }
    }
    self.ious = ious;

    let mut eval_imgs = Vec::with_capacity(
      self.params.cat_ids.len() * self.params.area_rng.len() * self.params.img_ids.len(),
    );
    for &cat in &self.params.cat_ids {
      for &area_rng in &self.params.area_rng {
        for &img in &self.params.img_ids {
          eval_imgs.push(self.evaluate_img((img, cat), area_rng, max_det));
        }
      }
    }
    self.eval_imgs = Some(eval_imgs);
    self.eval = None;
    self.stats.clear();

    info!("逐图像评估完成 (t={:.2}s)", tic.elapsed().as_secs_f64());
    Ok(())
  }

  /// 汇总为精度 `[T][R][K][A][M]` 与召回 `[T][K][A][M]`
  pub fn accumulate(&mut self) -> Result<(), EvalError> {
    let tic = Instant::now();
    let eval_imgs = self.eval_imgs.as_ref().ok_or(EvalError::NotEvaluated)?;
    let p = &self.params;
    let (tn, rn, kn, an, mn, im) = (
      p.iou_thrs.len(),
      p.rec_thrs.len(),
      p.cat_ids.len(),
      p.area_rng.len(),
      p.max_dets.len(),
      p.img_ids.len(),
    );
    let mut acc = Accumulation::new(tn, rn, kn, an, mn);

    for k in 0..kn {
      for a in 0..an {
        let images: Vec<&EvalImage> = eval_imgs[(k * an + a) * im..(k * an + a + 1) * im]
          .iter()
          .flatten()
          .collect();
        if images.is_empty() {
          continue;
        }
        let npig = images
          .iter()
          .map(|e| e.gt_ignore.iter().filter(|&&ig| !ig).count())
          .sum::<usize>();
        if npig == 0 {
          continue;
        }

        for (m, &max_det) in p.max_dets.iter().enumerate() {
          // (分数, 图像序号, 检测序号)，按分数稳定降序
          let mut entries: Vec<(f64, usize, usize)> = images
            .iter()
            .enumerate()
            .flat_map(|(e, img)| {
              img
                .dt_scores
                .iter()
                .take(max_det)
                .enumerate()
                .map(move |(d, &s)| (s, e, d))
            })
            .collect();
          entries.sort_by(|x, y| y.0.total_cmp(&x.0));

          for t in 0..tn {
            let mut tp = 0.0;
            let mut fp = 0.0;
            let mut rc = Vec::with_capacity(entries.len());
            let mut pr = Vec::with_capacity(entries.len());
            for &(_, e, d) in &entries {
              if !images[e].dt_ignore[t][d] {
                if images[e].dt_matched[t][d] {
                  tp += 1.0;
                } else {
                  fp += 1.0;
                }
              }
              rc.push(tp / npig as f64);
              pr.push(tp / (tp + fp + f64::EPSILON));
            }

            let r_idx = acc.r_index(t, k, a, m);
            acc.recall[r_idx] = rc.last().copied().unwrap_or(0.0);

            for i in (1..pr.len()).rev() {
              if pr[i] > pr[i - 1] {
                pr[i - 1] = pr[i];
              }
            }

            for (ri, &thr) in p.rec_thrs.iter().enumerate() {
              let pi = rc.partition_point(|&x| x < thr);
              let (q, s) = match pr.get(pi) {
                Some(&q) => (q, entries[pi].0),
                None => (0.0, 0.0),
              };
              let idx = acc.p_index(t, ri, k, a, m);
              acc.precision[idx] = q;
              acc.scores[idx] = s;
            }
          }
        }
      }
    }

    self.eval = Some(acc);
    info!("累积完成 (t={:.2}s)", tic.elapsed().as_secs_f64());
    Ok(())
  }

  /// 计算 30 项汇总指标，顺序为 IoU 0.50、0.75、平均，每组先 AP 后 AR，各 5 个面积段
  pub fn summarize(&mut self) -> Result<&[f64], EvalError> {
    let acc = self.eval.as_ref().ok_or(EvalError::NotAccumulated)?;
    let p = &self.params;
    let max_det = p
      .max_dets
      .get(2)
      .or(p.max_dets.last())
      .copied()
      .unwrap_or(0);
    let ms: Vec<usize> = (0..p.max_dets.len())
      .filter(|&m| p.max_dets[m] == max_det)
      .collect();
    let ks: Vec<usize> = (0..p.cat_ids.len()).collect();

    let mut stats = Vec::with_capacity(30);
    for iou_thr in [Some(0.5), Some(0.75), None] {
      let ts: Vec<usize> = match iou_thr {
        Some(thr) => p.iou_index(thr).into_iter().collect(),
        None => (0..p.iou_thrs.len()).collect(),
      };
      let iou_str = match iou_thr {
        Some(thr) => format!("{:0.2}", thr),
        None => format!(
          "{:0.2}:{:0.2}",
          p.iou_thrs.first().copied().unwrap_or(0.0),
          p.iou_thrs.last().copied().unwrap_or(0.0)
        ),
      };
      for ap in [true, false] {
        for (a, label) in p.area_rng_lbl.iter().enumerate() {
          let s = acc.mean_valid(ap, &ts, &ks, a, &ms);
          let (title, kind) = if ap {
            ("Average Precision", "(AP)")
          } else {
            ("Average Recall", "(AR)")
          };
          info!(
            " {:<18} {} @[ IoU={:<9} | area={:>7} | maxDets={:>3} ] = {:0.3}",
            title, kind, iou_str, label, max_det, s
          );
          stats.push(s);
        }
      }
    }

    self.stats = stats;
    Ok(&self.stats)
  }

  /// 单个类别（或全部类别）在某面积段与最后一个 `max_dets` 下的平均精度，没有数据时为 -1
  pub fn mean_precision(&self, iou_thr: Option<f64>, category: Option<usize>, area_idx: usize) -> Result<f64, EvalError> {
    self.mean_metric(true, iou_thr, category, area_idx)
  }

  /// 同 [`FlakeCocoEval::mean_precision`]，取召回
  pub fn mean_recall(&self, iou_thr: Option<f64>, category: Option<usize>, area_idx: usize) -> Result<f64, EvalError> {
    self.mean_metric(false, iou_thr, category, area_idx)
  }

  fn mean_metric(&self, ap: bool, iou_thr: Option<f64>, category: Option<usize>, area_idx: usize) -> Result<f64, EvalError> {
    let acc = self.eval.as_ref().ok_or(EvalError::NotAccumulated)?;
    let [tn, _, kn, an, mn] = acc.shape();
    if area_idx >= an || mn == 0 {
      return Ok(-1.0);
    }
    let ts: Vec<usize> = match iou_thr {
      Some(thr) => self.params.iou_index(thr).into_iter().collect(),
      None => (0..tn).collect(),
    };
    let ks: Vec<usize> = match category {
      Some(k) if k < kn => vec![k],
      Some(_) => Vec::new(),
      None => (0..kn).collect(),
    };
    Ok(acc.mean_valid(ap, &ts, &ks, area_idx, &[mn - 1]))
  }
}

/// 将结果记录转换为检测实例，编号从 1 开始
fn load_results(gt: &CocoIndex, results: &[CocoResult], iou_type: IouType) -> Result<Vec<Instance>, EvalError> {
  let mut dts = Vec::with_capacity(results.len());
  for (idx, res) in results.iter().enumerate() {
    let id = idx as u64 + 1;
    if gt.image(res.image_id).is_none() {
      return Err(EvalError::UnknownImage(res.image_id));
    }

    let (bbox, area, rle) = match iou_type {
      IouType::Segm => {
        let object = res
          .segmentation
          .as_ref()
          .ok_or(EvalError::MissingField(id, "segmentation"))?;
        let rle = Rle::try_from(object)?;
        (rle.to_bbox(), rle.area() as f64, Some(rle))
      }
      _ => {
        let bbox = res.bbox.ok_or(EvalError::MissingField(id, "bbox"))?;
        (bbox, bbox[2] * bbox[3], None)
      }
    };

    dts.push(Instance {
      id,
      image_id: res.image_id,
      category_id: res.category_id,
      area,
      bbox,
      score: res.score,
      iscrowd: false,
      ignore: false,
      rle,
    });
  }
  debug!(
    "检测编号范围: 1..={}",
    dts.last().map_or(0, |d: &Instance| d.id)
  );
  Ok(dts)
}

/// 按插入顺序保存的指标表
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MetricTable(Vec<(String, f64)>);

impl MetricTable {
  pub fn new() -> Self {
    Self::default()
  }

  /// 同名指标会被覆盖，位置不变
  pub fn insert(&mut self, name: impl Into<String>, value: f64) {
    let name = name.into();
    match self.0.iter_mut().find(|(k, _)| *k == name) {
      Some(entry) => entry.1 = value,
      None => self.0.push((name, value)),
    }
  }

  pub fn get(&self, name: &str) -> Option<f64> {
    self.0.iter().find(|(k, _)| k == name).map(|(_, v)| *v)
  }

  pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
    self.0.iter().map(|(k, v)| (k.as_str(), *v))
  }

  pub fn len(&self) -> usize {
    self.0.len()
  }

  pub fn is_empty(&self) -> bool {
    self.0.is_empty()
  }
}

impl<K: Into<String>> FromIterator<(K, f64)> for MetricTable {
  fn from_iter<I: IntoIterator<Item = (K, f64)>>(iter: I) -> Self {
    let mut table = MetricTable::new();
    for (k, v) in iter {
      table.insert(k, v);
    }
    table
  }
}

impl Serialize for MetricTable {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(self.0.len()))?;
    for (k, v) in &self.0 {
      map.serialize_entry(k, v)?;
    }
    map.end()
  }
}

/// 按任务名保存的评估结果
pub type EvalResults = BTreeMap<String, MetricTable>;
