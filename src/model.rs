// 该文件是 Maskterial 项目的一部分。
// src/model.rs - 模型
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

use serde::{Deserialize, Serialize};

use crate::{
  coco::{BoxMode, CocoResult},
  flake::{Flake, FlakeError},
  mask::Mask,
};

/// 推理接口，分割网络本身由调用方提供
pub trait Model {
  type Input;
  type Output;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Self::Output, Self::Error>;
}

/// 能提供图像编号的输入记录
pub trait ImageRecord {
  fn image_id(&self) -> u64;
}

/// 单张图像的实例分割结果
#[derive(Debug, Clone, Default)]
pub struct Instances {
  /// `[x_min, y_min, x_max, y_max]`，绝对像素坐标
  pub pred_boxes: Vec<[f64; 4]>,
  pub scores: Vec<f64>,
  /// 训练时使用的连续类别编号
  pub pred_classes: Vec<u64>,
  pub pred_masks: Option<Vec<Mask>>,
  /// 每个实例的 `[x, y, visibility]` 列表
  pub pred_keypoints: Option<Vec<Vec<[f64; 3]>>>,
}

impl Instances {
  pub fn len(&self) -> usize {
    self.scores.len()
  }

  pub fn is_empty(&self) -> bool {
    self.scores.is_empty()
  }

  /// 由薄片构造实例，类别为厚度标签，分数为 1 减去假阳性概率。
  /// 空掩码没有边界框，需要在上游过滤。
  pub fn from_flakes(flakes: &[Flake]) -> Result<Self, FlakeError> {
    let mut instances = Instances {
      pred_masks: Some(Vec::with_capacity(flakes.len())),
      ..Default::default()
    };
    for flake in flakes {
      let [x, y, w, h] = flake
        .mask()
        .bounding_box()
        .map_err(|_| FlakeError::EmptyMask)?;
      instances.pred_boxes.push([
        x as f64,
        y as f64,
        (x + w + 1) as f64,
        (y + h + 1) as f64,
      ]);
      instances
        .scores
        .push(1.0 - flake.false_positive_probability());
      instances.pred_classes.push(flake.thickness() as u64);
      if let Some(masks) = instances.pred_masks.as_mut() {
        masks.push(flake.mask().clone());
      }
    }
    Ok(instances)
  }

  /// 转换为 COCO 结果记录。掩码编码为压缩 RLE，关键点坐标减去 0.5 与标注的像素索引对齐。
  ///
  /// 框、分数与类别长度不一致时按最短者截断。
  pub fn to_coco_results(&self, image_id: u64) -> Vec<CocoResult> {
    self
      .pred_boxes
      .iter()
      .zip(&self.scores)
      .zip(&self.pred_classes)
      .enumerate()
      .map(|(k, ((&bbox, &score), &category_id))| CocoResult {
        image_id,
        category_id,
        bbox: Some(BoxMode::XyxyAbs.to_xywh(bbox)),
        score,
        segmentation: self
          .pred_masks
          .as_ref()
          .and_then(|masks| masks.get(k))
          .map(|mask| mask.to_rle().to_object()),
        keypoints: self
          .pred_keypoints
          .as_ref()
          .and_then(|keypoints| keypoints.get(k))
          .map(|points| {
            points
              .iter()
              .flat_map(|&[x, y, v]| [x - 0.5, y - 0.5, v])
              .collect()
          }),
      })
      .collect()
  }
}

/// 候选框及其目标性分数
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Proposals {
  /// `[x_min, y_min, x_max, y_max]`，绝对像素坐标
  pub proposal_boxes: Vec<[f64; 4]>,
  pub objectness_logits: Vec<f64>,
}

/// 单张图像的模型输出
#[derive(Debug, Clone, Default)]
pub struct ModelOutput {
  pub instances: Option<Instances>,
  pub proposals: Option<Proposals>,
}
