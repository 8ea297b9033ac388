// 该文件是 Maskterial 项目的一部分。
// src/flake.rs - 薄片检测结果
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

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::{
  mask::Mask,
  rle::RleObject,
};

/// 避免最小边长为 0 时除零
const ASPECT_RATIO_EPS: f64 = 1e-5;
/// 未计算熵时的占位值
pub const ENTROPY_UNSET: f64 = -1.0;

#[derive(Error, Debug, PartialEq)]
pub enum FlakeError {
  #[error("假阳性概率必须在 [0, 1] 之间, 实际为 {0}")]
  InvalidProbability(f64),
  #[error("掩码为空，无法计算边界框")]
  EmptyMask,
  #[error("边长无效: 最长边 {0}, 最短边 {1}")]
  InvalidSidelengths(f64, f64),
}

/// 图像中检测到的一片二维材料
#[derive(Debug, Clone)]
pub struct Flake {
  mask: Mask,
  thickness: u32,
  size: u64,
  mean_contrast: Vec<f64>,
  center: [f64; 2],
  max_sidelength: f64,
  min_sidelength: f64,
  aspect_ratio: f64,
  false_positive_probability: f64,
  entropy: f64,
}

/// 序列化用的字典视图
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlakeRecord {
  pub mask: RleObject,
  pub thickness: u32,
  pub size: u64,
  pub mean_contrast: Vec<i64>,
  pub center: [i64; 2],
  pub max_sidelength: i64,
  pub min_sidelength: i64,
  pub aspect_ratio: f64,
  pub false_positive_probability: f64,
  pub entropy: f64,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub bbox: Option<[usize; 4]>,
}

pub struct FlakeBuilder {
  mask: Mask,
  thickness: u32,
  size: Option<u64>,
  mean_contrast: Vec<f64>,
  center: [f64; 2],
  max_sidelength: f64,
  min_sidelength: f64,
  false_positive_probability: f64,
  entropy: f64,
}

impl FlakeBuilder {
  /// 厚度标签为层数类别编号
  pub fn thickness(mut self, thickness: u32) -> Self {
    self.thickness = thickness;
    self
  }

  /// 像素面积，缺省时取掩码前景像素数
  pub fn size(mut self, size: u64) -> Self {
    self.size = Some(size);
    self
  }

  /// 各颜色通道的平均对比度（BGR）
  pub fn mean_contrast(mut self, mean_contrast: impl Into<Vec<f64>>) -> Self {
    self.mean_contrast = mean_contrast.into();
    self
  }

  /// 中心点 `[x, y]`，相对图像左上角
  pub fn center(mut self, center: [f64; 2]) -> Self {
    self.center = center;
    self
  }

  /// 旋转外接框的最长边与最短边
  pub fn sidelengths(mut self, max_sidelength: f64, min_sidelength: f64) -> Self {
    self.max_sidelength = max_sidelength;
    self.min_sidelength = min_sidelength;
    self
  }

  pub fn false_positive_probability(mut self, probability: f64) -> Self {
    self.false_positive_probability = probability;
    self
  }

  pub fn entropy(mut self, entropy: f64) -> Self {
    self.entropy = entropy;
    self
  }

  pub fn build(self) -> Result<Flake, FlakeError> {
    if !(0.0..=1.0).contains(&self.false_positive_probability) {
      return Err(FlakeError::InvalidProbability(
        self.false_positive_probability,
      ));
    }
    // 0 <= 最短边 <= 最长边
    if !(self.min_sidelength >= 0.0 && self.max_sidelength >= self.min_sidelength) {
      return Err(FlakeError::InvalidSidelengths(
        self.max_sidelength,
        self.min_sidelength,
      ));
    }

    let size = self.size.unwrap_or_else(|| self.mask.area() as u64);
    if size != self.mask.area() as u64 {
      debug!(
        "薄片面积 {} 与掩码前景像素数 {} 不一致",
        size,
        self.mask.area()
      );
    }

    let ratio = self.max_sidelength / (self.min_sidelength + ASPECT_RATIO_EPS);
    let aspect_ratio = (ratio * 10.0).round() / 10.0;

    Ok(Flake {
      mask: self.mask,
      thickness: self.thickness,
      size,
      mean_contrast: self.mean_contrast,
      center: self.center,
      max_sidelength: self.max_sidelength,
      min_sidelength: self.min_sidelength,
      aspect_ratio,
      false_positive_probability: self.false_positive_probability,
      entropy: self.entropy,
    })
  }
}

impl Flake {
  pub fn builder(mask: Mask) -> FlakeBuilder {
    FlakeBuilder {
      mask,
      thickness: 0,
      size: None,
      mean_contrast: Vec::new(),
      center: [0.0, 0.0],
      max_sidelength: 0.0,
      min_sidelength: 0.0,
      false_positive_probability: 0.0,
      entropy: ENTROPY_UNSET,
    }
  }

  pub fn mask(&self) -> &Mask {
    &self.mask
  }

  pub fn thickness(&self) -> u32 {
    self.thickness
  }

  pub fn size(&self) -> u64 {
    self.size
  }

  pub fn mean_contrast(&self) -> &[f64] {
    &self.mean_contrast
  }

  pub fn center(&self) -> [f64; 2] {
    self.center
  }

  pub fn max_sidelength(&self) -> f64 {
    self.max_sidelength
  }

  pub fn min_sidelength(&self) -> f64 {
    self.min_sidelength
  }

  pub fn aspect_ratio(&self) -> f64 {
    self.aspect_ratio
  }

  pub fn false_positive_probability(&self) -> f64 {
    self.false_positive_probability
  }

  /// 未设置时为 `None`
  pub fn entropy(&self) -> Option<f64> {
    (self.entropy != ENTROPY_UNSET).then_some(self.entropy)
  }

  /// 转换为字典视图。掩码以压缩 RLE 保存，几何与对比度字段截断为整数。
  ///
  /// `return_bbox` 为 true 时由掩码计算边界框，空掩码返回 [`FlakeError::EmptyMask`]。
  pub fn to_record(&self, return_bbox: bool) -> Result<FlakeRecord, FlakeError> {
    let bbox = if return_bbox {
      Some(
        self
          .mask
          .bounding_box()
          .map_err(|_| FlakeError::EmptyMask)?,
      )
    } else {
      None
    };

    let record = FlakeRecord {
      mask: self.mask.to_rle().to_object(),
      thickness: self.thickness,
      size: self.size,
      mean_contrast: self.mean_contrast.iter().map(|&c| c as i64).collect(),
      center: [self.center[0] as i64, self.center[1] as i64],
      max_sidelength: self.max_sidelength as i64,
      min_sidelength: self.min_sidelength as i64,
      aspect_ratio: self.aspect_ratio,
      false_positive_probability: self.false_positive_probability,
      entropy: self.entropy,
      bbox,
    };
    debug!("薄片记录: {:?}", record);

    Ok(record)
  }
}

impl fmt::Display for Flake {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "Flake(thickness={}, size={:5.0}px, max_sidelength={:5.0}px, min_sidelength={:5.0}px, false_positive_probability={:.1}%)",
      self.thickness,
      self.size as f64,
      self.max_sidelength,
      self.min_sidelength,
      self.false_positive_probability * 100.0
    )
  }
}
