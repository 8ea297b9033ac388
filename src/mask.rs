// 该文件是 Maskterial 项目的一部分。
// src/mask.rs - 二值掩码
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

use thiserror::Error;

use crate::rle::Rle;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum MaskError {
  #[error("数据长度不匹配: 期望长度 {expected}, 实际长度 {actual}")]
  ShapeMismatch { expected: usize, actual: usize },
  #[error("掩码中没有前景像素")]
  Empty,
}

/// 行优先存储的二维二值掩码，尺寸与原图一致
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mask {
  height: usize,
  width: usize,
  data: Box<[bool]>,
}

impl Mask {
  /// 创建全零掩码
  pub fn new(height: usize, width: usize) -> Self {
    Self {
      height,
      width,
      data: vec![false; height * width].into_boxed_slice(),
    }
  }

  pub fn from_vec(height: usize, width: usize, data: Vec<bool>) -> Result<Self, MaskError> {
    if data.len() != height * width {
      return Err(MaskError::ShapeMismatch {
        expected: height * width,
        actual: data.len(),
      });
    }
    Ok(Self {
      height,
      width,
      data: data.into_boxed_slice(),
    })
  }

  /// 按 (row, col) 生成掩码
  pub fn from_fn(height: usize, width: usize, f: impl Fn(usize, usize) -> bool) -> Self {
    let mut data = Vec::with_capacity(height * width);
    for r in 0..height {
      for c in 0..width {
        data.push(f(r, c));
      }
    }
    Self {
      height,
      width,
      data: data.into_boxed_slice(),
    }
  }

  pub fn height(&self) -> usize {
    self.height
  }

  pub fn width(&self) -> usize {
    self.width
  }

  pub fn get(&self, row: usize, col: usize) -> Option<bool> {
    if row >= self.height || col >= self.width {
      return None;
    }
    Some(self.data[row * self.width + col])
  }

  pub fn as_slice(&self) -> &[bool] {
    &self.data
  }

  /// 前景像素数量
  pub fn area(&self) -> usize {
    self.data.iter().filter(|&&v| v).count()
  }

  pub fn is_empty(&self) -> bool {
    !self.data.iter().any(|&v| v)
  }

  /// 每一行是否含有前景像素
  pub fn row_occupancy(&self) -> Vec<bool> {
    self
      .data
      .chunks(self.width.max(1))
      .take(self.height)
      .map(|row| row.iter().any(|&v| v))
      .collect()
  }

  /// 每一列是否含有前景像素
  pub fn column_occupancy(&self) -> Vec<bool> {
    let mut cols = vec![false; self.width];
    for r in 0..self.height {
      let row = &self.data[r * self.width..(r + 1) * self.width];
      for (occupied, &v) in cols.iter_mut().zip(row) {
        *occupied |= v;
      }
    }
    cols
  }

  /// 由行列占用计算边界框 `[x, y, w, h]`，其中 `w = cmax - cmin`，`h = rmax - rmin`。
  ///
  /// 全零掩码没有可用的索引，返回 [`MaskError::Empty`]，调用方应在上游过滤空掩码。
  pub fn bounding_box(&self) -> Result<[usize; 4], MaskError> {
    let rows = self.row_occupancy();
    let cols = self.column_occupancy();

    let rmin = rows.iter().position(|&v| v).ok_or(MaskError::Empty)?;
    let rmax = rows.iter().rposition(|&v| v).ok_or(MaskError::Empty)?;
    let cmin = cols.iter().position(|&v| v).ok_or(MaskError::Empty)?;
    let cmax = cols.iter().rposition(|&v| v).ok_or(MaskError::Empty)?;

    Ok([cmin, rmin, cmax - cmin, rmax - rmin])
  }

  /// 列优先（Fortran 顺序）编码为 RLE
  pub fn to_rle(&self) -> Rle {
    let mut column_major = Vec::with_capacity(self.data.len());
    for c in 0..self.width {
      for r in 0..self.height {
        column_major.push(self.data[r * self.width + c]);
      }
    }
    Rle::encode(&column_major, self.height as u32, self.width as u32)
  }
}

impl From<&Rle> for Mask {
  fn from(rle: &Rle) -> Self {
    let [h, w] = rle.size;
    let (h, w) = (h as usize, w as usize);
    let column_major = rle.decode();
    Mask::from_fn(h, w, |r, c| column_major[c * h + r])
  }
}

#[cfg(feature = "mask_image")]
impl From<&image::GrayImage> for Mask {
  fn from(image: &image::GrayImage) -> Self {
    let (width, height) = image.dimensions();
    Mask::from_fn(height as usize, width as usize, |r, c| {
      image.get_pixel(c as u32, r as u32)[0] != 0
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bounding_box_matches_extent_of_foreground() {
    let mask = Mask::from_fn(6, 8, |r, c| (2..=4).contains(&r) && (1..=5).contains(&c) && r + c != 6);
    assert_eq!(mask.bounding_box(), Ok([1, 2, 4, 2]));
  }

  #[test]
  fn single_pixel_box_has_zero_extent() {
    let mask = Mask::from_fn(4, 4, |r, c| r == 3 && c == 0);
    assert_eq!(mask.bounding_box(), Ok([0, 3, 0, 0]));
  }

  #[test]
  fn empty_mask_has_no_bounding_box() {
    let mask = Mask::new(5, 5);
    assert_eq!(mask.bounding_box(), Err(MaskError::Empty));
  }

  #[test]
  fn from_vec_checks_length() {
    let err = Mask::from_vec(2, 3, vec![true; 5]).unwrap_err();
    assert_eq!(
      err,
      MaskError::ShapeMismatch {
        expected: 6,
        actual: 5
      }
    );
  }

  #[test]
  fn rle_conversion_preserves_pixels() {
    let mask = Mask::from_fn(5, 7, |r, c| (r * 7 + c) % 3 == 0);
    let rle = mask.to_rle();
    assert_eq!(rle.area() as usize, mask.area());
    assert_eq!(Mask::from(&rle), mask);
  }

  #[cfg(feature = "mask_image")]
  #[test]
  fn gray_image_nonzero_is_foreground() {
    let image = image::GrayImage::from_fn(4, 3, |x, y| image::Luma([if x == y { 255 } else { 0 }]));
    let mask = Mask::from(&image);
    assert_eq!(mask.height(), 3);
    assert_eq!(mask.width(), 4);
    assert_eq!(mask.area(), 3);
    assert_eq!(mask.get(2, 2), Some(true));
    assert_eq!(mask.get(0, 3), Some(false));
  }
}
