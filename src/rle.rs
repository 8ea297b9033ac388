// 该文件是 Maskterial 项目的一部分。
// src/rle.rs - COCO 游程编码
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

//! COCO 格式的游程编码（RLE）。
//!
//! 掩码按列优先顺序展开，`counts` 从背景游程开始交替记录 0/1 的长度。
//! 压缩字符串格式、多边形光栅化与交并比的结果与 COCO API 一致。

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum RleError {
  #[error("RLE 尺寸不一致: {0:?} 与 {1:?}")]
  SizeMismatch([u32; 2], [u32; 2]),
  #[error("RLE 压缩字符串包含非法字符: {0:?}")]
  InvalidString(char),
  #[error("RLE 压缩字符串中单个游程超过 {0} 个字符")]
  CountTooLong(usize),
}

/// 压缩字符串中单个游程的最大字符数，每个字符携带 5 位
const MAX_CHARS_PER_COUNT: usize = 12;

/// 未压缩的 RLE，`size` 为 `[height, width]`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rle {
  pub size: [u32; 2],
  pub counts: Vec<u32>,
}

/// JSON 中的 RLE 对象，`counts` 可以是压缩字符串或整数列表
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RleObject {
  pub size: [u32; 2],
  pub counts: RleCounts,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RleCounts {
  Compressed(String),
  Uncompressed(Vec<u32>),
}

/// COCO 标注中的分割字段
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Segmentation {
  Polygons(Vec<Vec<f64>>),
  Rle(RleObject),
}

impl Segmentation {
  /// 转换为 RLE，多边形需要图像尺寸
  pub fn to_rle(&self, height: u32, width: u32) -> Result<Rle, RleError> {
    match self {
      Segmentation::Polygons(polygons) => Ok(Rle::from_polygons(polygons, height, width)),
      Segmentation::Rle(object) => Rle::try_from(object),
    }
  }
}

impl TryFrom<&RleObject> for Rle {
  type Error = RleError;

  fn try_from(object: &RleObject) -> Result<Self, Self::Error> {
    match &object.counts {
      RleCounts::Compressed(s) => Rle::from_compressed_string(s, object.size),
      RleCounts::Uncompressed(counts) => Ok(Rle {
        size: object.size,
        counts: counts.clone(),
      }),
    }
  }
}

/// 逐段读取 RLE 游程
struct RunCursor<'a> {
  counts: &'a [u32],
  idx: usize,
  remaining: u64,
  value: bool,
}

impl<'a> RunCursor<'a> {
  fn new(counts: &'a [u32]) -> Self {
    Self {
      counts,
      idx: 0,
      remaining: 0,
      value: false,
    }
  }

  /// 跳过长度为 0 的游程，耗尽时返回 false
  fn fill(&mut self) -> bool {
    while self.remaining == 0 {
      if self.idx >= self.counts.len() {
        return false;
      }
      self.remaining = self.counts[self.idx] as u64;
      self.value = self.idx % 2 == 1;
      self.idx += 1;
    }
    true
  }
}

impl Rle {
  pub fn height(&self) -> u32 {
    self.size[0]
  }

  pub fn width(&self) -> u32 {
    self.size[1]
  }

  /// 对列优先展开的二值掩码编码
  pub fn encode(column_major: &[bool], height: u32, width: u32) -> Self {
    let mut counts = Vec::new();
    let mut previous = false;
    let mut run = 0u32;
    for &v in column_major {
      if v != previous {
        counts.push(run);
        run = 0;
        previous = v;
      }
      run += 1;
    }
    counts.push(run);
    Self {
      size: [height, width],
      counts,
    }
  }

  /// 解码为列优先展开的二值掩码
  pub fn decode(&self) -> Vec<bool> {
    let n = self.height() as usize * self.width() as usize;
    let mut mask = vec![false; n];
    let mut idx = 0usize;
    let mut value = false;
    for &c in &self.counts {
      let end = (idx + c as usize).min(n);
      mask[idx..end].fill(value);
      idx = end;
      value = !value;
    }
    mask
  }

  pub fn area(&self) -> u64 {
    self.counts.iter().skip(1).step_by(2).map(|&c| c as u64).sum()
  }

  /// 前景的外接框 `[x, y, w, h]`，空掩码为全零
  pub fn to_bbox(&self) -> [f64; 4] {
    let h = self.height() as u64;
    let m = (self.counts.len() / 2) * 2;
    if m == 0 || h == 0 {
      return [0.0; 4];
    }

    let (mut xs, mut ys) = (self.width() as u64, h);
    let (mut xe, mut ye) = (0u64, 0u64);
    let mut cc = 0u64;
    let mut found = false;
    for pair in self.counts[..m].chunks_exact(2) {
      let (bg, fg) = (pair[0] as u64, pair[1] as u64);
      cc += bg;
      // 长度为 0 的前景游程不含像素
      if fg == 0 {
        continue;
      }
      found = true;

      let (x0, y0) = (cc / h, cc % h);
      cc += fg;
      let (x1, y1) = ((cc - 1) / h, (cc - 1) % h);
      if x0 < x1 {
        // 前景跨列，覆盖整列
        ys = 0;
        ye = h - 1;
      }
      xs = xs.min(x0);
      xe = xe.max(x1);
      ys = ys.min(y0.min(y1));
      ye = ye.max(y0.max(y1));
    }
    if !found {
      return [0.0; 4];
    }
    [
      xs as f64,
      ys as f64,
      (xe - xs + 1) as f64,
      (ye - ys + 1) as f64,
    ]
  }

  /// 合并多个 RLE，`intersect` 为 true 时取交集，否则取并集
  pub fn merge(rles: &[Rle], intersect: bool) -> Result<Rle, RleError> {
    let Some(first) = rles.first() else {
      return Ok(Rle {
        size: [0, 0],
        counts: vec![0],
      });
    };
    let mut merged = first.clone();
    for rle in &rles[1..] {
      merged = merged.merge_with(rle, intersect)?;
    }
    Ok(merged)
  }

  fn merge_with(&self, other: &Rle, intersect: bool) -> Result<Rle, RleError> {
    if self.size != other.size {
      return Err(RleError::SizeMismatch(self.size, other.size));
    }

    let mut a = RunCursor::new(&self.counts);
    let mut b = RunCursor::new(&other.counts);
    let mut counts = Vec::new();
    let mut current = false;
    let mut run = 0u64;

    while a.fill() && b.fill() {
      let step = a.remaining.min(b.remaining);
      let value = if intersect {
        a.value && b.value
      } else {
        a.value || b.value
      };
      if value == current {
        run += step;
      } else {
        counts.push(run as u32);
        current = value;
        run = step;
      }
      a.remaining -= step;
      b.remaining -= step;
    }
    counts.push(run as u32);

    Ok(Rle {
      size: self.size,
      counts,
    })
  }

  /// 掩码交并比矩阵，行对应 `dt`，列对应 `gt`。
  /// 对于 crowd 标注，分母取检测掩码的面积；尺寸不同的一对记为 -1。
  pub fn iou(dt: &[Rle], gt: &[Rle], iscrowd: &[bool]) -> Vec<Vec<f64>> {
    let gt_areas: Vec<f64> = gt.iter().map(|g| g.area() as f64).collect();
    let mut ious = Vec::with_capacity(dt.len());
    for d in dt {
      let dt_area = d.area() as f64;
      let mut row = Vec::with_capacity(gt.len());
      for (j, g) in gt.iter().enumerate() {
        let Ok(merged) = d.merge_with(g, true) else {
          row.push(-1.0);
          continue;
        };
        let inter = merged.area() as f64;
        let crowd = iscrowd.get(j).copied().unwrap_or(false);
        let union = if crowd {
          dt_area
        } else {
          dt_area + gt_areas[j] - inter
        };
        row.push(if union > 0.0 { inter / union } else { 0.0 });
      }
      ious.push(row);
    }
    ious
  }

  /// 由多边形顶点 `[x0, y0, x1, y1, ...]` 光栅化，先 5 倍上采样再沿 y 边界下采样
  pub fn from_polygon(xy: &[f64], height: u32, width: u32) -> Rle {
    const SCALE: f64 = 5.0;
    let (h, w) = (height as i64, width as i64);
    let k = xy.len() / 2;
    if k == 0 {
      return Rle {
        size: [height, width],
        counts: vec![height * width],
      };
    }

    let mut x: Vec<i64> = (0..k).map(|j| (SCALE * xy[2 * j] + 0.5) as i64).collect();
    let mut y: Vec<i64> = (0..k).map(|j| (SCALE * xy[2 * j + 1] + 0.5) as i64).collect();
    x.push(x[0]);
    y.push(y[0]);

    // 沿边界稠密采样
    let mut u = Vec::new();
    let mut v = Vec::new();
    for j in 0..k {
      let (mut xs, mut xe, mut ys, mut ye) = (x[j], x[j + 1], y[j], y[j + 1]);
      let dx = (xe - xs).abs();
      let dy = (ys - ye).abs();
      let flip = (dx >= dy && xs > xe) || (dx < dy && ys > ye);
      if flip {
        std::mem::swap(&mut xs, &mut xe);
        std::mem::swap(&mut ys, &mut ye);
      }
      if dx >= dy {
        let s = if dx == 0 {
          0.0
        } else {
          (ye - ys) as f64 / dx as f64
        };
        for d in 0..=dx {
          let t = if flip { dx - d } else { d };
          u.push(t + xs);
          v.push((ys as f64 + s * t as f64 + 0.5) as i64);
        }
      } else {
        let s = (xe - xs) as f64 / dy as f64;
        for d in 0..=dy {
          let t = if flip { dy - d } else { d };
          v.push(t + ys);
          u.push((xs as f64 + s * t as f64 + 0.5) as i64);
        }
      }
    }

    // 取 y 方向边界点并下采样
    let mut boundary = Vec::new();
    for j in 1..u.len() {
      if u[j] == u[j - 1] {
        continue;
      }
      let xd = (if u[j] < u[j - 1] { u[j] } else { u[j] - 1 }) as f64;
      let xd = (xd + 0.5) / SCALE - 0.5;
      if xd.floor() != xd || xd < 0.0 || xd > (w - 1) as f64 {
        continue;
      }
      let yd = v[j].min(v[j - 1]) as f64;
      let yd = ((yd + 0.5) / SCALE - 0.5).clamp(0.0, h as f64).ceil();
      boundary.push(xd as i64 * h + yd as i64);
    }

    // 边界点转换为游程
    boundary.push(h * w);
    boundary.sort_unstable();
    let mut previous = 0i64;
    for a in boundary.iter_mut() {
      let t = *a;
      *a -= previous;
      previous = t;
    }
    let mut counts: Vec<u32> = vec![boundary[0] as u32];
    let mut j = 1;
    while j < boundary.len() {
      if boundary[j] > 0 {
        counts.push(boundary[j] as u32);
        j += 1;
      } else {
        j += 1;
        if j < boundary.len() {
          if let Some(last) = counts.last_mut() {
            *last += boundary[j] as u32;
          }
          j += 1;
        }
      }
    }

    Rle {
      size: [height, width],
      counts,
    }
  }

  /// 多个多边形光栅化后取并集
  pub fn from_polygons(polygons: &[Vec<f64>], height: u32, width: u32) -> Rle {
    let rles: Vec<Rle> = polygons
      .iter()
      .map(|p| Rle::from_polygon(p, height, width))
      .collect();
    // 同尺寸的 RLE 合并不会失败
    Rle::merge(&rles, false).unwrap_or(Rle {
      size: [height, width],
      counts: vec![height * width],
    })
  }

  /// 由 `[x, y, w, h]` 框生成掩码
  pub fn from_bbox(bbox: &[f64; 4], height: u32, width: u32) -> Rle {
    let (xs, ys) = (bbox[0], bbox[1]);
    let (xe, ye) = (xs + bbox[2], ys + bbox[3]);
    Rle::from_polygon(&[xs, ys, xs, ye, xe, ye, xe, ys], height, width)
  }

  /// COCO 压缩字符串：每个计数（第三个起与前前一个作差）按 5 位分组编码
  pub fn to_compressed_string(&self) -> String {
    let mut s = String::new();
    for (i, &count) in self.counts.iter().enumerate() {
      let mut x = count as i64;
      if i > 2 {
        x -= self.counts[i - 2] as i64;
      }
      loop {
        let mut c = x & 0x1f;
        x >>= 5;
        let more = if c & 0x10 != 0 { x != -1 } else { x != 0 };
        if more {
          c |= 0x20;
        }
        s.push((c as u8 + 48) as char);
        if !more {
          break;
        }
      }
    }
    s
  }

  pub fn from_compressed_string(s: &str, size: [u32; 2]) -> Result<Rle, RleError> {
    let mut counts: Vec<u32> = Vec::new();
    let mut chars = s.chars();
    while let Some(first) = chars.next() {
      let mut x = 0i64;
      let mut k = 0;
      let mut ch = first;
      loop {
        let c = (ch as i64) - 48;
        if !(0..64).contains(&c) {
          return Err(RleError::InvalidString(ch));
        }
        if k >= MAX_CHARS_PER_COUNT {
          return Err(RleError::CountTooLong(MAX_CHARS_PER_COUNT));
        }
        x |= (c & 0x1f) << (5 * k);
        k += 1;
        let more = c & 0x20 != 0;
        if !more {
          if c & 0x10 != 0 {
            x |= -1i64 << (5 * k);
          }
          break;
        }
        match chars.next() {
          Some(next) => ch = next,
          None => break,
        }
      }
      let m = counts.len();
      if m > 2 {
        x += counts[m - 2] as i64;
      }
      counts.push(x as u32);
    }
    Ok(Rle { size, counts })
  }

  /// 以压缩字符串形式导出为 JSON 对象
  pub fn to_object(&self) -> RleObject {
    RleObject {
      size: self.size,
      counts: RleCounts::Compressed(self.to_compressed_string()),
    }
  }
}

/// 框交并比矩阵，框格式为 `[x, y, w, h]`
pub fn bbox_iou(dt: &[[f64; 4]], gt: &[[f64; 4]], iscrowd: &[bool]) -> Vec<Vec<f64>> {
  dt.iter()
    .map(|d| {
      let dt_area = d[2] * d[3];
      gt.iter()
        .enumerate()
        .map(|(j, g)| {
          let iw = ((d[0] + d[2]).min(g[0] + g[2]) - d[0].max(g[0])).max(0.0);
          let ih = ((d[1] + d[3]).min(g[1] + g[3]) - d[1].max(g[1])).max(0.0);
          let inter = iw * ih;
          let union = if iscrowd.get(j).copied().unwrap_or(false) {
            dt_area
          } else {
            dt_area + g[2] * g[3] - inter
          };
          if union > 0.0 { inter / union } else { 0.0 }
        })
        .collect()
    })
    .collect()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn rle_of(bits: &[u8], h: u32, w: u32) -> Rle {
    let mask: Vec<bool> = bits.iter().map(|&b| b != 0).collect();
    Rle::encode(&mask, h, w)
  }

  #[test]
  fn encode_starts_with_background_run() {
    assert_eq!(rle_of(&[1, 1, 0, 0, 0, 1], 2, 3).counts, vec![0, 2, 3, 1]);
    assert_eq!(rle_of(&[0; 6], 2, 3).counts, vec![6]);
  }

  #[test]
  fn area_counts_foreground_runs() {
    let rle = rle_of(&[0, 0, 0, 1, 1, 1, 0, 0, 1, 1, 0, 0], 3, 4);
    assert_eq!(rle.area(), 5);
    assert_eq!(rle.decode().iter().filter(|&&v| v).count(), 5);
  }

  #[test]
  fn bbox_spans_columns() {
    // 列 0: 000, 列 1: 111, 列 2: 001, 列 3: 100
    let rle = rle_of(&[0, 0, 0, 1, 1, 1, 0, 0, 1, 1, 0, 0], 3, 4);
    assert_eq!(rle.to_bbox(), [1.0, 0.0, 3.0, 3.0]);
  }

  #[test]
  fn merge_union_and_intersection() {
    let a = rle_of(&[0, 0, 0, 1, 1, 1, 1, 1, 0, 0, 0, 0], 3, 4);
    let b = rle_of(&[0, 0, 0, 0, 1, 1, 1, 1, 1, 0, 0, 0], 3, 4);
    let union = Rle::merge(&[a.clone(), b.clone()], false).unwrap();
    let inter = Rle::merge(&[a, b], true).unwrap();
    assert_eq!(union.area(), 6);
    assert_eq!(inter.area(), 4);
    assert_eq!(
      inter.decode(),
      rle_of(&[0, 0, 0, 0, 1, 1, 1, 1, 0, 0, 0, 0], 3, 4).decode()
    );
  }

  #[test]
  fn merge_rejects_different_sizes() {
    let a = rle_of(&[1; 4], 2, 2);
    let b = rle_of(&[1; 6], 2, 3);
    assert_eq!(
      Rle::merge(&[a, b], true),
      Err(RleError::SizeMismatch([2, 2], [2, 3]))
    );
  }

  #[test]
  fn mask_iou_and_crowd_iou() {
    let d = rle_of(&[0, 0, 0, 1, 1, 1, 0, 0, 0, 0, 0, 0], 3, 4);
    let g = rle_of(&[0, 0, 0, 0, 1, 1, 1, 0, 0, 0, 0, 0], 3, 4);
    let ious = Rle::iou(&[d.clone()], &[g.clone()], &[false]);
    assert!((ious[0][0] - 0.5).abs() < 1e-12);
    let crowd = Rle::iou(&[d], &[g], &[true]);
    assert!((crowd[0][0] - 2.0 / 3.0).abs() < 1e-12);
  }

  #[test]
  fn integer_box_rasterises_exactly() {
    let rle = Rle::from_bbox(&[1.0, 1.0, 3.0, 2.0], 6, 6);
    assert_eq!(rle.counts, vec![7, 2, 4, 2, 4, 2, 15]);
    assert_eq!(rle.area(), 6);
    assert_eq!(rle.to_bbox(), [1.0, 1.0, 3.0, 2.0]);
  }

  #[test]
  fn compressed_string_uses_delta_from_third_count() {
    let rle = Rle {
      size: [100, 100],
      counts: vec![100, 200, 9000, 180, 520],
    };
    let s = rle.to_compressed_string();
    let decoded = Rle::from_compressed_string(&s, [100, 100]).unwrap();
    assert_eq!(decoded, rle);
    // 小计数直接编码为一个字符
    assert_eq!(Rle { size: [2, 2], counts: vec![1, 2, 1] }.to_compressed_string(), "121");
  }

  #[test]
  fn compressed_string_rejects_control_characters() {
    assert_eq!(
      Rle::from_compressed_string("1\n", [2, 2]),
      Err(RleError::InvalidString('\n'))
    );
  }

  #[test]
  fn overlong_count_in_compressed_string_is_rejected() {
    assert_eq!(
      Rle::from_compressed_string("oooooooooooooo0", [4, 4]),
      Err(RleError::CountTooLong(12))
    );
  }

  #[test]
  fn empty_runs_do_not_contribute_to_bbox() {
    let empty = Rle {
      size: [4, 4],
      counts: vec![0, 0, 16],
    };
    assert_eq!(empty.to_bbox(), [0.0; 4]);

    // 开头的空游程之后，列 1 的第 1..3 行为前景
    let shifted = Rle {
      size: [4, 4],
      counts: vec![0, 0, 5, 2, 9],
    };
    assert_eq!(shifted.to_bbox(), [1.0, 1.0, 1.0, 2.0]);
    let canonical = Rle::encode(&shifted.decode(), 4, 4);
    assert_eq!(canonical.counts, vec![5, 2, 9]);
    assert_eq!(canonical.to_bbox(), shifted.to_bbox());
  }

  #[test]
  fn mismatched_sizes_get_negative_iou() {
    let d = rle_of(&[1, 1, 0, 0], 2, 2);
    let g = rle_of(&[1, 1, 0, 0, 0, 0], 2, 3);
    let g2 = rle_of(&[1, 0, 0, 0], 2, 2);
    let ious = Rle::iou(&[d], &[g, g2], &[false, false]);
    assert_eq!(ious[0][0], -1.0);
    assert!((ious[0][1] - 0.5).abs() < 1e-12);
  }

  #[test]
  fn segmentation_accepts_both_json_forms() {
    let polygons: Segmentation = serde_json::from_str("[[1, 1, 1, 3, 4, 3, 4, 1]]").unwrap();
    assert_eq!(polygons.to_rle(6, 6).unwrap().area(), 6);

    let object = Rle::from_bbox(&[0.0, 0.0, 2.0, 2.0], 4, 4).to_object();
    let json = serde_json::to_string(&Segmentation::Rle(object)).unwrap();
    let parsed: Segmentation = serde_json::from_str(&json).unwrap();
    assert_eq!(parsed.to_rle(4, 4).unwrap().area(), 4);

    let raw: Segmentation = serde_json::from_str(r#"{"size": [2, 2], "counts": [1, 2, 1]}"#).unwrap();
    assert_eq!(raw.to_rle(2, 2).unwrap().area(), 2);
  }

  #[test]
  fn box_iou_matrix() {
    let ious = bbox_iou(&[[0.0, 0.0, 10.0, 10.0]], &[[5.0, 5.0, 10.0, 10.0]], &[false]);
    assert!((ious[0][0] - 25.0 / 175.0).abs() < 1e-12);
  }
}
