// 该文件是 Shanan （山南西风） 项目的一部分。
// src/geometry.rs - 边界框几何
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

//! 边界框编码转换与重叠度计算。
//!
//! 中心格式为 `[cx, cy, w, h]`，角点格式为 `[x1, y1, x2, y2]`。

use ndarray::{Array2, ArrayView2, ArrayViewMut2};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// 防止除零的最小分母
pub const EPS: f32 = 1e-7;

#[derive(Error, Debug, PartialEq)]
pub enum GeometryError {
  #[error("边界框集合列数必须为 4, 实际为 {0}")]
  BadBoxWidth(usize),
  #[error("输出矩阵形状不匹配: 期望 {expected:?}, 实际 {actual:?}")]
  BadOutputShape {
    expected: (usize, usize),
    actual: (usize, usize),
  },
}

/// 中心格式转角点格式
pub fn to_corner_form(b: &[f32; 4]) -> [f32; 4] {
  let [cx, cy, w, h] = *b;
  [cx - w / 2.0, cy - h / 2.0, cx + w / 2.0, cy + h / 2.0]
}

/// 角点格式转中心格式
pub fn to_center_form(b: &[f32; 4]) -> [f32; 4] {
  let [x1, y1, x2, y2] = *b;
  [(x1 + x2) / 2.0, (y1 + y2) / 2.0, x2 - x1, y2 - y1]
}

/// 角点格式框的面积，宽或高非正时为 0
pub fn area(b: &[f32; 4]) -> f32 {
  let w = b[2] - b[0];
  let h = b[3] - b[1];
  if w <= 0.0 || h <= 0.0 { 0.0 } else { w * h }
}

fn intersection(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let w = (a[2].min(b[2]) - a[0].max(b[0])).max(0.0);
  let h = (a[3].min(b[3]) - a[1].max(b[1])).max(0.0);
  w * h
}

/// 两个角点格式框的交并比，结果位于 [0, 1]
pub fn box_iou(a: &[f32; 4], b: &[f32; 4]) -> f32 {
  let inter = intersection(a, b);
  let union = area(a) + area(b) - inter;
  (inter / union.max(EPS)).clamp(0.0, 1.0)
}

/// 交并比的变体，用于回归损失
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IouKind {
  Iou,
  Giou,
  Diou,
  #[default]
  Ciou,
}

/// 按指定变体计算两个角点格式框的重叠度。
///
/// GIoU/DIoU/CIoU 的取值可以为负，只有 `IouKind::Iou` 保证位于 [0, 1]。
pub fn bbox_iou(a: &[f32; 4], b: &[f32; 4], kind: IouKind) -> f32 {
  let iou = box_iou(a, b);
  if kind == IouKind::Iou {
    return iou;
  }

  // 最小外接框
  let cw = a[2].max(b[2]) - a[0].min(b[0]);
  let ch = a[3].max(b[3]) - a[1].min(b[1]);

  match kind {
    IouKind::Iou => iou,
    IouKind::Giou => {
      let c_area = cw * ch + EPS;
      let union = area(a) + area(b) - intersection(a, b);
      iou - (c_area - union) / c_area
    }
    IouKind::Diou | IouKind::Ciou => {
      let c2 = cw * cw + ch * ch + EPS;
      let dx = b[0] + b[2] - a[0] - a[2];
      let dy = b[1] + b[3] - a[1] - a[3];
      let rho2 = (dx * dx + dy * dy) / 4.0;
      if kind == IouKind::Diou {
        return iou - rho2 / c2;
      }
      let w1 = (a[2] - a[0]).max(0.0);
      let h1 = (a[3] - a[1]).max(0.0) + EPS;
      let w2 = (b[2] - b[0]).max(0.0);
      let h2 = (b[3] - b[1]).max(0.0) + EPS;
      let v = (4.0 / (std::f32::consts::PI * std::f32::consts::PI))
        * ((w2 / h2).atan() - (w1 / h1).atan()).powi(2);
      let alpha = v / (v - iou + (1.0 + EPS));
      iou - (rho2 / c2 + v * alpha)
    }
  }
}

fn check_boxes(boxes: &ArrayView2<f32>) -> Result<(), GeometryError> {
  if boxes.ncols() != 4 {
    return Err(GeometryError::BadBoxWidth(boxes.ncols()));
  }
  Ok(())
}

fn row(boxes: &ArrayView2<f32>, i: usize) -> [f32; 4] {
  [boxes[[i, 0]], boxes[[i, 1]], boxes[[i, 2]], boxes[[i, 3]]]
}

/// 两组角点格式框的两两交并比，返回 M×N 矩阵
pub fn iou(a: ArrayView2<f32>, b: ArrayView2<f32>) -> Result<Array2<f32>, GeometryError> {
  let mut out = Array2::zeros((a.nrows(), b.nrows()));
  iou_into(a, b, out.view_mut())?;
  Ok(out)
}

/// 同 [`iou`]，但写入调用者提供的缓冲区，热循环中可以复用内存
pub fn iou_into(
  a: ArrayView2<f32>,
  b: ArrayView2<f32>,
  mut out: ArrayViewMut2<f32>,
) -> Result<(), GeometryError> {
  check_boxes(&a)?;
  check_boxes(&b)?;
  let expected = (a.nrows(), b.nrows());
  if out.dim() != expected {
    return Err(GeometryError::BadOutputShape {
      expected,
      actual: out.dim(),
    });
  }

  for i in 0..a.nrows() {
    let ra = row(&a, i);
    for j in 0..b.nrows() {
      out[[i, j]] = box_iou(&ra, &row(&b, j));
    }
  }
  Ok(())
}

/// 角点格式框转为锚点到四条边的距离 `(l, t, r, b)`，并截断到 `[0, max]`
pub fn bbox_to_dist(anchor: [f32; 2], b: &[f32; 4], max: f32) -> [f32; 4] {
  [
    (anchor[0] - b[0]).clamp(0.0, max),
    (anchor[1] - b[1]).clamp(0.0, max),
    (b[2] - anchor[0]).clamp(0.0, max),
    (b[3] - anchor[1]).clamp(0.0, max),
  ]
}

/// 锚点距离 `(l, t, r, b)` 转回角点格式框
pub fn dist_to_bbox(anchor: [f32; 2], d: &[f32; 4]) -> [f32; 4] {
  [
    anchor[0] - d[0],
    anchor[1] - d[1],
    anchor[0] + d[2],
    anchor[1] + d[3],
  ]
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  #[test]
  fn corner_center_conversion() {
    let c = [3.0, 3.0, 2.0, 4.0];
    let xyxy = to_corner_form(&c);
    assert_eq!(xyxy, [2.0, 1.0, 4.0, 5.0]);
    assert_eq!(to_center_form(&xyxy), c);
  }

  #[test]
  fn iou_identity_disjoint_partial() {
    let a = [0.0, 0.0, 10.0, 10.0];
    assert_eq!(box_iou(&a, &a), 1.0);
    assert_eq!(box_iou(&a, &[20.0, 20.0, 30.0, 30.0]), 0.0);
    let partial = box_iou(&a, &[5.0, 5.0, 15.0, 15.0]);
    assert!((partial - 25.0 / 175.0).abs() < 1e-6);
  }

  #[test]
  fn degenerate_boxes_have_zero_iou() {
    let flat = [1.0, 1.0, 1.0, 5.0];
    let inverted = [5.0, 5.0, 3.0, 3.0];
    assert_eq!(area(&flat), 0.0);
    assert_eq!(area(&inverted), 0.0);
    assert_eq!(box_iou(&flat, &flat), 0.0);
    assert_eq!(box_iou(&inverted, &[0.0, 0.0, 10.0, 10.0]), 0.0);
  }

  #[test]
  fn iou_matrix_is_symmetric() {
    let a = array![[0.0, 0.0, 4.0, 4.0], [2.0, 2.0, 6.0, 6.0], [1.0, 0.0, 3.0, 9.0]];
    let b = array![[1.0, 1.0, 5.0, 5.0], [0.0, 0.0, 4.0, 4.0]];
    let ab = iou(a.view(), b.view()).unwrap();
    let ba = iou(b.view(), a.view()).unwrap();
    assert_eq!(ab.dim(), (3, 2));
    assert_eq!(ab, ba.t());
    assert!(ab.iter().all(|v| (0.0..=1.0).contains(v)));
    assert_eq!(ab[[0, 1]], 1.0);
  }

  #[test]
  fn iou_rejects_bad_shapes() {
    let a = array![[0.0, 0.0, 4.0]];
    let b = array![[0.0, 0.0, 4.0, 4.0]];
    assert_eq!(iou(a.view(), b.view()), Err(GeometryError::BadBoxWidth(3)));

    let mut out = Array2::zeros((2, 2));
    let err = iou_into(b.view(), b.view(), out.view_mut()).unwrap_err();
    assert!(matches!(err, GeometryError::BadOutputShape { .. }));
  }

  #[test]
  fn iou_variants_agree_on_identical_boxes() {
    let a = [1.0, 2.0, 5.0, 8.0];
    for kind in [IouKind::Iou, IouKind::Giou, IouKind::Diou, IouKind::Ciou] {
      assert!((bbox_iou(&a, &a, kind) - 1.0).abs() < 1e-5, "{kind:?}");
    }
  }

  #[test]
  fn penalised_variants_go_negative_for_distant_boxes() {
    let a = [0.0, 0.0, 1.0, 1.0];
    let b = [9.0, 9.0, 10.0, 10.0];
    assert_eq!(bbox_iou(&a, &b, IouKind::Iou), 0.0);
    assert!(bbox_iou(&a, &b, IouKind::Giou) < 0.0);
    assert!(bbox_iou(&a, &b, IouKind::Diou) < 0.0);
    assert!(bbox_iou(&a, &b, IouKind::Ciou) < 0.0);
  }

  #[test]
  fn distance_encoding_round_trips_inside_range() {
    let anchor = [2.5, 3.5];
    let b = [1.0, 2.0, 4.0, 6.0];
    let d = bbox_to_dist(anchor, &b, 10.0);
    assert_eq!(d, [1.5, 1.5, 1.5, 2.5]);
    assert_eq!(dist_to_bbox(anchor, &d), b);
    assert_eq!(bbox_to_dist(anchor, &b, 2.0)[3], 2.0);
  }
}
