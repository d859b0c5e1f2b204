// 该文件是 Shanan （山南西风） 项目的一部分。
// src/model.rs - 模型输出约定与检测结果
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use ndarray::{Array1, Array2, Array3, Axis, s};
use thiserror::Error;

use crate::{
  geometry::{dist_to_bbox, to_center_form},
  loss::dfl::decode_distribution,
};

/// 外部模型：给定一批输入，返回原始的网络输出
pub trait Model {
  type Input;
  type Error;

  fn infer(&self, input: &Self::Input) -> Result<Predictions, Self::Error>;
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DetectItem {
  pub class_id: u32,
  pub score: f32,
  pub bbox: [f32; 4], // [x_min, y_min, x_max, y_max]
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct DetectResult {
  pub items: Box<[DetectItem]>,
}

impl DetectResult {
  pub fn is_empty(&self) -> bool {
    self.items.is_empty()
  }

  pub fn len(&self) -> usize {
    self.items.len()
  }
}

impl From<Vec<DetectItem>> for DetectResult {
  fn from(items: Vec<DetectItem>) -> Self {
    Self {
      items: items.into_boxed_slice(),
    }
  }
}

#[derive(Error, Debug, PartialEq)]
pub enum PredictionError {
  #[error("{what} 的最后一维应为 {expected}, 实际为 {actual}")]
  BadWidth {
    what: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("{what} 的批大小为 {actual}, 与预测框的 {expected} 不一致")]
  BatchMismatch {
    what: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("{what} 的锚点数为 {actual}, 与预测框的 {expected} 不一致")]
  AnchorMismatch {
    what: &'static str,
    expected: usize,
    actual: usize,
  },
  #[error("分布输出宽度 {0} 不是 4 的整数倍或每边少于 2 个区间")]
  BadDistWidth(usize),
  #[error("类别数不能为 0")]
  NoClasses,
}

/// 检测头的一批原始输出。
///
/// - `boxes`: `[B, A, 4]`，网格单位的角点格式框，乘以步长得到图像坐标
/// - `scores`: `[B, A, C]`，每个类别的置信度（概率）
/// - `dist`: `[B, A, 4 * reg_max]`，按 `l, t, r, b` 顺序排列的分布 logits
/// - `anchors`: `[A, 2]`，网格单位的锚点中心
/// - `strides`: `[A]`，每个锚点所在特征层的步长
#[derive(Debug, Clone, PartialEq)]
pub struct Predictions {
  boxes: Array3<f32>,
  scores: Array3<f32>,
  dist: Array3<f32>,
  anchors: Array2<f32>,
  strides: Array1<f32>,
}

impl Predictions {
  pub fn new(
    boxes: Array3<f32>,
    scores: Array3<f32>,
    dist: Array3<f32>,
    anchors: Array2<f32>,
    strides: Array1<f32>,
  ) -> Result<Self, PredictionError> {
    let (b, a, w) = boxes.dim();
    if w != 4 {
      return Err(PredictionError::BadWidth {
        what: "pred_boxes",
        expected: 4,
        actual: w,
      });
    }
    for (what, actual) in [("pred_scores", scores.dim().0), ("pred_dist", dist.dim().0)] {
      if actual != b {
        return Err(PredictionError::BatchMismatch {
          what,
          expected: b,
          actual,
        });
      }
    }
    for (what, actual) in [
      ("pred_scores", scores.dim().1),
      ("pred_dist", dist.dim().1),
      ("anchors", anchors.nrows()),
      ("strides", strides.len()),
    ] {
      if actual != a {
        return Err(PredictionError::AnchorMismatch {
          what,
          expected: a,
          actual,
        });
      }
    }
    if anchors.ncols() != 2 {
      return Err(PredictionError::BadWidth {
        what: "anchors",
        expected: 2,
        actual: anchors.ncols(),
      });
    }
    if scores.dim().2 == 0 {
      return Err(PredictionError::NoClasses);
    }
    let dw = dist.dim().2;
    if dw % 4 != 0 || dw < 8 {
      return Err(PredictionError::BadDistWidth(dw));
    }

    Ok(Self {
      boxes,
      scores,
      dist,
      anchors,
      strides,
    })
  }

  /// 由分布 logits 解码出预测框，即分布的期望距离
  pub fn from_distribution(
    scores: Array3<f32>,
    dist: Array3<f32>,
    anchors: Array2<f32>,
    strides: Array1<f32>,
  ) -> Result<Self, PredictionError> {
    let (b, a, dw) = dist.dim();
    if dw % 4 != 0 || dw < 8 {
      return Err(PredictionError::BadDistWidth(dw));
    }
    if anchors.nrows() != a || anchors.ncols() != 2 {
      return Err(PredictionError::AnchorMismatch {
        what: "anchors",
        expected: a,
        actual: anchors.nrows(),
      });
    }
    let reg_max = dw / 4;
    let mut boxes = Array3::zeros((b, a, 4));
    for i in 0..b {
      for j in 0..a {
        let logits = dist.slice(s![i, j, ..]);
        let d = decode_distribution(logits, reg_max);
        let bbox = dist_to_bbox([anchors[[j, 0]], anchors[[j, 1]]], &d);
        for (k, v) in bbox.into_iter().enumerate() {
          boxes[[i, j, k]] = v;
        }
      }
    }
    Self::new(boxes, scores, dist, anchors, strides)
  }

  pub fn batch_size(&self) -> usize {
    self.boxes.dim().0
  }

  pub fn num_anchors(&self) -> usize {
    self.boxes.dim().1
  }

  pub fn num_classes(&self) -> usize {
    self.scores.dim().2
  }

  pub fn reg_max(&self) -> usize {
    self.dist.dim().2 / 4
  }

  pub fn boxes(&self) -> &Array3<f32> {
    &self.boxes
  }

  pub fn scores(&self) -> &Array3<f32> {
    &self.scores
  }

  pub fn dist(&self) -> &Array3<f32> {
    &self.dist
  }

  pub fn anchors(&self) -> &Array2<f32> {
    &self.anchors
  }

  pub fn strides(&self) -> &Array1<f32> {
    &self.strides
  }

  /// 第 `image` 张图像第 `anchor` 个锚点的图像坐标预测框
  pub fn scaled_box(&self, image: usize, anchor: usize) -> [f32; 4] {
    let s = self.strides[anchor];
    let r = self.boxes.slice(s![image, anchor, ..]);
    [r[0] * s, r[1] * s, r[2] * s, r[3] * s]
  }

  /// 锚点中心的图像坐标
  pub fn scaled_anchor(&self, anchor: usize) -> [f32; 2] {
    let s = self.strides[anchor];
    [self.anchors[[anchor, 0]] * s, self.anchors[[anchor, 1]] * s]
  }

  /// 拼接成 NMS 的输入 `[B, A, 4 + C]`：图像坐标的中心格式框加类别置信度
  pub fn candidates(&self) -> Array3<f32> {
    let (b, a, c) = self.scores.dim();
    let mut out = Array3::zeros((b, a, 4 + c));
    for i in 0..b {
      for j in 0..a {
        let center = to_center_form(&self.scaled_box(i, j));
        for (k, v) in center.into_iter().enumerate() {
          out[[i, j, k]] = v;
        }
      }
    }
    out
      .slice_mut(s![.., .., 4..])
      .assign(&self.scores.view());
    out
  }

  /// 取出单张图像的输出，批大小为 1
  pub fn image(&self, image: usize) -> Predictions {
    let take = |x: &Array3<f32>| x.select(Axis(0), &[image]);
    Predictions {
      boxes: take(&self.boxes),
      scores: take(&self.scores),
      dist: take(&self.dist),
      anchors: self.anchors.clone(),
      strides: self.strides.clone(),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::array;

  fn sample() -> Predictions {
    let boxes = array![[[0.0, 0.0, 1.0, 1.0], [1.0, 0.0, 2.0, 1.0]]];
    let scores = array![[[0.9, 0.1], [0.2, 0.7]]];
    let dist = Array3::zeros((1, 2, 8));
    let anchors = array![[0.5, 0.5], [1.5, 0.5]];
    let strides = array![4.0, 8.0];
    Predictions::new(boxes, scores, dist, anchors, strides).unwrap()
  }

  #[test]
  fn candidates_are_scaled_center_form() {
    let c = sample().candidates();
    assert_eq!(c.dim(), (1, 2, 6));
    assert_eq!(c.slice(s![0, 0, ..]).to_vec(), vec![2.0, 2.0, 4.0, 4.0, 0.9, 0.1]);
    assert_eq!(c.slice(s![0, 1, ..]).to_vec(), vec![12.0, 4.0, 8.0, 8.0, 0.2, 0.7]);
  }

  #[test]
  fn rejects_mismatched_anchor_counts() {
    let err = Predictions::new(
      Array3::zeros((1, 3, 4)),
      Array3::zeros((1, 3, 2)),
      Array3::zeros((1, 3, 8)),
      Array2::zeros((2, 2)),
      Array1::zeros(3),
    )
    .unwrap_err();
    assert_eq!(
      err,
      PredictionError::AnchorMismatch {
        what: "anchors",
        expected: 3,
        actual: 2
      }
    );
  }

  #[test]
  fn rejects_bad_distribution_width() {
    let err = Predictions::new(
      Array3::zeros((1, 1, 4)),
      Array3::zeros((1, 1, 2)),
      Array3::zeros((1, 1, 6)),
      Array2::zeros((1, 2)),
      Array1::zeros(1),
    )
    .unwrap_err();
    assert_eq!(err, PredictionError::BadDistWidth(6));
  }

  #[test]
  fn uniform_distribution_decodes_to_mean_distance() {
    // 4 个区间的均匀分布，期望为 1.5
    let p = Predictions::from_distribution(
      Array3::from_elem((1, 1, 1), 0.5),
      Array3::zeros((1, 1, 16)),
      array![[4.0, 4.0]],
      array![2.0],
    )
    .unwrap();
    let b = p.scaled_box(0, 0);
    for (got, want) in b.iter().zip([5.0, 5.0, 11.0, 11.0]) {
      assert!((got - want).abs() < 1e-5);
    }
    assert_eq!(p.reg_max(), 4);
  }
}
