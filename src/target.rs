// 该文件是 Shanan （山南西风） 项目的一部分。
// src/target.rs - 训练目标构建
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

use ndarray::{Array2, Array3, ArrayView3, s};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::geometry::to_corner_form;

#[derive(Error, Debug, PartialEq)]
pub enum TargetError {
  #[error("标签行长度必须为 6, 实际为 {0}")]
  BadRowWidth(usize),
  #[error("图像索引无效: {0}")]
  BadImageIndex(f32),
  #[error("类别编号无效: {0}")]
  BadClassId(f32),
  #[error("图像索引 {index} 超出批大小 {batch_size}")]
  ImageIndexOutOfRange { index: usize, batch_size: usize },
}

/// 一个真值实例，坐标为相对于图像的中心格式 `[cx, cy, w, h]`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Label {
  pub image_index: usize,
  pub class_id: u32,
  pub bbox: [f32; 4],
}

fn exact_index(v: f32) -> Option<u32> {
  if v.is_finite() && v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f32 {
    Some(v as u32)
  } else {
    None
  }
}

impl Label {
  /// 从数据集的扁平行 `(image_index, class_id, cx, cy, w, h)` 解析
  pub fn from_row(row: &[f32]) -> Result<Self, TargetError> {
    if row.len() != 6 {
      return Err(TargetError::BadRowWidth(row.len()));
    }
    let image_index = exact_index(row[0]).ok_or(TargetError::BadImageIndex(row[0]))?;
    let class_id = exact_index(row[1]).ok_or(TargetError::BadClassId(row[1]))?;
    Ok(Self {
      image_index: image_index as usize,
      class_id,
      bbox: [row[2], row[3], row[4], row[5]],
    })
  }
}

/// 稠密的目标张量 `[batch_size, max_instances, 5]`，每个槽位为 `(class_id, x1, y1, x2, y2)`
#[derive(Debug, Clone, PartialEq)]
pub struct TargetBatch {
  data: Array3<f32>,
}

impl TargetBatch {
  pub fn batch_size(&self) -> usize {
    self.data.dim().0
  }

  pub fn max_instances(&self) -> usize {
    self.data.dim().1
  }

  pub fn is_empty(&self) -> bool {
    self.max_instances() == 0
  }

  pub fn view(&self) -> ArrayView3<'_, f32> {
    self.data.view()
  }

  /// 槽位是否为真实目标。全零的填充行在这里被过滤
  pub fn mask(&self) -> Array2<bool> {
    let (b, m, _) = self.data.dim();
    Array2::from_shape_fn((b, m), |(i, j)| {
      self.data.slice(s![i, j, 1..5]).sum() > 0.0
    })
  }

  /// 第 `image` 张图像中的有效实例 `(class_id, [x1, y1, x2, y2])`
  pub fn instances(&self, image: usize) -> Vec<(u32, [f32; 4])> {
    self
      .data
      .slice(s![image, .., ..])
      .outer_iter()
      .filter(|r| r.slice(s![1..5]).sum() > 0.0)
      .map(|r| (r[0] as u32, [r[1], r[2], r[3], r[4]]))
      .collect()
  }
}

/// 将扁平的标签序列按图像重新分组为稠密目标张量。
///
/// 坐标先乘以 `scale`（通常为 `[w, h, w, h]`），再转换为角点格式。
/// 同一图像内的标签按出现顺序占用槽位，不足的尾部补零。
pub fn build_targets(
  labels: &[Label],
  batch_size: usize,
  scale: [f32; 4],
) -> Result<TargetBatch, TargetError> {
  let mut counts = vec![0usize; batch_size];
  for label in labels {
    if label.image_index >= batch_size {
      return Err(TargetError::ImageIndexOutOfRange {
        index: label.image_index,
        batch_size,
      });
    }
    counts[label.image_index] += 1;
  }

  let max_instances = counts.iter().copied().max().unwrap_or(0);
  let mut data = Array3::zeros((batch_size, max_instances, 5));
  let mut cursor = vec![0usize; batch_size];

  for label in labels {
    let b = label.image_index;
    let slot = cursor[b];
    cursor[b] += 1;

    let scaled = [
      label.bbox[0] * scale[0],
      label.bbox[1] * scale[1],
      label.bbox[2] * scale[2],
      label.bbox[3] * scale[3],
    ];
    let xyxy = to_corner_form(&scaled);
    data[[b, slot, 0]] = label.class_id as f32;
    for (k, v) in xyxy.into_iter().enumerate() {
      data[[b, slot, k + 1]] = v;
    }
  }

  Ok(TargetBatch { data })
}

#[cfg(test)]
mod tests {
  use super::*;

  fn label(image_index: usize, class_id: u32, bbox: [f32; 4]) -> Label {
    Label {
      image_index,
      class_id,
      bbox,
    }
  }

  #[test]
  fn empty_labels_give_zero_width_batch() {
    let t = build_targets(&[], 3, [1.0; 4]).unwrap();
    assert_eq!(t.view().dim(), (3, 0, 5));
    assert!(t.is_empty());
  }

  #[test]
  fn one_label_per_image() {
    let labels = [
      label(0, 1, [0.5, 0.5, 0.2, 0.2]),
      label(1, 0, [0.25, 0.25, 0.1, 0.1]),
    ];
    let t = build_targets(&labels, 2, [10.0, 10.0, 10.0, 10.0]).unwrap();
    assert_eq!(t.view().dim(), (2, 1, 5));
    assert!(t.mask().iter().all(|&m| m));
    assert_eq!(t.instances(0), vec![(1, [4.0, 4.0, 6.0, 6.0])]);
  }

  #[test]
  fn pads_images_with_fewer_instances() {
    let labels = [
      label(0, 4, [0.05, 0.05, 0.05, 0.05]),
      label(0, 4, [0.1, 0.03, 0.03, 0.05]),
      label(2, 1, [0.5, 0.5, 0.1, 0.1]),
      label(2, 1, [0.6, 0.6, 0.1, 0.1]),
      label(2, 1, [0.7, 0.7, 0.1, 0.1]),
    ];
    let t = build_targets(&labels, 4, [20.0, 10.0, 20.0, 10.0]).unwrap();
    assert_eq!(t.view().dim(), (4, 3, 5));

    let mask = t.mask();
    assert_eq!(mask.row(0).to_vec(), vec![true, true, false]);
    assert_eq!(mask.row(1).to_vec(), vec![false, false, false]);
    assert_eq!(mask.row(2).to_vec(), vec![true, true, true]);
    assert_eq!(mask.row(3).to_vec(), vec![false, false, false]);
    assert!(t.view().slice(s![1, .., ..]).iter().all(|&v| v == 0.0));

    let (cls, b) = t.instances(0)[0];
    assert_eq!(cls, 4);
    assert!((b[0] - 0.5).abs() < 1e-6);
    assert!((b[1] - 0.25).abs() < 1e-6);
    assert!((b[2] - 1.5).abs() < 1e-6);
    assert!((b[3] - 0.75).abs() < 1e-6);
  }

  #[test]
  fn rejects_out_of_range_image_index() {
    let labels = [label(2, 0, [0.5, 0.5, 0.1, 0.1])];
    assert_eq!(
      build_targets(&labels, 2, [1.0; 4]),
      Err(TargetError::ImageIndexOutOfRange {
        index: 2,
        batch_size: 2
      })
    );
  }

  #[test]
  fn parses_rows_by_exact_integer_index() {
    let l = Label::from_row(&[1.0, 3.0, 0.5, 0.5, 0.2, 0.2]).unwrap();
    assert_eq!(l.image_index, 1);
    assert_eq!(l.class_id, 3);
    assert_eq!(
      Label::from_row(&[0.5, 0.0, 0.5, 0.5, 0.2, 0.2]),
      Err(TargetError::BadImageIndex(0.5))
    );
    assert_eq!(
      Label::from_row(&[-1.0, 0.0, 0.5, 0.5, 0.2, 0.2]),
      Err(TargetError::BadImageIndex(-1.0))
    );
    assert_eq!(Label::from_row(&[0.0; 5]), Err(TargetError::BadRowWidth(5)));
  }

  #[test]
  fn input_is_not_mutated_and_output_is_deterministic() {
    let labels = vec![label(0, 0, [0.5, 0.5, 0.5, 0.5]), label(1, 2, [0.3, 0.3, 0.2, 0.2])];
    let before = labels.clone();
    let a = build_targets(&labels, 2, [8.0; 4]).unwrap();
    let b = build_targets(&labels, 2, [8.0; 4]).unwrap();
    assert_eq!(labels, before);
    assert_eq!(a, b);
  }
}
