// 该文件是 Shanan （山南西风） 项目的一部分。
// src/loss/assign.rs - 任务对齐的正样本分配
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

use ndarray::ArrayView2;

use crate::geometry::box_iou;

/// 未分配给任何真值的锚点
pub const BACKGROUND: i32 = -1;

const ASSIGN_EPS: f32 = 1e-9;

/// 一张图像的分配结果，按锚点索引
#[derive(Debug, Clone, PartialEq)]
pub struct Assignment {
  /// 每个锚点胜出的真值索引，背景为 [`BACKGROUND`]
  pub target_gt: Vec<i32>,
  /// 正样本的软目标分数，背景为 0
  pub target_scores: Vec<f32>,
}

impl Assignment {
  pub fn winner(&self, anchor: usize) -> Option<usize> {
    usize::try_from(self.target_gt[anchor]).ok()
  }

  pub fn num_foreground(&self) -> usize {
    self.target_gt.iter().filter(|&&g| g != BACKGROUND).count()
  }

  pub fn score_sum(&self) -> f32 {
    self.target_scores.iter().sum()
  }
}

/// 任务对齐分配器：`score^alpha * iou^beta` 作为对齐分数
#[derive(Debug, Clone, Copy)]
pub struct TaskAlignedAssigner {
  pub topk: usize,
  pub alpha: f32,
  pub beta: f32,
}

impl TaskAlignedAssigner {
  /// 为一张图像分配正样本。
  ///
  /// `scores` 为 `[A, C]` 的类别置信度，`pred_boxes` 与 `anchors` 均为图像坐标，
  /// `gts` 为该图像的有效真值 `(class_id, [x1, y1, x2, y2])`。
  /// 调用者保证 `class_id < C`。
  pub fn assign(
    &self,
    scores: ArrayView2<f32>,
    pred_boxes: &[[f32; 4]],
    anchors: &[[f32; 2]],
    gts: &[(u32, [f32; 4])],
  ) -> Assignment {
    let num_anchors = anchors.len();
    let mut assignment = Assignment {
      target_gt: vec![BACKGROUND; num_anchors],
      target_scores: vec![0.0; num_anchors],
    };
    if gts.is_empty() || num_anchors == 0 {
      return assignment;
    }

    // align[g][a] 与 overlaps[g][a]，锚点中心不在真值框内时为 None
    let mut align = vec![vec![None; num_anchors]; gts.len()];
    let mut overlaps = vec![vec![0.0f32; num_anchors]; gts.len()];
    for (g, (cls, gt)) in gts.iter().enumerate() {
      for a in 0..num_anchors {
        let [ax, ay] = anchors[a];
        let inside = (ax - gt[0]).min(ay - gt[1]).min(gt[2] - ax).min(gt[3] - ay);
        if inside <= ASSIGN_EPS {
          continue;
        }
        let iou = box_iou(&pred_boxes[a], gt);
        let score = scores[[a, *cls as usize]].max(0.0);
        overlaps[g][a] = iou;
        align[g][a] = Some(score.powf(self.alpha) * iou.powf(self.beta));
      }
    }

    // 每个真值取对齐分数最高的 topk 个候选锚点
    let mut best: Vec<Option<(usize, f32)>> = vec![None; num_anchors];
    for (g, row) in align.iter().enumerate() {
      let mut candidates: Vec<(usize, f32)> = row
        .iter()
        .enumerate()
        .filter_map(|(a, m)| m.map(|m| (a, m)))
        .collect();
      candidates.sort_by(|x, y| y.1.total_cmp(&x.1));
      for &(a, m) in candidates.iter().take(self.topk) {
        // 同一锚点被多个真值选中时取对齐分数最高者，分数相同保留先出现的真值
        if best[a].is_none_or(|(_, prev)| m > prev) {
          best[a] = Some((g, m));
        }
      }
    }

    // 按真值归一化：正样本中最大对齐分数映射到最大 IoU
    let mut max_align = vec![0.0f32; gts.len()];
    let mut max_overlap = vec![0.0f32; gts.len()];
    for (a, b) in best.iter().enumerate() {
      if let Some((g, m)) = *b {
        max_align[g] = max_align[g].max(m);
        max_overlap[g] = max_overlap[g].max(overlaps[g][a]);
      }
    }

    for (a, b) in best.into_iter().enumerate() {
      if let Some((g, m)) = b {
        assignment.target_gt[a] = g as i32;
        assignment.target_scores[a] = m * max_overlap[g] / (max_align[g] + ASSIGN_EPS);
      }
    }
    assignment
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::Array2;

  fn grid(n: usize, stride: f32) -> Vec<[f32; 2]> {
    let mut out = Vec::new();
    for y in 0..n {
      for x in 0..n {
        out.push([(x as f32 + 0.5) * stride, (y as f32 + 0.5) * stride]);
      }
    }
    out
  }

  fn unit_boxes(anchors: &[[f32; 2]], half: f32) -> Vec<[f32; 4]> {
    anchors
      .iter()
      .map(|&[x, y]| [x - half, y - half, x + half, y + half])
      .collect()
  }

  #[test]
  fn no_ground_truth_means_all_background() {
    let anchors = grid(3, 4.0);
    let boxes = unit_boxes(&anchors, 2.0);
    let scores = Array2::from_elem((9, 2), 0.5);
    let a = TaskAlignedAssigner { topk: 3, alpha: 1.0, beta: 1.0 }.assign(
      scores.view(),
      &boxes,
      &anchors,
      &[],
    );
    assert_eq!(a.num_foreground(), 0);
    assert_eq!(a.score_sum(), 0.0);
  }

  #[test]
  fn anchors_outside_ground_truth_are_never_positive() {
    let anchors = grid(3, 4.0);
    let boxes = unit_boxes(&anchors, 2.0);
    let scores = Array2::from_elem((9, 1), 0.9);
    let gt = (0, [0.0, 0.0, 8.0, 8.0]);
    let a = TaskAlignedAssigner { topk: 10, alpha: 1.0, beta: 1.0 }.assign(
      scores.view(),
      &boxes,
      &anchors,
      &[gt],
    );
    // 只有左上 2x2 的锚点中心落在真值框内
    let positives: Vec<usize> = (0..9).filter(|&i| a.winner(i).is_some()).collect();
    assert_eq!(positives, vec![0, 1, 3, 4]);
  }

  #[test]
  fn topk_limits_positives_per_ground_truth() {
    let anchors = grid(4, 4.0);
    let boxes = unit_boxes(&anchors, 2.0);
    let mut scores = Array2::from_elem((16, 1), 0.1);
    scores[[5, 0]] = 0.9;
    scores[[6, 0]] = 0.8;
    let gt = (0, [0.0, 0.0, 16.0, 16.0]);
    let a = TaskAlignedAssigner { topk: 2, alpha: 1.0, beta: 1.0 }.assign(
      scores.view(),
      &boxes,
      &anchors,
      &[gt],
    );
    assert_eq!(a.num_foreground(), 2);
    assert_eq!(a.winner(5), Some(0));
    assert_eq!(a.winner(6), Some(0));
    // 最佳锚点的软目标等于其与真值的 IoU
    let best_iou = box_iou(&boxes[5], &gt.1);
    assert!((a.target_scores[5] - best_iou).abs() < 1e-5);
    assert!(a.target_scores[6] < a.target_scores[5]);
  }

  #[test]
  fn shared_anchor_goes_to_highest_score() {
    let anchors = vec![[4.0, 4.0]];
    let boxes = vec![[2.0, 2.0, 6.0, 6.0]];
    let scores = Array2::from_shape_vec((1, 2), vec![0.2, 0.9]).unwrap();
    let gts = [(0, [0.0, 0.0, 8.0, 8.0]), (1, [1.0, 1.0, 7.0, 7.0])];
    let a = TaskAlignedAssigner { topk: 5, alpha: 1.0, beta: 1.0 }.assign(
      scores.view(),
      &boxes,
      &anchors,
      &gts,
    );
    assert_eq!(a.target_gt, vec![1]);
  }
}
