// 该文件是 Shanan （山南西风） 项目的一部分。
// src/loss.rs - 检测损失
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

//! 框回归、分类与分布焦点三项损失。

pub mod assign;
pub mod dfl;

use std::collections::BTreeMap;
use std::ops::{AddAssign, Div};

use ndarray::s;
use serde::Serialize;
use thiserror::Error;

use crate::{
  geometry::{IouKind, bbox_iou, bbox_to_dist},
  model::Predictions,
  target::{Label, TargetBatch, TargetError, build_targets},
};

use self::assign::TaskAlignedAssigner;

const BCE_EPS: f32 = 1e-6;

#[derive(Error, Debug, PartialEq)]
pub enum LossError {
  #[error("目标批大小 {targets} 与预测批大小 {preds} 不一致")]
  BatchMismatch { targets: usize, preds: usize },
  #[error("预测分布每边 {actual} 个区间, 配置为 {expected}")]
  RegMaxMismatch { expected: usize, actual: usize },
  #[error("第 {image} 张图像的真值类别 {class_id} 超出类别数 {num_classes}")]
  ClassOutOfRange {
    image: usize,
    class_id: u32,
    num_classes: usize,
  },
  #[error("构建目标失败: {0}")]
  Target(#[from] TargetError),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossConfig {
  pub alpha: f32,
  pub beta: f32,
  pub topk: usize,
  pub box_w: f32,
  pub cls_w: f32,
  pub dfl_w: f32,
  pub reg_max: usize,
  pub box_loss: IouKind,
}

/// 未加权的三项损失，用于日志
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LossItems {
  pub box_loss: f32,
  pub cls_loss: f32,
  pub dfl_loss: f32,
}

impl LossItems {
  pub const NAMES: [&'static str; 3] = ["box_loss", "cls_loss", "dfl_loss"];

  pub fn values(&self) -> [f32; 3] {
    [self.box_loss, self.cls_loss, self.dfl_loss]
  }

  /// 以 `prefix` 为前缀的损失字典，例如 `val/box_loss`
  pub fn to_map(&self, prefix: &str) -> BTreeMap<String, f32> {
    Self::NAMES
      .iter()
      .zip(self.values())
      .map(|(k, v)| (format!("{prefix}{k}"), v))
      .collect()
  }
}

impl AddAssign for LossItems {
  fn add_assign(&mut self, rhs: Self) {
    self.box_loss += rhs.box_loss;
    self.cls_loss += rhs.cls_loss;
    self.dfl_loss += rhs.dfl_loss;
  }
}

impl Div<f32> for LossItems {
  type Output = Self;

  fn div(self, rhs: f32) -> Self {
    Self {
      box_loss: self.box_loss / rhs,
      cls_loss: self.cls_loss / rhs,
      dfl_loss: self.dfl_loss / rhs,
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LossOutput {
  /// 加权求和后的标量
  pub total: f32,
  pub items: LossItems,
}

fn bce(p: f32, t: f32) -> f32 {
  let p = p.clamp(BCE_EPS, 1.0 - BCE_EPS);
  -(t * p.ln() + (1.0 - t) * (1.0 - p).ln())
}

pub struct LossEngine {
  config: LossConfig,
  assigner: TaskAlignedAssigner,
}

impl LossEngine {
  pub fn new(config: LossConfig) -> Self {
    let assigner = TaskAlignedAssigner {
      topk: config.topk,
      alpha: config.alpha,
      beta: config.beta,
    };
    Self { config, assigner }
  }

  pub fn config(&self) -> &LossConfig {
    &self.config
  }

  /// 由扁平标签直接计算损失，`scale` 把相对坐标映射到输入图像坐标
  pub fn compute(
    &self,
    labels: &[Label],
    preds: &Predictions,
    scale: [f32; 4],
  ) -> Result<LossOutput, LossError> {
    let targets = build_targets(labels, preds.batch_size(), scale)?;
    self.forward(&targets, preds)
  }

  pub fn forward(&self, targets: &TargetBatch, preds: &Predictions) -> Result<LossOutput, LossError> {
    if targets.batch_size() != preds.batch_size() {
      return Err(LossError::BatchMismatch {
        targets: targets.batch_size(),
        preds: preds.batch_size(),
      });
    }
    let reg_max = self.config.reg_max;
    if preds.reg_max() != reg_max {
      return Err(LossError::RegMaxMismatch {
        expected: reg_max,
        actual: preds.reg_max(),
      });
    }

    let num_anchors = preds.num_anchors();
    let num_classes = preds.num_classes();
    let dist_max = reg_max as f32 - 1.0 - 0.01;
    let anchors: Vec<[f32; 2]> = (0..num_anchors).map(|a| preds.scaled_anchor(a)).collect();

    let mut box_sum = 0.0f32;
    let mut cls_sum = 0.0f32;
    let mut dfl_sum = 0.0f32;
    let mut score_sum = 0.0f32;

    for image in 0..preds.batch_size() {
      let gts = targets.instances(image);
      if let Some(&(class_id, _)) = gts.iter().find(|(c, _)| *c as usize >= num_classes) {
        return Err(LossError::ClassOutOfRange {
          image,
          class_id,
          num_classes,
        });
      }

      let pred_boxes: Vec<[f32; 4]> = (0..num_anchors)
        .map(|a| preds.scaled_box(image, a))
        .collect();
      let scores = preds.scores().slice(s![image, .., ..]);
      let assignment = self.assigner.assign(scores, &pred_boxes, &anchors, &gts);
      score_sum += assignment.score_sum();

      for a in 0..num_anchors {
        let winner = assignment.winner(a);
        let target_class = winner.map(|g| gts[g].0 as usize);
        let target_score = assignment.target_scores[a];
        for c in 0..num_classes {
          let t = if target_class == Some(c) { target_score } else { 0.0 };
          cls_sum += bce(scores[[a, c]], t);
        }

        let Some(g) = winner else { continue };
        let gt = gts[g].1;
        box_sum += (1.0 - bbox_iou(&pred_boxes[a], &gt, self.config.box_loss)) * target_score;

        let stride = preds.strides()[a];
        let grid_anchor = [preds.anchors()[[a, 0]], preds.anchors()[[a, 1]]];
        let gt_grid = [gt[0] / stride, gt[1] / stride, gt[2] / stride, gt[3] / stride];
        let target = bbox_to_dist(grid_anchor, &gt_grid, dist_max);
        let logits = preds.dist().slice(s![image, a, ..]);
        dfl_sum += dfl::dfl_loss(logits, target, reg_max) * target_score;
      }
    }

    let norm = score_sum.max(1.0);
    let items = LossItems {
      box_loss: box_sum / norm,
      cls_loss: cls_sum / norm,
      dfl_loss: dfl_sum / norm,
    };
    let total = items.box_loss * self.config.box_w
      + items.cls_loss * self.config.cls_w
      + items.dfl_loss * self.config.dfl_w;

    Ok(LossOutput { total, items })
  }
}
