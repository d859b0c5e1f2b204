// 该文件是 Shanan （山南西风） 项目的一部分。
// src/nms.rs - 非极大值抑制
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

use ndarray::{ArrayView2, ArrayView3, s};
use thiserror::Error;

use crate::{
  geometry::{box_iou, to_corner_form},
  model::{DetectItem, DetectResult},
};

#[derive(Error, Debug, PartialEq)]
pub enum NmsError {
  #[error("候选行宽度 {0} 过小, 至少需要 4 个坐标和 1 个类别分数")]
  BadRowWidth(usize),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NmsConfig {
  /// 置信度阈值
  pub conf_t: f32,
  /// 一个候选框是否可以同时属于多个类别
  pub multi_label: bool,
  /// 参与抑制的候选框上限
  pub max_box: usize,
  /// 按类别平移的偏移量，使不同类别的框互不重叠
  pub max_wh: f32,
  /// IoU 阈值
  pub iou_t: f32,
  /// 每张图像输出的检测上限
  pub max_det: usize,
  /// 是否按置信度加权合并被抑制的框
  pub merge: bool,
  /// 跨类别抑制
  pub agnostic: bool,
}

#[derive(Debug, Clone, Copy)]
struct Candidate {
  bbox: [f32; 4],
  score: f32,
  class_id: u32,
}

pub struct Suppressor {
  config: NmsConfig,
}

impl Suppressor {
  pub fn new(config: NmsConfig) -> Self {
    Self { config }
  }

  pub fn config(&self) -> &NmsConfig {
    &self.config
  }

  /// 对一批图像分别做抑制，输入为 `[B, N, 4 + C]`
  pub fn run_batch(&self, candidates: ArrayView3<f32>) -> Result<Vec<DetectResult>, NmsError> {
    candidates
      .outer_iter()
      .map(|image| self.run(image))
      .collect()
  }

  /// 对一张图像做抑制。
  ///
  /// 每行为 `(cx, cy, w, h, score_0, .., score_{C-1})`，坐标为图像坐标。
  /// 输出为角点格式，按置信度降序排列。
  pub fn run(&self, candidates: ArrayView2<f32>) -> Result<DetectResult, NmsError> {
    let width = candidates.ncols();
    if width < 5 {
      return Err(NmsError::BadRowWidth(width));
    }

    let mut pool = self.filter(candidates);
    // 稳定排序，置信度相同时保留原有顺序
    pool.sort_by(|a, b| b.score.total_cmp(&a.score));
    pool.truncate(self.config.max_box);

    let offset_boxes: Vec<[f32; 4]> = pool
      .iter()
      .map(|c| {
        let off = if self.config.agnostic {
          0.0
        } else {
          c.class_id as f32 * self.config.max_wh
        };
        [
          c.bbox[0] + off,
          c.bbox[1] + off,
          c.bbox[2] + off,
          c.bbox[3] + off,
        ]
      })
      .collect();

    let mut suppressed = vec![false; pool.len()];
    let mut items = Vec::new();
    for i in 0..pool.len() {
      if items.len() >= self.config.max_det {
        break;
      }
      if suppressed[i] {
        continue;
      }

      let mut members = vec![i];
      for j in (i + 1)..pool.len() {
        if !suppressed[j] && box_iou(&offset_boxes[i], &offset_boxes[j]) > self.config.iou_t {
          suppressed[j] = true;
          members.push(j);
        }
      }

      let best = pool[i];
      let bbox = if self.config.merge && members.len() > 1 {
        weighted_box(&pool, &members)
      } else {
        best.bbox
      };
      items.push(DetectItem {
        class_id: best.class_id,
        score: best.score,
        bbox,
      });
    }

    Ok(items.into())
  }

  fn filter(&self, candidates: ArrayView2<f32>) -> Vec<Candidate> {
    let conf_t = self.config.conf_t;
    let mut pool = Vec::new();
    for row in candidates.outer_iter() {
      let bbox = to_corner_form(&[row[0], row[1], row[2], row[3]]);
      let scores = row.slice(s![4..]);
      if self.config.multi_label {
        for (c, &score) in scores.iter().enumerate() {
          if score >= conf_t {
            pool.push(Candidate {
              bbox,
              score,
              class_id: c as u32,
            });
          }
        }
      } else {
        // 多个类别分数相同时取编号最小的类别
        let mut best = (0usize, f32::NEG_INFINITY);
        for (c, &score) in scores.iter().enumerate() {
          if score > best.1 {
            best = (c, score);
          }
        }
        if best.1 >= conf_t {
          pool.push(Candidate {
            bbox,
            score: best.1,
            class_id: best.0 as u32,
          });
        }
      }
    }
    pool
  }
}

fn weighted_box(pool: &[Candidate], members: &[usize]) -> [f32; 4] {
  let total: f32 = members.iter().map(|&m| pool[m].score).sum();
  let mut out = [0.0f32; 4];
  for &m in members {
    for (o, v) in out.iter_mut().zip(pool[m].bbox) {
      *o += v * pool[m].score;
    }
  }
  out.map(|v| v / total.max(f32::EPSILON))
}

#[cfg(test)]
mod tests {
  use super::*;
  use ndarray::{Array2, Array3, array};

  fn config() -> NmsConfig {
    NmsConfig {
      conf_t: 0.25,
      multi_label: false,
      max_box: 30000,
      max_wh: 7680.0,
      iou_t: 0.5,
      max_det: 300,
      merge: false,
      agnostic: false,
    }
  }

  #[test]
  fn single_candidate_passes_through() {
    let c = array![[3.0, 3.0, 2.0, 2.0, 0.9, 0.1]];
    let out = Suppressor::new(config()).run(c.view()).unwrap();
    assert_eq!(
      out.items.to_vec(),
      vec![DetectItem {
        class_id: 0,
        score: 0.9,
        bbox: [2.0, 2.0, 4.0, 4.0]
      }]
    );
  }

  #[test]
  fn identical_boxes_keep_the_higher_confidence() {
    let c = array![[3.0, 3.0, 2.0, 2.0, 0.6], [3.0, 3.0, 2.0, 2.0, 0.8]];
    let out = Suppressor::new(config()).run(c.view()).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out.items[0].score, 0.8);
  }

  #[test]
  fn equal_confidence_keeps_input_order() {
    let c = array![[3.0, 3.0, 2.0, 2.0, 0.7], [3.2, 3.0, 2.0, 2.0, 0.7]];
    let out = Suppressor::new(config()).run(c.view()).unwrap();
    assert_eq!(out.len(), 1);
    assert_eq!(out.items[0].bbox, [2.0, 2.0, 4.0, 4.0]);

    let swapped = array![[3.2, 3.0, 2.0, 2.0, 0.7], [3.0, 3.0, 2.0, 2.0, 0.7]];
    let out = Suppressor::new(config()).run(swapped.view()).unwrap();
    assert_eq!(out.len(), 1);
    assert!((out.items[0].bbox[0] - 2.2).abs() < 1e-6);
  }

  #[test]
  fn merge_averages_by_confidence() {
    let c = array![[5.0, 5.0, 4.0, 4.0, 0.75], [5.5, 5.0, 4.0, 4.0, 0.25]];
    let out = Suppressor::new(NmsConfig { merge: true, ..config() })
      .run(c.view())
      .unwrap();
    assert_eq!(out.len(), 1);
    let b = out.items[0].bbox;
    assert!((b[0] - 3.125).abs() < 1e-5);
    assert!((b[2] - 7.125).abs() < 1e-5);
    assert!((b[1] - 3.0).abs() < 1e-5);
    assert_eq!(out.items[0].score, 0.75);
  }

  #[test]
  fn different_classes_do_not_suppress_each_other() {
    let c = array![[3.0, 3.0, 2.0, 2.0, 0.9, 0.0], [3.0, 3.0, 2.0, 2.0, 0.0, 0.8]];
    let per_class = Suppressor::new(config()).run(c.view()).unwrap();
    assert_eq!(per_class.len(), 2);

    let agnostic = Suppressor::new(NmsConfig { agnostic: true, ..config() })
      .run(c.view())
      .unwrap();
    assert_eq!(agnostic.len(), 1);
    assert_eq!(agnostic.items[0].class_id, 0);
  }

  #[test]
  fn multi_label_emits_each_class_above_threshold() {
    let c = array![[3.0, 3.0, 2.0, 2.0, 0.9, 0.6, 0.1]];
    let single = Suppressor::new(config()).run(c.view()).unwrap();
    assert_eq!(single.len(), 1);
    let multi = Suppressor::new(NmsConfig { multi_label: true, ..config() })
      .run(c.view())
      .unwrap();
    let classes: Vec<u32> = multi.items.iter().map(|d| d.class_id).collect();
    assert_eq!(classes, vec![0, 1]);
  }

  #[test]
  fn low_confidence_and_empty_inputs_give_empty_results() {
    let c = array![[3.0, 3.0, 2.0, 2.0, 0.1]];
    assert!(Suppressor::new(config()).run(c.view()).unwrap().is_empty());
    let none = Array2::<f32>::zeros((0, 6));
    assert!(Suppressor::new(config()).run(none.view()).unwrap().is_empty());
  }

  #[test]
  fn caps_are_respected() {
    // 10 个互不重叠的框
    let c = Array2::from_shape_fn((10, 5), |(i, k)| match k {
      0 => i as f32 * 10.0 + 5.0,
      1 => 5.0,
      2 | 3 => 4.0,
      _ => 0.3 + i as f32 * 0.05,
    });
    let capped = Suppressor::new(NmsConfig { max_det: 3, ..config() })
      .run(c.view())
      .unwrap();
    assert_eq!(capped.len(), 3);
    let scores: Vec<f32> = capped.items.iter().map(|d| d.score).collect();
    assert!(scores.windows(2).all(|w| w[0] >= w[1]));

    let truncated = Suppressor::new(NmsConfig { max_box: 4, ..config() })
      .run(c.view())
      .unwrap();
    assert_eq!(truncated.len(), 4);
    assert!(truncated.items.iter().all(|d| d.score >= 0.3 + 6.0 * 0.05 - 1e-6));
  }

  #[test]
  fn batch_runs_each_image_independently() {
    let mut c = Array3::zeros((2, 2, 5));
    c[[0, 0, 0]] = 3.0;
    c[[0, 0, 1]] = 3.0;
    c[[0, 0, 2]] = 2.0;
    c[[0, 0, 3]] = 2.0;
    c[[0, 0, 4]] = 0.9;
    let out = Suppressor::new(config()).run_batch(c.view()).unwrap();
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].len(), 1);
    assert!(out[1].is_empty());
  }

  #[test]
  fn rejects_rows_without_scores() {
    let c = Array2::<f32>::zeros((1, 4));
    assert_eq!(
      Suppressor::new(config()).run(c.view()),
      Err(NmsError::BadRowWidth(4))
    );
  }
}
