// 该文件是 Shanan （山南西风） 项目的一部分。
// src/metric.rs - 检测精度统计
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

//! 多 IoU 阈值下的精确率、召回率与 mAP。
//!
//! 生命周期为 `Collecting -> Built -> Reported`：逐批 [`Metric::update`]，
//! 结束后调用一次 [`Metric::build`]，之后只读地输出报告。

use std::cell::Cell;
use std::collections::BTreeMap;
use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
  geometry::{GeometryError, iou, to_corner_form},
  model::DetectResult,
  target::Label,
};

#[derive(Error, Debug, PartialEq)]
pub enum MetricError {
  #[error("状态为 {0:?}, 只能在收集阶段更新")]
  NotCollecting(MetricState),
  #[error("统计已经构建过")]
  AlreadyBuilt,
  #[error("统计尚未构建")]
  NotBuilt,
  #[error("类别名称列表为空")]
  NoClasses,
  #[error("IoU 阈值列表为空")]
  NoThresholds,
  #[error("检测结果数 {detections} 与图像尺寸数 {sizes} 不一致")]
  BatchMismatch { detections: usize, sizes: usize },
  #[error("标签的图像索引 {index} 超出批大小 {batch_size}")]
  ImageIndexOutOfRange { index: usize, batch_size: usize },
  #[error("类别 {class_id} 超出类别数 {num_classes}")]
  ClassOutOfRange { class_id: u32, num_classes: usize },
  #[error("几何计算错误: {0}")]
  Geometry(#[from] GeometryError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricState {
  Collecting,
  Built,
  Reported,
}

/// 原图尺寸与送入网络的尺寸 `[w, h]`，用于撤销等比缩放加填充
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ImageSize {
  pub original: [u32; 2],
  pub resized: [u32; 2],
}

impl ImageSize {
  pub fn square(size: u32) -> Self {
    Self {
      original: [size, size],
      resized: [size, size],
    }
  }

  /// 缩放比例与两侧填充 `(gain, pad_x, pad_y)`
  fn letterbox(&self) -> (f32, f32, f32) {
    let [ow, oh] = self.original.map(|v| v as f32);
    let [rw, rh] = self.resized.map(|v| v as f32);
    let gain = (rw / ow).min(rh / oh);
    (gain, (rw - ow * gain) / 2.0, (rh - oh * gain) / 2.0)
  }

  /// 相对原图的中心格式框转换为相对网络输入的中心格式框
  pub fn to_input_relative(&self, b: &[f32; 4]) -> [f32; 4] {
    let [ow, oh] = self.original.map(|v| v as f32);
    let [rw, rh] = self.resized.map(|v| v as f32);
    let (gain, pad_x, pad_y) = self.letterbox();
    [
      (b[0] * ow * gain + pad_x) / rw,
      (b[1] * oh * gain + pad_y) / rh,
      b[2] * ow * gain / rw,
      b[3] * oh * gain / rh,
    ]
  }

  /// 把网络输入坐标系下的角点格式框映射回原图并截断到图像范围
  pub fn rescale_box(&self, b: &[f32; 4]) -> [f32; 4] {
    let [ow, oh] = self.original.map(|v| v as f32);
    let (gain, pad_x, pad_y) = self.letterbox();
    [
      ((b[0] - pad_x) / gain).clamp(0.0, ow),
      ((b[1] - pad_y) / gain).clamp(0.0, oh),
      ((b[2] - pad_x) / gain).clamp(0.0, ow),
      ((b[3] - pad_y) / gain).clamp(0.0, oh),
    ]
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct MetricConfig {
  pub iou_thresholds: Vec<f32>,
}

impl Default for MetricConfig {
  fn default() -> Self {
    Self {
      iou_thresholds: (0..10).map(|i| 0.5 + 0.05 * i as f32).collect(),
    }
  }
}

#[derive(Debug, Clone)]
struct Record {
  class_id: u32,
  score: f32,
  tp: Vec<bool>,
}

/// 单个类别的统计
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClassStats {
  pub class_id: u32,
  pub name: String,
  pub instances: usize,
  pub detections: usize,
  pub precision: f32,
  pub recall: f32,
  /// 每个阈值下的 AP
  pub ap: Vec<f32>,
}

impl ClassStats {
  /// 主阈值（第一个阈值）下的 AP
  pub fn ap_primary(&self) -> f32 {
    self.ap.first().copied().unwrap_or(0.0)
  }

  pub fn ap_mean(&self) -> f32 {
    if self.ap.is_empty() {
      0.0
    } else {
      self.ap.iter().sum::<f32>() / self.ap.len() as f32
    }
  }
}

/// 全部类别的汇总
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Overview {
  pub images: usize,
  pub instances: usize,
  pub precision: f32,
  pub recall: f32,
  pub map_primary: f32,
  pub map: f32,
}

const HEADER: [&str; 7] = ["class", "images", "instances", "P", "R", "mAP@p", "mAP"];

impl fmt::Display for Overview {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(
      f,
      "{:>20}{:>11}{:>11}{:>11}{:>11}{:>11}{:>11}",
      HEADER[0], HEADER[1], HEADER[2], HEADER[3], HEADER[4], HEADER[5], HEADER[6]
    )?;
    write!(
      f,
      "{:>20}{:>11}{:>11}{:>11.3}{:>11.3}{:>11.3}{:>11.3}",
      "all", self.images, self.instances, self.precision, self.recall, self.map_primary, self.map
    )
  }
}

/// 每个类别一行的明细表
pub struct Details<'a> {
  pub images: usize,
  pub classes: &'a [ClassStats],
}

impl fmt::Display for Details<'_> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{:>20}{:>11}{:>11}{:>11}{:>11}{:>11}{:>11}",
      HEADER[0], HEADER[1], HEADER[2], HEADER[3], HEADER[4], HEADER[5], HEADER[6]
    )?;
    for c in self.classes {
      write!(
        f,
        "\n{:>20}{:>11}{:>11}{:>11.3}{:>11.3}{:>11.3}{:>11.3}",
        c.name,
        self.images,
        c.instances,
        c.precision,
        c.recall,
        c.ap_primary(),
        c.ap_mean()
      )?;
    }
    Ok(())
  }
}

/// 精确率包络下的全点积分。`recall` 单调不减。
pub fn compute_ap(recall: &[f32], precision: &[f32]) -> f32 {
  let mut mrec = Vec::with_capacity(recall.len() + 2);
  mrec.push(0.0);
  mrec.extend_from_slice(recall);
  mrec.push(1.0);

  let mut mpre = Vec::with_capacity(precision.len() + 2);
  mpre.push(0.0);
  mpre.extend_from_slice(precision);
  mpre.push(0.0);

  for i in (0..mpre.len() - 1).rev() {
    mpre[i] = mpre[i].max(mpre[i + 1]);
  }

  (0..mrec.len() - 1)
    .filter(|&i| mrec[i + 1] != mrec[i])
    .map(|i| (mrec[i + 1] - mrec[i]) * mpre[i + 1])
    .sum()
}

/// 只对有真值的类别取平均
fn class_mean(classes: &[ClassStats], f: fn(&ClassStats) -> f32) -> f32 {
  let scored: Vec<f32> = classes.iter().filter(|c| c.instances > 0).map(f).collect();
  if scored.is_empty() {
    0.0
  } else {
    scored.iter().sum::<f32>() / scored.len() as f32
  }
}

pub struct Metric {
  names: Vec<String>,
  thresholds: Vec<f32>,
  state: Cell<MetricState>,
  records: Vec<Record>,
  instances: Vec<usize>,
  images: usize,
  classes: Vec<ClassStats>,
  metrics: BTreeMap<String, f32>,
}

impl Metric {
  pub fn new(names: Vec<String>, config: MetricConfig) -> Result<Self, MetricError> {
    if names.is_empty() {
      return Err(MetricError::NoClasses);
    }
    if config.iou_thresholds.is_empty() {
      return Err(MetricError::NoThresholds);
    }
    let instances = vec![0; names.len()];
    Ok(Self {
      names,
      thresholds: config.iou_thresholds,
      state: Cell::new(MetricState::Collecting),
      records: Vec::new(),
      instances,
      images: 0,
      classes: Vec::new(),
      metrics: BTreeMap::new(),
    })
  }

  pub fn state(&self) -> MetricState {
    self.state.get()
  }

  pub fn thresholds(&self) -> &[f32] {
    &self.thresholds
  }

  fn check_class(&self, class_id: u32) -> Result<(), MetricError> {
    if class_id as usize >= self.names.len() {
      return Err(MetricError::ClassOutOfRange {
        class_id,
        num_classes: self.names.len(),
      });
    }
    Ok(())
  }

  /// 累积一批图像。
  ///
  /// `labels` 为相对原图的中心格式真值，`detections` 为网络输入坐标系下的检测结果，
  /// 每张图像一个，`sizes` 与之一一对应。
  pub fn update(
    &mut self,
    labels: &[Label],
    detections: &[DetectResult],
    sizes: &[ImageSize],
  ) -> Result<(), MetricError> {
    if self.state() != MetricState::Collecting {
      return Err(MetricError::NotCollecting(self.state()));
    }
    if detections.len() != sizes.len() {
      return Err(MetricError::BatchMismatch {
        detections: detections.len(),
        sizes: sizes.len(),
      });
    }
    let batch_size = detections.len();
    for label in labels {
      if label.image_index >= batch_size {
        return Err(MetricError::ImageIndexOutOfRange {
          index: label.image_index,
          batch_size,
        });
      }
      self.check_class(label.class_id)?;
    }
    for item in detections.iter().flat_map(|d| d.items.iter()) {
      self.check_class(item.class_id)?;
    }

    for (image, (result, size)) in detections.iter().zip(sizes).enumerate() {
      let [ow, oh] = size.original.map(|v| v as f32);
      let gts: Vec<(u32, [f32; 4])> = labels
        .iter()
        .filter(|l| l.image_index == image)
        .map(|l| {
          let b = [l.bbox[0] * ow, l.bbox[1] * oh, l.bbox[2] * ow, l.bbox[3] * oh];
          (l.class_id, to_corner_form(&b))
        })
        .collect();
      for (c, _) in &gts {
        self.instances[*c as usize] += 1;
      }
      self.match_image(&gts, result, size)?;
      self.images += 1;
    }
    Ok(())
  }

  fn match_image(
    &mut self,
    gts: &[(u32, [f32; 4])],
    result: &DetectResult,
    size: &ImageSize,
  ) -> Result<(), MetricError> {
    let dets: Vec<(u32, f32, [f32; 4])> = result
      .items
      .iter()
      .map(|d| (d.class_id, d.score, size.rescale_box(&d.bbox)))
      .collect();

    let det_boxes = Array2::from_shape_fn((dets.len(), 4), |(i, k)| dets[i].2[k]);
    let gt_boxes = Array2::from_shape_fn((gts.len(), 4), |(i, k)| gts[i].1[k]);
    let ious = iou(det_boxes.view(), gt_boxes.view())?;

    // 置信度降序，相同置信度按插入顺序
    let mut order: Vec<usize> = (0..dets.len()).collect();
    order.sort_by(|&a, &b| dets[b].1.total_cmp(&dets[a].1));

    let mut tp = vec![vec![false; self.thresholds.len()]; dets.len()];
    for (k, &t) in self.thresholds.iter().enumerate() {
      let mut claimed = vec![false; gts.len()];
      for &d in &order {
        let mut best: Option<(usize, f32)> = None;
        for (g, (cls, _)) in gts.iter().enumerate() {
          if claimed[g] || *cls != dets[d].0 {
            continue;
          }
          let v = ious[[d, g]];
          if v >= t && best.is_none_or(|(_, b)| v > b) {
            best = Some((g, v));
          }
        }
        if let Some((g, _)) = best {
          claimed[g] = true;
          tp[d][k] = true;
        }
      }
    }

    for ((class_id, score, _), tp) in dets.into_iter().zip(tp) {
      self.records.push(Record {
        class_id,
        score,
        tp,
      });
    }
    Ok(())
  }

  /// 计算每个类别、每个阈值的精确率-召回率曲线与 AP，并生成指标字典。只能调用一次。
  pub fn build(&mut self) -> Result<&BTreeMap<String, f32>, MetricError> {
    if self.state() != MetricState::Collecting {
      return Err(MetricError::AlreadyBuilt);
    }

    let nt = self.thresholds.len();
    let mut classes = Vec::with_capacity(self.names.len());
    for (c, name) in self.names.iter().enumerate() {
      let instances = self.instances[c];
      let mut recs: Vec<&Record> = self
        .records
        .iter()
        .filter(|r| r.class_id as usize == c)
        .collect();
      recs.sort_by(|a, b| b.score.total_cmp(&a.score));

      let mut stats = ClassStats {
        class_id: c as u32,
        name: name.clone(),
        instances,
        detections: recs.len(),
        precision: 0.0,
        recall: 0.0,
        ap: vec![0.0; nt],
      };
      if instances > 0 && !recs.is_empty() {
        for k in 0..nt {
          let mut tpc = 0usize;
          let mut recall = Vec::with_capacity(recs.len());
          let mut precision = Vec::with_capacity(recs.len());
          for (i, r) in recs.iter().enumerate() {
            if r.tp[k] {
              tpc += 1;
            }
            recall.push(tpc as f32 / instances as f32);
            precision.push(tpc as f32 / (i + 1) as f32);
          }
          stats.ap[k] = compute_ap(&recall, &precision);
          if k == 0 {
            stats.precision = precision.last().copied().unwrap_or(0.0);
            stats.recall = recall.last().copied().unwrap_or(0.0);
          }
        }
      }
      classes.push(stats);
    }

    let precision = class_mean(&classes, |c| c.precision);
    let recall = class_mean(&classes, |c| c.recall);
    let map_primary = class_mean(&classes, ClassStats::ap_primary);
    let map = class_mean(&classes, ClassStats::ap_mean);

    let first = self.thresholds[0] * 100.0;
    let last = self.thresholds[nt - 1] * 100.0;
    let mut metrics = BTreeMap::new();
    metrics.insert("metrics/precision".to_string(), precision);
    metrics.insert("metrics/recall".to_string(), recall);
    metrics.insert(format!("metrics/mAP{first:.0}"), map_primary);
    metrics.insert(format!("metrics/mAP{first:.0}-{last:.0}"), map);
    metrics.insert("fitness".to_string(), 0.1 * map_primary + 0.9 * map);

    self.classes = classes;
    self.metrics = metrics;
    self.state.set(MetricState::Built);
    Ok(&self.metrics)
  }

  /// 已构建的指标字典，构建前为空
  pub fn metrics(&self) -> &BTreeMap<String, f32> {
    &self.metrics
  }

  pub fn fitness(&self) -> f32 {
    self.metrics.get("fitness").copied().unwrap_or(0.0)
  }

  /// 只读地检查已构建，首次读取报告时状态记为 `Reported`
  fn ensure_built(&self) -> Result<(), MetricError> {
    match self.state() {
      MetricState::Collecting => Err(MetricError::NotBuilt),
      _ => {
        self.state.set(MetricState::Reported);
        Ok(())
      }
    }
  }

  /// 汇总报告，不改变统计结果
  pub fn overviews(&self) -> Result<Overview, MetricError> {
    self.ensure_built()?;
    let classes = &self.classes;
    Ok(Overview {
      images: self.images,
      instances: self.instances.iter().sum(),
      precision: class_mean(classes, |c| c.precision),
      recall: class_mean(classes, |c| c.recall),
      map_primary: class_mean(classes, ClassStats::ap_primary),
      map: class_mean(classes, ClassStats::ap_mean),
    })
  }

  /// 每个类别的明细，不改变统计结果
  pub fn details(&self) -> Result<Details<'_>, MetricError> {
    self.ensure_built()?;
    Ok(Details {
      images: self.images,
      classes: &self.classes,
    })
  }
}
