// 该文件是 Shanan （山南西风） 项目的一部分。
// src/task.rs - 验证任务与早停
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

use std::{
  collections::BTreeMap,
  time::{Duration, Instant},
};

use anyhow::{Context, bail};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::{
  config::Hyperparameters,
  loss::{LossEngine, LossItems},
  metric::{ClassStats, ImageSize, Metric, Overview},
  model::Model,
  nms::Suppressor,
  target::Label,
};

pub trait Task<I, M>: Sized {
  type Output;
  type Error;
  fn run_task(self, input: I, model: M) -> Result<Self::Output, Self::Error>;
}

/// 一批验证数据：模型输入、每张图像的尺寸以及相对原图的标签
#[derive(Debug, Clone)]
pub struct ValidBatch<F> {
  pub input: F,
  pub image_sizes: Vec<ImageSize>,
  pub labels: Vec<Label>,
}

/// 每张图像的平均耗时，单位秒
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct Speed {
  pub inference: f64,
  pub loss: f64,
  pub postprocess: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidReport {
  /// `val/*` 损失与 `metrics/*` 指标合并后的字典
  pub results: BTreeMap<String, f32>,
  pub fitness: f32,
  pub speed: Speed,
  pub overview: Overview,
  pub classes: Vec<ClassStats>,
}

pub struct ValidTask {
  names: Vec<String>,
  hyp: Hyperparameters,
}

impl ValidTask {
  pub fn new(names: Vec<String>, hyp: Hyperparameters) -> anyhow::Result<Self> {
    hyp.validate()?;
    Ok(Self { names, hyp })
  }
}

fn per_image_secs(total: Duration, images: usize) -> f64 {
  if images == 0 {
    0.0
  } else {
    total.as_secs_f64() / images as f64
  }
}

/// 同一批次的图像共享网络输入尺寸，取其 `[w, h, w, h]` 作为标签的缩放
fn batch_scale(sizes: &[ImageSize]) -> anyhow::Result<[f32; 4]> {
  let Some(first) = sizes.first() else {
    return Ok([1.0; 4]);
  };
  if sizes.iter().any(|s| s.resized != first.resized) {
    bail!("同一批次内的网络输入尺寸不一致");
  }
  let [w, h] = first.resized.map(|v| v as f32);
  Ok([w, h, w, h])
}

/// 标签相对原图，计算损失前换算到网络输入
fn input_labels(labels: &[Label], sizes: &[ImageSize]) -> anyhow::Result<Vec<Label>> {
  labels
    .iter()
    .map(|l| {
      let size = sizes.get(l.image_index).with_context(|| {
        format!("标签的图像索引 {} 超出批大小 {}", l.image_index, sizes.len())
      })?;
      Ok(Label {
        bbox: size.to_input_relative(&l.bbox),
        ..*l
      })
    })
    .collect()
}

impl<
  F,
  ME: std::error::Error + Sync + Send + 'static,
  I: IntoIterator<Item = ValidBatch<F>>,
  M: Model<Input = F, Error = ME>,
> Task<I, M> for ValidTask
{
  type Output = ValidReport;
  type Error = anyhow::Error;

  fn run_task(self, input: I, model: M) -> Result<Self::Output, Self::Error> {
    info!("开始验证任务...");
    let engine = LossEngine::new(self.hyp.loss_config());
    let suppressor = Suppressor::new(self.hyp.nms_config());
    let mut metric = Metric::new(self.names, self.hyp.metric_config())?;

    let mut items = LossItems::default();
    let mut batches = 0usize;
    let mut images = 0usize;
    let mut t_infer = Duration::ZERO;
    let mut t_loss = Duration::ZERO;
    let mut t_post = Duration::ZERO;

    for (index, batch) in input.into_iter().enumerate() {
      let now = Instant::now();
      let preds = model.infer(&batch.input)?;
      t_infer += now.elapsed();

      if preds.batch_size() != batch.image_sizes.len() {
        bail!(
          "第 {} 批的网络输出有 {} 张图像, 但提供了 {} 个图像尺寸",
          index,
          preds.batch_size(),
          batch.image_sizes.len()
        );
      }

      let now = Instant::now();
      let scale = batch_scale(&batch.image_sizes)?;
      let input_labels = input_labels(&batch.labels, &batch.image_sizes)?;
      let loss = engine
        .compute(&input_labels, &preds, scale)
        .with_context(|| format!("第 {index} 批的损失计算失败"))?;
      items += loss.items;
      t_loss += now.elapsed();

      let now = Instant::now();
      let detections = suppressor.run_batch(preds.candidates().view())?;
      metric.update(&batch.labels, &detections, &batch.image_sizes)?;
      t_post += now.elapsed();

      batches += 1;
      images += batch.image_sizes.len();
      debug!(
        "第 {} 批: {} 张图像, {} 个检测, 损失 {:.4}",
        index,
        batch.image_sizes.len(),
        detections.iter().map(|d| d.len()).sum::<usize>(),
        loss.total
      );
    }

    if batches == 0 {
      warn!("没有任何验证批次");
    }

    let mut results = if batches > 0 {
      (items / batches as f32).to_map("val/")
    } else {
      items.to_map("val/")
    };
    results.extend(metric.build()?.iter().map(|(k, v)| (k.clone(), *v)));
    let fitness = metric.fitness();

    let speed = Speed {
      inference: per_image_secs(t_infer, images),
      loss: per_image_secs(t_loss, images),
      postprocess: per_image_secs(t_post, images),
    };
    info!(
      "速度: 推理 {:.2e}s, 损失 {:.2e}s, 后处理 {:.2e}s (每张图像)",
      speed.inference, speed.loss, speed.postprocess
    );

    let overview = metric.overviews()?;
    info!("验证完成\n{}", overview);
    let classes = metric.details()?.classes.to_vec();

    Ok(ValidReport {
      results,
      fitness,
      speed,
      overview,
      classes,
    })
  }
}

/// 若干轮内适应度没有提升时停止训练，`patience` 为 0 表示从不停止
#[derive(Debug, Clone, PartialEq)]
pub struct EarlyStop {
  pub best_epoch: usize,
  pub best_fitness: f32,
  pub patience: usize,
}

impl EarlyStop {
  pub fn new(patience: usize) -> Self {
    Self {
      best_epoch: 0,
      best_fitness: 0.0,
      patience,
    }
  }

  /// 记录一轮的适应度，返回是否应当停止
  pub fn step(&mut self, epoch: usize, fitness: Option<f32>) -> bool {
    let Some(fitness) = fitness else {
      return false;
    };
    if fitness >= self.best_fitness {
      self.best_epoch = epoch;
      self.best_fitness = fitness;
    }
    if self.patience == 0 {
      return false;
    }
    let delta = epoch.saturating_sub(self.best_epoch);
    let stop = delta >= self.patience;
    if stop {
      warn!(
        "最近 {} 轮没有提升, 在第 {} 轮停止, 最佳为第 {} 轮",
        self.patience, epoch, self.best_epoch
      );
    }
    stop
  }
}
