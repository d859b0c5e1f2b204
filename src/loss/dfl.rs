// 该文件是 Shanan （山南西风） 项目的一部分。
// src/loss/dfl.rs - 分布焦点损失
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

use ndarray::{ArrayView1, s};

fn log_sum_exp(logits: &ArrayView1<f32>) -> f32 {
  let max = logits.fold(f32::NEG_INFINITY, |m, &v| m.max(v));
  max + logits.iter().map(|&v| (v - max).exp()).sum::<f32>().ln()
}

fn cross_entropy(logits: &ArrayView1<f32>, index: usize) -> f32 {
  log_sum_exp(logits) - logits[index]
}

/// 四条边各自的 softmax 期望，得到锚点到边的距离 `(l, t, r, b)`
pub fn decode_distribution(logits: ArrayView1<f32>, reg_max: usize) -> [f32; 4] {
  let mut out = [0.0; 4];
  for (side, v) in out.iter_mut().enumerate() {
    let bins = logits.slice(s![side * reg_max..(side + 1) * reg_max]);
    let lse = log_sum_exp(&bins);
    *v = bins
      .iter()
      .enumerate()
      .map(|(k, &l)| k as f32 * (l - lse).exp())
      .sum();
  }
  out
}

/// 单个锚点的 DFL。
///
/// `target` 为网格单位的 `(l, t, r, b)` 距离，需已截断到 `[0, reg_max - 1)`。
/// 每条边在相邻两个区间上做交叉熵，权重使两点分布的期望恰好等于目标值；
/// 返回四条边的平均值。
pub fn dfl_loss(logits: ArrayView1<f32>, target: [f32; 4], reg_max: usize) -> f32 {
  let mut total = 0.0;
  for (side, &t) in target.iter().enumerate() {
    let bins = logits.slice(s![side * reg_max..(side + 1) * reg_max]);
    let left = (t.floor() as usize).min(reg_max - 2);
    let right = left + 1;
    let wl = right as f32 - t;
    let wr = 1.0 - wl;
    total += cross_entropy(&bins, left) * wl + cross_entropy(&bins, right) * wr;
  }
  total / 4.0
}
