// 该文件是 Shanan （山南西风） 项目的一部分。
// src/record.rs - 离线记录的网络输出与标注
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

//! JSON 记录文件，每个批次保存一次前向的全部输出以及对应的标注，
//! 用于在没有模型运行时的情况下复现验证过程。
//!
//! ```json
//! {
//!   "names": ["car", "person"],
//!   "batches": [{
//!     "image_sizes": [{"original": [640, 480], "resized": [640, 640]}],
//!     "labels": [[0, 1, 0.5, 0.5, 0.2, 0.3]],
//!     "pred_boxes": [[[x1, y1, x2, y2], ...]],
//!     "pred_scores": [[[0.1, 0.9], ...]],
//!     "pred_dist": [[[...4 * reg_max...], ...]],
//!     "anchors": [[0.5, 0.5], ...],
//!     "strides": [8.0, ...]
//!   }]
//! }
//! ```
//!
//! 省略 `pred_boxes` 时由 `pred_dist` 解码得到。

use std::convert::Infallible;

use ndarray::{Array1, Array2, Array3};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme,
  metric::ImageSize,
  model::{Model, PredictionError, Predictions},
  target::{Label, TargetError},
  task::ValidBatch,
};

#[derive(Error, Debug)]
pub enum RecordError {
  #[error("URI 方案不匹配, 需要 {expected}, 实际为 {actual}")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("无法转换为本地路径: {0}")]
  BadPath(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("记录解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("第 {batch} 批的 {what} 形状不规则")]
  Ragged { batch: usize, what: &'static str },
  #[error("第 {batch} 批有 {sizes} 个图像尺寸, 但有 {images} 张图像的输出")]
  SizeMismatch {
    batch: usize,
    sizes: usize,
    images: usize,
  },
  #[error("标签错误: {0}")]
  Label(#[from] TargetError),
  #[error("网络输出错误: {0}")]
  Prediction(#[from] PredictionError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchRecord {
  pub image_sizes: Vec<ImageSize>,
  /// 每行 `(image_index, class_id, cx, cy, w, h)`
  #[serde(default)]
  pub labels: Vec<Vec<f32>>,
  #[serde(default)]
  pub pred_boxes: Option<Vec<Vec<[f32; 4]>>>,
  pub pred_scores: Vec<Vec<Vec<f32>>>,
  pub pred_dist: Vec<Vec<Vec<f32>>>,
  pub anchors: Vec<[f32; 2]>,
  pub strides: Vec<f32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordFile {
  pub names: Vec<String>,
  pub batches: Vec<BatchRecord>,
}

/// 把嵌套的 `[B][A][W]` 列表转成张量，`width` 为空时取第一行的宽度
fn to_array3(
  rows: &[Vec<Vec<f32>>],
  width: Option<usize>,
  batch: usize,
  what: &'static str,
) -> Result<Array3<f32>, RecordError> {
  let b = rows.len();
  let a = rows.first().map_or(0, Vec::len);
  let w = width
    .or_else(|| rows.iter().flatten().next().map(Vec::len))
    .unwrap_or(0);
  let mut flat = Vec::with_capacity(b * a * w);
  for image in rows {
    if image.len() != a {
      return Err(RecordError::Ragged { batch, what });
    }
    for row in image {
      if row.len() != w {
        return Err(RecordError::Ragged { batch, what });
      }
      flat.extend_from_slice(row);
    }
  }
  Array3::from_shape_vec((b, a, w), flat).map_err(|_| RecordError::Ragged { batch, what })
}

impl BatchRecord {
  /// 转换为一个验证批次，网络输出作为模型输入原样保留
  pub fn to_batch(
    &self,
    batch: usize,
    num_classes: usize,
  ) -> Result<ValidBatch<Predictions>, RecordError> {
    let labels = self
      .labels
      .iter()
      .map(|row| Label::from_row(row))
      .collect::<Result<Vec<_>, _>>()?;

    let scores = to_array3(&self.pred_scores, Some(num_classes), batch, "pred_scores")?;
    let dist = to_array3(&self.pred_dist, None, batch, "pred_dist")?;
    let flat_anchors: Vec<f32> = self.anchors.iter().flatten().copied().collect();
    let anchors = Array2::from_shape_vec((self.anchors.len(), 2), flat_anchors)
      .map_err(|_| RecordError::Ragged { batch, what: "anchors" })?;
    let strides = Array1::from_vec(self.strides.clone());

    let preds = match &self.pred_boxes {
      Some(boxes) => {
        let rows: Vec<Vec<Vec<f32>>> = boxes
          .iter()
          .map(|image| image.iter().map(|b| b.to_vec()).collect())
          .collect();
        let boxes = to_array3(&rows, Some(4), batch, "pred_boxes")?;
        Predictions::new(boxes, scores, dist, anchors, strides)?
      }
      None => Predictions::from_distribution(scores, dist, anchors, strides)?,
    };

    if preds.batch_size() != self.image_sizes.len() {
      return Err(RecordError::SizeMismatch {
        batch,
        sizes: self.image_sizes.len(),
        images: preds.batch_size(),
      });
    }

    Ok(ValidBatch {
      input: preds,
      image_sizes: self.image_sizes.clone(),
      labels,
    })
  }
}

impl RecordFile {
  pub fn from_json(text: &str) -> Result<Self, RecordError> {
    Ok(serde_json::from_str(text)?)
  }

  pub fn batches(&self) -> Result<Vec<ValidBatch<Predictions>>, RecordError> {
    self
      .batches
      .iter()
      .enumerate()
      .map(|(i, b)| b.to_batch(i, self.names.len()))
      .collect()
  }
}

impl FromUrlWithScheme for RecordFile {
  const SCHEME: &'static str = "file";
}

impl FromUrl for RecordFile {
  type Error = RecordError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(RecordError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }
    let path = url
      .to_file_path()
      .map_err(|()| RecordError::BadPath(url.to_string()))?;
    let text = std::fs::read_to_string(path)?;
    Self::from_json(&text)
  }
}

/// 回放记录的网络输出
#[derive(Debug, Default, Clone, Copy)]
pub struct Replay;

impl Model for Replay {
  type Input = Predictions;
  type Error = Infallible;

  fn infer(&self, input: &Predictions) -> Result<Predictions, Infallible> {
    Ok(input.clone())
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  const ONE_BATCH: &str = r#"{
    "names": ["a", "b"],
    "batches": [{
      "image_sizes": [{"original": [8, 8], "resized": [8, 8]}],
      "labels": [[0, 1, 0.5, 0.5, 0.25, 0.25]],
      "pred_boxes": [[[3.0, 3.0, 5.0, 5.0], [0.0, 0.0, 1.0, 1.0]]],
      "pred_scores": [[[0.1, 0.9], [0.0, 0.0]]],
      "pred_dist": [[[0, 0, 0, 0, 0, 0, 0, 0], [0, 0, 0, 0, 0, 0, 0, 0]]],
      "anchors": [[4.0, 4.0], [0.5, 0.5]],
      "strides": [1.0, 1.0]
    }]
  }"#;

  #[test]
  fn parses_one_batch() {
    let record = RecordFile::from_json(ONE_BATCH).unwrap();
    let batches = record.batches().unwrap();
    assert_eq!(batches.len(), 1);
    let b = &batches[0];
    assert_eq!(b.input.batch_size(), 1);
    assert_eq!(b.input.num_anchors(), 2);
    assert_eq!(b.input.num_classes(), 2);
    assert_eq!(b.input.reg_max(), 2);
    assert_eq!(b.labels[0].class_id, 1);
    assert_eq!(Replay.infer(&b.input).unwrap(), b.input);
  }

  #[test]
  fn boxes_are_decoded_when_missing() {
    let text = ONE_BATCH.replace(
      r#""pred_boxes": [[[3.0, 3.0, 5.0, 5.0], [0.0, 0.0, 1.0, 1.0]]],"#,
      "",
    );
    let record = RecordFile::from_json(&text).unwrap();
    let batch = record.batches().unwrap().remove(0);
    // 均匀分布的期望距离为 0.5
    let b = batch.input.scaled_box(0, 0);
    for (v, e) in b.into_iter().zip([3.5, 3.5, 4.5, 4.5]) {
      assert!((v - e).abs() < 1e-5);
    }
  }

  #[test]
  fn ragged_scores_are_rejected() {
    let text = ONE_BATCH.replace("[0.0, 0.0]]]", "[0.0]]]");
    let record = RecordFile::from_json(&text).unwrap();
    assert!(matches!(
      record.batches(),
      Err(RecordError::Ragged { batch: 0, what: "pred_scores" })
    ));
  }

  #[test]
  fn size_count_must_match_images() {
    let text = ONE_BATCH.replace(
      r#""image_sizes": [{"original": [8, 8], "resized": [8, 8]}]"#,
      r#""image_sizes": []"#,
    );
    let record = RecordFile::from_json(&text).unwrap();
    assert!(matches!(
      record.batches(),
      Err(RecordError::SizeMismatch { sizes: 0, images: 1, .. })
    ));
  }
}
