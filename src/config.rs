// 该文件是 Shanan （山南西风） 项目的一部分。
// src/config.rs - 超参数配置
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

use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::{
  FromUrl, FromUrlWithScheme, geometry::IouKind, loss::LossConfig, metric::MetricConfig,
  nms::NmsConfig,
};

#[derive(Error, Debug)]
pub enum ConfigError {
  #[error("URI 方案不匹配, 需要 {expected}, 实际为 {actual}")]
  SchemeMismatch {
    expected: &'static str,
    actual: String,
  },
  #[error("无法转换为本地路径: {0}")]
  BadPath(String),
  #[error("I/O 错误: {0}")]
  IoError(#[from] std::io::Error),
  #[error("配置解析错误: {0}")]
  ParseError(#[from] serde_json::Error),
  #[error("参数 {name} 的取值 {value} 无效, {reason}")]
  OutOfRange {
    name: &'static str,
    value: String,
    reason: &'static str,
  },
}

/// 训练与验证共用的全部超参数，缺省字段取常用值
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Hyperparameters {
  pub alpha: f32,
  pub beta: f32,
  pub topk: usize,
  #[serde(alias = "box")]
  pub box_w: f32,
  #[serde(alias = "cls")]
  pub cls_w: f32,
  #[serde(alias = "dfl")]
  pub dfl_w: f32,
  pub box_loss: IouKind,
  pub reg_max: usize,
  pub conf_t: f32,
  pub iou_t: f32,
  pub multi_label: bool,
  pub agnostic: bool,
  pub merge: bool,
  pub max_box: usize,
  pub max_wh: f32,
  pub max_det: usize,
  pub iou_thresholds: Vec<f32>,
}

impl Default for Hyperparameters {
  fn default() -> Self {
    Self {
      alpha: 0.5,
      beta: 6.0,
      topk: 10,
      box_w: 7.5,
      cls_w: 0.5,
      dfl_w: 1.5,
      box_loss: IouKind::default(),
      reg_max: 16,
      conf_t: 0.001,
      iou_t: 0.7,
      multi_label: false,
      agnostic: false,
      merge: false,
      max_box: 30000,
      max_wh: 7680.0,
      max_det: 300,
      iou_thresholds: MetricConfig::default().iou_thresholds,
    }
  }
}

fn out_of_range(name: &'static str, value: impl ToString, reason: &'static str) -> ConfigError {
  ConfigError::OutOfRange {
    name,
    value: value.to_string(),
    reason,
  }
}

fn check_unit(name: &'static str, v: f32) -> Result<(), ConfigError> {
  if !(0.0..=1.0).contains(&v) {
    return Err(out_of_range(name, v, "应在 [0, 1] 内"));
  }
  Ok(())
}

fn check_non_negative(name: &'static str, v: f32) -> Result<(), ConfigError> {
  if !v.is_finite() || v < 0.0 {
    return Err(out_of_range(name, v, "应为非负有限值"));
  }
  Ok(())
}

fn check_at_least(name: &'static str, v: usize, min: usize) -> Result<(), ConfigError> {
  if v < min {
    return Err(out_of_range(name, v, "低于下限"));
  }
  Ok(())
}

impl Hyperparameters {
  pub fn from_json(text: &str) -> Result<Self, ConfigError> {
    let hyp: Self = serde_json::from_str(text)?;
    hyp.validate()?;
    Ok(hyp)
  }

  /// 检查全部字段的取值范围
  pub fn validate(&self) -> Result<(), ConfigError> {
    check_non_negative("alpha", self.alpha)?;
    check_non_negative("beta", self.beta)?;
    check_at_least("topk", self.topk, 1)?;
    check_non_negative("box_w", self.box_w)?;
    check_non_negative("cls_w", self.cls_w)?;
    check_non_negative("dfl_w", self.dfl_w)?;
    check_at_least("reg_max", self.reg_max, 2)?;
    check_unit("conf_t", self.conf_t)?;
    check_unit("iou_t", self.iou_t)?;
    check_at_least("max_box", self.max_box, 1)?;
    check_at_least("max_det", self.max_det, 1)?;
    if !self.max_wh.is_finite() || self.max_wh <= 0.0 {
      return Err(out_of_range("max_wh", self.max_wh, "应为正数"));
    }

    if self.iou_thresholds.is_empty() {
      return Err(out_of_range("iou_thresholds", "[]", "不能为空"));
    }
    for &t in &self.iou_thresholds {
      if !(t > 0.0 && t <= 1.0) {
        return Err(out_of_range("iou_thresholds", t, "应在 (0, 1] 内"));
      }
    }
    if self.iou_thresholds.windows(2).any(|w| w[0] >= w[1]) {
      return Err(out_of_range(
        "iou_thresholds",
        format!("{:?}", self.iou_thresholds),
        "应严格递增",
      ));
    }
    Ok(())
  }

  pub fn loss_config(&self) -> LossConfig {
    LossConfig {
      alpha: self.alpha,
      beta: self.beta,
      topk: self.topk,
      box_w: self.box_w,
      cls_w: self.cls_w,
      dfl_w: self.dfl_w,
      reg_max: self.reg_max,
      box_loss: self.box_loss,
    }
  }

  pub fn nms_config(&self) -> NmsConfig {
    NmsConfig {
      conf_t: self.conf_t,
      multi_label: self.multi_label,
      max_box: self.max_box,
      max_wh: self.max_wh,
      iou_t: self.iou_t,
      max_det: self.max_det,
      merge: self.merge,
      agnostic: self.agnostic,
    }
  }

  pub fn metric_config(&self) -> MetricConfig {
    MetricConfig {
      iou_thresholds: self.iou_thresholds.clone(),
    }
  }
}

impl FromUrlWithScheme for Hyperparameters {
  const SCHEME: &'static str = "file";
}

impl FromUrl for Hyperparameters {
  type Error = ConfigError;

  fn from_url(url: &Url) -> Result<Self, Self::Error> {
    if url.scheme() != Self::SCHEME {
      return Err(ConfigError::SchemeMismatch {
        expected: Self::SCHEME,
        actual: url.scheme().to_string(),
      });
    }
    let path = url
      .to_file_path()
      .map_err(|()| ConfigError::BadPath(url.to_string()))?;
    let text = std::fs::read_to_string(path)?;
    Self::from_json(&text)
  }
}
