// 该文件是 Shanan （山南西风） 项目的一部分。
// src/args.rs - 命令行参数
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use clap::Parser;
use url::Url;

/// 对记录的网络输出做离线验证
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 超参数文件，省略时使用默认值
  /// 例如: file:///path/to/hyp.json
  #[arg(long, value_name = "HYP")]
  pub hyp: Option<Url>,

  /// 记录文件，包含类别名称、网络输出与标注
  /// 例如: file:///path/to/record.json
  #[arg(long, value_name = "SOURCE")]
  pub input: Url,

  /// 结果输出路径，写入 JSON
  #[arg(long, value_name = "OUTPUT")]
  pub output: Option<Url>,

  /// 打印每个类别的明细
  #[arg(long)]
  pub details: bool,
}
