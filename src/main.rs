// 该文件是 Shanan （山南西风） 项目的一部分。
// src/main.rs - 项目主程序
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

mod args;

use anyhow::{Result, bail};
use clap::Parser;
use tracing::info;

use shanan_train::{
  FromUrl, Hyperparameters, Task, ValidTask,
  metric::Details,
  record::{RecordFile, Replay},
};

fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = args::Args::parse();

  info!("记录文件: {}", args.input);
  let hyp = match &args.hyp {
    Some(url) => {
      info!("超参数文件: {}", url);
      Hyperparameters::from_url(url)?
    }
    None => Hyperparameters::default(),
  };

  let record = RecordFile::from_url(&args.input)?;
  let names = record.names.clone();
  let batches = record.batches()?;
  info!("共 {} 个类别, {} 个批次", names.len(), batches.len());

  let report = ValidTask::new(names, hyp)?.run_task(batches, Replay)?;

  println!("{}", report.overview);
  if args.details {
    let details = Details {
      images: report.overview.images,
      classes: &report.classes,
    };
    println!("{}", details);
  }
  for (k, v) in &report.results {
    println!("{k}: {v:.5}");
  }

  if let Some(output) = &args.output {
    if output.scheme() != "file" {
      bail!("输出路径必须使用 file 方案");
    }
    let Ok(path) = output.to_file_path() else {
      bail!("无法转换为本地路径: {}", output);
    };
    std::fs::write(path, serde_json::to_string_pretty(&report)?)?;
    info!("结果已写入: {}", output);
  }

  Ok(())
}
