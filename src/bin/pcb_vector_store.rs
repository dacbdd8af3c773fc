// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/bin/pcb_vector_store.rs - 检索报告所用向量库的导入工具
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::Parser;
use tracing::info;

use shanan_pcb::report::VectorStoreClient;

/// 创建向量库并导入质检标准文档
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 待导入的文档
  #[arg(long, value_name = "FILE")]
  pub file: PathBuf,
  /// 向量库名称
  #[arg(long, default_value = "IPC-A-610F")]
  pub name: String,
  /// OpenAI API 密钥
  #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
  pub openai_api_key: String,
  /// OpenAI 兼容服务地址
  #[arg(long, env = "OPENAI_BASE_URL")]
  pub openai_base_url: Option<String>,
  /// 等待索引完成的最长秒数
  #[arg(long, default_value_t = 300)]
  pub timeout_secs: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
  tracing_subscriber::fmt::init();

  let args = Args::parse();

  let client = VectorStoreClient::new(args.openai_api_key, args.openai_base_url.as_deref())?
    .with_timeout(Duration::from_secs(args.timeout_secs));
  let store_id = client.ingest(&args.name, &args.file).await?;

  info!("向量库已就绪: {}", store_id);
  println!("{}", store_id);
  Ok(())
}
