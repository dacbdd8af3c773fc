// 该文件是 Shanan PCB （山南西风 · 电路板缺陷检测） 项目的一部分。
// src/args.rs - 服务参数配置
//
// 本程序遵循 GNU Affero 通用公共许可证（AGPL）许可协议。
// 本程序的发布旨在提供实用价值，但不作任何形式的担保，
// 包括但不限于对适销性或特定用途适用性的默示担保。
// 更多详情请参阅 GNU 通用公共许可证。
//
// Copyright (C) 2026 Johann Li <me@qinka.pro>, ETVP

use std::net::SocketAddr;
use std::path::PathBuf;

use clap::Parser;
use tracing::Level;

use shanan_pcb::input::{DEFAULT_EXTENSIONS, DEFAULT_MAX_FILE_SIZE, DEFAULT_MIME_TYPES};

/// PCB 缺陷检测服务参数配置
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Args {
  /// 模型位置，文件路径或 URL
  /// 例如: onnx:///opt/models/best.onnx?conf=0.25&iou=0.45&labels=/opt/models/labels.txt
  #[arg(long, env = "PCB_MODEL", value_name = "MODEL")]
  pub model: String,

  /// 监听地址
  #[arg(long, env = "PCB_LISTEN", default_value = "0.0.0.0:8000", value_name = "ADDR")]
  pub listen: SocketAddr,

  /// 上传文件大小上限（字节）
  #[arg(long, env = "PCB_MAX_FILE_SIZE", default_value_t = DEFAULT_MAX_FILE_SIZE, value_name = "BYTES")]
  pub max_file_size: u64,

  /// 允许的文件扩展名
  #[arg(long, env = "PCB_ALLOWED_EXTENSIONS", value_delimiter = ',', default_values_t = DEFAULT_EXTENSIONS.map(String::from))]
  pub allowed_extensions: Vec<String>,

  /// 允许的 MIME 类型
  #[arg(long, env = "PCB_ALLOWED_MIME_TYPES", value_delimiter = ',', default_values_t = DEFAULT_MIME_TYPES.map(String::from))]
  pub allowed_mime_types: Vec<String>,

  /// 上传文件暂存目录（默认系统临时目录）
  #[arg(long, env = "PCB_STAGING_DIR", value_name = "DIR")]
  pub staging_dir: Option<PathBuf>,

  /// 检测结果缓存容量
  #[arg(long, env = "PCB_CACHE_CAPACITY", default_value_t = 100, value_name = "ENTRIES")]
  pub cache_capacity: usize,

  /// 推理工作线程数（默认等于可用 CPU 数）
  #[arg(long, env = "PCB_WORKERS", value_name = "COUNT")]
  pub workers: Option<usize>,

  /// 标注字体（TrueType），未指定或加载失败时使用内置字体
  #[arg(long, env = "PCB_FONT", value_name = "FILE")]
  pub font: Option<PathBuf>,

  /// 允许跨域访问的来源
  #[arg(long, env = "PCB_CORS_ORIGINS", value_delimiter = ',', default_value = "*")]
  pub cors_origins: Vec<String>,

  /// 访问令牌，设置后推理接口需要 `Authorization: Bearer <token>`
  #[arg(long, env = "PCB_API_TOKEN", value_name = "TOKEN")]
  pub api_token: Option<String>,

  /// 日志级别
  #[arg(long, env = "PCB_LOG_LEVEL", default_value = "info", value_name = "LEVEL")]
  pub log_level: Level,

  /// OpenAI API 密钥，未设置时不生成缺陷报告
  #[arg(long, env = "OPENAI_API_KEY", hide_env_values = true)]
  pub openai_api_key: Option<String>,

  /// 报告生成所用模型
  #[arg(long, env = "PCB_REPORT_MODEL", default_value = "gpt-4o-mini")]
  pub report_model: String,

  /// OpenAI 兼容接口地址
  #[arg(long, env = "OPENAI_BASE_URL", value_name = "URL")]
  pub openai_base_url: Option<String>,

  /// 向量库 id，设置后报告先检索 IPC-A-610F 条文再生成
  #[arg(long, env = "PCB_VECTOR_STORE_ID", value_name = "ID")]
  pub vector_store_id: Option<String>,

  /// 每次检索返回的最大结果数
  #[arg(long, env = "PCB_RAG_MAX_RESULTS", value_name = "COUNT")]
  pub rag_max_results: Option<u32>,
}
