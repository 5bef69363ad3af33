//! pcsdown: 网盘文件分块并行下载引擎
//!
//! - `core::registry`: 全局任务表与下载名额
//! - `core::task`: 单个任务的分块计划、worker 池和状态汇总
//! - `core::source`: 支持按范围读取的远程数据源
//! - `config` / `cli` / `ui` / `utils`: 配置、命令行、进度显示和日志

pub mod cli;
pub mod config;
pub mod core;
pub mod ui;
pub mod utils;
