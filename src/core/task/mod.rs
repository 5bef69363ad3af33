//! `task` 模块包含了与单个下载任务相关的所有逻辑
//!
//! 主要包括：
//! - `state`: 任务状态、分块状态和控制命令
//! - `chunk_manager`: 分块计划
//! - `retry`: 重试逻辑
//! - `util`: 缓冲区池
//! - `status`: 进度快照与速度采样
//! - `resume`: 断点信息
//! - `worker`: 单个分块的下载与落盘
//! - `downloader`: 任务生命周期

pub mod state;
pub mod chunk_manager;
pub mod retry;
pub mod util;
pub mod status;
pub mod resume;
mod worker;
pub mod downloader;

pub use downloader::Downloader;
pub use state::{ChunkState, TaskCommand, TaskId, TaskState};
pub use status::{StatusSnapshot, WorkerStatus};
pub use self::retry::{RetryContext, RetryStrategy};
pub use self::resume::ResumeInfo;
