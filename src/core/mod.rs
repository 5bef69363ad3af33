//! Core: 任务表、单任务下载调度、远程数据源和错误处理等核心逻辑模块

pub mod error;
pub mod registry;
pub mod source;
pub mod task;

pub use error::DownloadError;
pub use registry::{
    CommandReply, ControlTask, GetStats, ListTasks, LookupTask, RegisterTask, RegistryStats,
    RemoveTask, Shutdown, TaskRegistry,
};
pub use source::{HttpSource, RemoteSource};
pub use task::{Downloader, StatusSnapshot, TaskCommand, TaskId, TaskState};
