use thiserror::Error;
use std::io;

use crate::core::task::state::{TaskId, TaskState};

#[derive(Error, Debug)]
pub enum DownloadError {
    #[error("任务不存在: {0}")]
    NotFound(TaskId),

    #[error("参数校验失败: {0}")]
    Validation(String),

    #[error("网络暂时性错误: {0}")]
    TransientNetwork(String),

    #[error("远程错误: {0}")]
    FatalRemote(String),

    #[error("本地IO错误: {0}")]
    LocalIo(#[from] io::Error),

    #[error("重试次数超过限制({attempts}次): {last}")]
    MaxRetriesExceeded {
        attempts: u32,
        last: String,
    },

    #[error("当前状态 {state} 不允许执行 {action}")]
    InvalidTransition {
        state: TaskState,
        action: &'static str,
    },

    #[error("任务尚未结束，不能移除: {0}")]
    NotTerminal(TaskId),

    #[error("配置错误: {0}")]
    Config(String),

    #[error("任务管理器不可用: {0}")]
    Registry(String),
}

impl DownloadError {
    /// 是否可以在 worker 内部静默重试
    pub fn is_retryable(&self) -> bool {
        matches!(self, DownloadError::TransientNetwork(_))
    }

    /// 是否会直接导致任务失败
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DownloadError::FatalRemote(_) |
            DownloadError::LocalIo(_) |
            DownloadError::MaxRetriesExceeded { .. }
        )
    }

    /// 控制层只看到这一行简短的错误描述
    pub fn user_message(&self) -> String {
        match self {
            DownloadError::LocalIo(e) => match e.kind() {
                io::ErrorKind::PermissionDenied => "本地IO错误: 没有写入权限".to_string(),
                io::ErrorKind::NotFound => "本地IO错误: 路径不存在".to_string(),
                _ => format!("本地IO错误: {}", e.kind()),
            },
            other => other.to_string(),
        }
    }

    /// 根据 HTTP 状态码归类远程错误: 5xx 与 429 可重试，其余 4xx 直接失败
    pub fn from_status(status: reqwest::StatusCode) -> Self {
        if status.is_server_error() || status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            DownloadError::TransientNetwork(format!("服务器返回 {}", status))
        } else {
            DownloadError::FatalRemote(format!("服务器返回 {}", status))
        }
    }
}

impl From<reqwest::Error> for DownloadError {
    fn from(error: reqwest::Error) -> Self {
        if let Some(status) = error.status() {
            return DownloadError::from_status(status);
        }
        if error.is_builder() || error.is_redirect() {
            return DownloadError::FatalRemote(error.to_string());
        }
        // 超时、连接被重置、读取 body 中断等都按暂时性错误处理
        DownloadError::TransientNetwork(error.to_string())
    }
}

impl From<toml::de::Error> for DownloadError {
    fn from(error: toml::de::Error) -> Self {
        DownloadError::Config(error.to_string())
    }
}

impl From<toml::ser::Error> for DownloadError {
    fn from(error: toml::ser::Error) -> Self {
        DownloadError::Config(error.to_string())
    }
}

impl From<serde_json::Error> for DownloadError {
    fn from(error: serde_json::Error) -> Self {
        DownloadError::LocalIo(io::Error::new(io::ErrorKind::InvalidData, error))
    }
}

impl From<actix::MailboxError> for DownloadError {
    fn from(error: actix::MailboxError) -> Self {
        DownloadError::Registry(error.to_string())
    }
}
