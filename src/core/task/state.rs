use serde::{Serialize, Deserialize};
use std::fmt;

/// 任务编号，进程内单调递增，不会复用
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TaskId(pub u64);

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// 下载任务状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Pending,
    Running,
    Paused,
    Completed,
    Failed,
    Cancelled,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed | TaskState::Cancelled)
    }

    /// 状态机允许的迁移
    pub fn can_transition_to(self, next: TaskState) -> bool {
        use TaskState::*;
        matches!(
            (self, next),
            (Pending, Running) | (Pending, Cancelled) |
            (Running, Paused) | (Running, Completed) | (Running, Failed) | (Running, Cancelled) |
            (Paused, Running) | (Paused, Completed) | (Paused, Cancelled)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TaskState::Pending => "等待中",
            TaskState::Running => "下载中",
            TaskState::Paused => "已暂停",
            TaskState::Completed => "已完成",
            TaskState::Failed => "失败",
            TaskState::Cancelled => "已取消",
        };
        f.write_str(name)
    }
}

/// 分块状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ChunkState {
    Pending = 0,
    InFlight = 1,
    Done = 2,
    Failed = 3,
}

impl ChunkState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => ChunkState::InFlight,
            2 => ChunkState::Done,
            3 => ChunkState::Failed,
            _ => ChunkState::Pending,
        }
    }
}

/// 控制层可以对单个任务下发的命令
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskCommand {
    Pause,
    Resume,
    Cancel,
    Status,
}

/// 工作线程收到的运行信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Signal {
    Run,
    Pause,
    Cancel,
}
