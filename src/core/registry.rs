use actix::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::config::{Config, TaskConfig};
use crate::core::error::DownloadError;
use crate::core::source::RemoteSource;
use crate::core::task::{Downloader, StatusSnapshot, TaskCommand, TaskId, TaskState};

/// ================== 消息定义 ==================

/// 注册下载任务：探测远程大小、校验目标路径后排队启动
pub struct RegisterTask {
    pub source: Arc<dyn RemoteSource>,
    pub destination: PathBuf,
    pub config: TaskConfig,
}
impl Message for RegisterTask { type Result = Result<TaskId, DownloadError>; }

/// 按编号取任务句柄
pub struct LookupTask(pub TaskId);
impl Message for LookupTask { type Result = Result<Arc<Downloader>, DownloadError>; }

/// 移除已结束的任务
pub struct RemoveTask(pub TaskId);
impl Message for RemoveTask { type Result = Result<(), DownloadError>; }

/// 向任务下发控制命令
pub struct ControlTask {
    pub id: TaskId,
    pub command: TaskCommand,
}
impl Message for ControlTask { type Result = Result<CommandReply, DownloadError>; }

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CommandReply {
    State(TaskState),
    Status(StatusSnapshot),
}

/// 所有任务的快照，按编号排序
pub struct ListTasks;
impl Message for ListTasks { type Result = Vec<StatusSnapshot>; }

/// 汇总统计
pub struct GetStats;
impl Message for GetStats { type Result = RegistryStats; }

/// 取消所有任务，等待 worker 退出后停止 actor
pub struct Shutdown;
impl Message for Shutdown { type Result = (); }

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RegistryStats {
    pub total: usize,
    pub pending: usize,
    pub running: usize,
    pub paused: usize,
    pub completed: usize,
    pub failed: usize,
    pub cancelled: usize,
    pub total_bytes: u64,
    pub downloaded_bytes: u64,
    pub speed: u64,
}

impl RegistryStats {
    pub fn active(&self) -> usize {
        self.pending + self.running + self.paused
    }

    pub fn progress(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        (self.downloaded_bytes as f32 / self.total_bytes as f32) * 100.0
    }
}

/// 全局任务表，同时负责下载名额的分配
pub struct TaskRegistry {
    tasks: HashMap<TaskId, Arc<Downloader>>,
    registering: HashSet<PathBuf>, // 正在探测中的目标文件
    admission: Arc<Semaphore>,
    max_download_load: usize,
    task_counter: u64,
}

impl TaskRegistry {
    pub fn new(max_download_load: usize) -> Self {
        let max_download_load = max_download_load.max(1);
        Self {
            tasks: HashMap::new(),
            registering: HashSet::new(),
            admission: Arc::new(Semaphore::new(max_download_load)),
            max_download_load,
            task_counter: 0,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.max_download_load)
    }

    fn get(&self, id: TaskId) -> Result<Arc<Downloader>, DownloadError> {
        self.tasks.get(&id).cloned().ok_or(DownloadError::NotFound(id))
    }

    /// 同一个目标文件同时只能属于一个未结束的任务
    fn check_destination(&self, destination: &Path) -> Result<(), DownloadError> {
        let held = self.registering.contains(destination)
            || self
                .tasks
                .values()
                .any(|d| d.destination() == destination && !d.state().is_terminal());
        if held {
            return Err(DownloadError::Validation(format!(
                "目标文件已被其他任务占用: {}", destination.display()
            )));
        }
        Ok(())
    }
}

impl Actor for TaskRegistry {
    type Context = Context<Self>;

    fn started(&mut self, _ctx: &mut Self::Context) {
        log::info!("任务管理器已启动，同时下载上限 {}", self.max_download_load);
    }

    fn stopped(&mut self, _ctx: &mut Self::Context) {
        log::info!("任务管理器已停止");
    }
}

impl Handler<RegisterTask> for TaskRegistry {
    type Result = ResponseActFuture<Self, Result<TaskId, DownloadError>>;

    fn handle(&mut self, msg: RegisterTask, _ctx: &mut Self::Context) -> Self::Result {
        // 编号在校验前分配，失败的注册也不会复用
        self.task_counter += 1;
        let id = TaskId(self.task_counter);
        if let Err(e) = self.check_destination(&msg.destination) {
            log::warn!("[{}] 注册任务失败: {}", id, e);
            let rejected: Result<TaskId, DownloadError> = Err(e);
            return Box::pin(async move { rejected }.into_actor(self));
        }
        self.registering.insert(msg.destination.clone());

        let destination = msg.destination.clone();
        let created = Downloader::create(
            id,
            msg.source,
            msg.destination,
            msg.config,
            Arc::clone(&self.admission),
        );

        Box::pin(created.into_actor(self).map(move |result, actor, _ctx| {
            actor.registering.remove(&destination);
            let downloader = result.map_err(|e| {
                log::warn!("[{}] 注册任务失败: {}", id, e);
                e
            })?;
            actor.tasks.insert(id, Arc::clone(&downloader));
            actix::spawn(async move {
                if let Err(e) = downloader.start().await {
                    log::debug!("[{}] 任务未启动: {}", downloader.id(), e);
                }
            });
            Ok(id)
        }))
    }
}

impl Handler<LookupTask> for TaskRegistry {
    type Result = Result<Arc<Downloader>, DownloadError>;

    fn handle(&mut self, msg: LookupTask, _ctx: &mut Self::Context) -> Self::Result {
        self.get(msg.0)
    }
}

impl Handler<RemoveTask> for TaskRegistry {
    type Result = Result<(), DownloadError>;

    fn handle(&mut self, msg: RemoveTask, _ctx: &mut Self::Context) -> Self::Result {
        let downloader = self.get(msg.0)?;
        if !downloader.state().is_terminal() {
            return Err(DownloadError::NotTerminal(msg.0));
        }
        self.tasks.remove(&msg.0);
        log::info!("[{}] 已移除任务", msg.0);
        Ok(())
    }
}

impl Handler<ControlTask> for TaskRegistry {
    type Result = ResponseFuture<Result<CommandReply, DownloadError>>;

    fn handle(&mut self, msg: ControlTask, _ctx: &mut Self::Context) -> Self::Result {
        let downloader = match self.get(msg.id) {
            Ok(downloader) => downloader,
            Err(e) => return Box::pin(async move { Err(e) }),
        };
        Box::pin(async move {
            match msg.command {
                TaskCommand::Pause => Ok(CommandReply::State(downloader.pause().await?)),
                TaskCommand::Resume => Ok(CommandReply::State(downloader.resume().await?)),
                TaskCommand::Cancel => Ok(CommandReply::State(downloader.cancel()?)),
                TaskCommand::Status => Ok(CommandReply::Status(downloader.status())),
            }
        })
    }
}

impl Handler<ListTasks> for TaskRegistry {
    type Result = MessageResult<ListTasks>;

    fn handle(&mut self, _msg: ListTasks, _ctx: &mut Self::Context) -> Self::Result {
        let mut snapshots: Vec<StatusSnapshot> = self.tasks.values().map(|d| d.status()).collect();
        snapshots.sort_by_key(|s| s.task_id);
        MessageResult(snapshots)
    }
}

impl Handler<GetStats> for TaskRegistry {
    type Result = MessageResult<GetStats>;

    fn handle(&mut self, _msg: GetStats, _ctx: &mut Self::Context) -> Self::Result {
        let mut stats = RegistryStats::default();
        for downloader in self.tasks.values() {
            let status = downloader.status();
            stats.total += 1;
            match status.state {
                TaskState::Pending => stats.pending += 1,
                TaskState::Running => stats.running += 1,
                TaskState::Paused => stats.paused += 1,
                TaskState::Completed => stats.completed += 1,
                TaskState::Failed => stats.failed += 1,
                TaskState::Cancelled => stats.cancelled += 1,
            }
            stats.total_bytes += status.total_size;
            stats.downloaded_bytes += status.bytes_downloaded;
            stats.speed += status.speed;
        }
        MessageResult(stats)
    }
}

impl Handler<Shutdown> for TaskRegistry {
    type Result = ResponseActFuture<Self, ()>;

    fn handle(&mut self, _msg: Shutdown, _ctx: &mut Self::Context) -> Self::Result {
        log::info!("正在停止 {} 个任务", self.tasks.len());
        let downloaders: Vec<Arc<Downloader>> = self.tasks.values().cloned().collect();
        let drained = async move {
            for downloader in &downloaders {
                if !downloader.state().is_terminal() {
                    let _ = downloader.cancel();
                }
            }
            futures::future::join_all(downloaders.iter().map(|d| d.wait_idle())).await;
        };
        Box::pin(drained.into_actor(self).map(|_, _actor, ctx| ctx.stop()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::source::mock::MemorySource;
    use std::time::Duration;
    use tokio_test::{assert_err, assert_ok};

    fn task_config() -> TaskConfig {
        TaskConfig {
            max_parallel: 2,
            cache_size: 4096,
            min_chunk_size: 1024,
            retry_count: 3,
            retry_delay_ms: 1,
            retry_max_delay_ms: 5,
            status_interval_ms: 10,
            enable_resume: false,
        }
    }

    fn register(source: MemorySource, destination: PathBuf) -> RegisterTask {
        RegisterTask { source: Arc::new(source), destination, config: task_config() }
    }

    async fn status(addr: &Addr<TaskRegistry>, id: TaskId) -> StatusSnapshot {
        match addr.send(ControlTask { id, command: TaskCommand::Status }).await.unwrap().unwrap() {
            CommandReply::Status(snapshot) => snapshot,
            other => panic!("unexpected reply: {:?}", other),
        }
    }

    async fn wait_terminal(addr: &Addr<TaskRegistry>, id: TaskId) -> StatusSnapshot {
        for _ in 0..4000 {
            let snapshot = status(addr, id).await;
            if snapshot.state.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("任务 {} 没有结束", id);
    }

    #[actix_rt::test]
    async fn test_register_and_complete() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        let data = MemorySource::pattern(50_000);
        let addr = TaskRegistry::new(2).start();

        let id = addr.send(register(MemorySource::new(data.clone()), dest.clone())).await.unwrap().unwrap();
        let snapshot = wait_terminal(&addr, id).await;
        assert_eq!(snapshot.state, TaskState::Completed);
        assert_eq!(snapshot.bytes_downloaded, 50_000);
        assert_eq!(std::fs::read(&dest).unwrap(), data);

        let listed = addr.send(ListTasks).await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].task_id, id);
    }

    #[actix_rt::test]
    async fn test_ids_are_unique_and_never_reused() {
        let dir = tempfile::tempdir().unwrap();
        let addr = TaskRegistry::new(2).start();

        let first = addr.send(register(MemorySource::new(vec![1; 100]), dir.path().join("1"))).await.unwrap().unwrap();
        let rejected = addr.send(register(MemorySource::new(Vec::new()), dir.path().join("2"))).await.unwrap();
        assert!(matches!(rejected, Err(DownloadError::Validation(_))));
        let second = addr.send(register(MemorySource::new(vec![1; 100]), dir.path().join("3"))).await.unwrap().unwrap();
        assert!(second > first);

        wait_terminal(&addr, first).await;
        assert_ok!(addr.send(RemoveTask(first)).await.unwrap());
        let third = addr.send(register(MemorySource::new(vec![1; 100]), dir.path().join("4"))).await.unwrap().unwrap();
        assert_ne!(third, first);
        assert!(third > second);
    }

    #[actix_rt::test]
    async fn test_unknown_task() {
        let dir = tempfile::tempdir().unwrap();
        let addr = TaskRegistry::new(1).start();
        let known = addr.send(register(MemorySource::new(vec![5; 100]), dir.path().join("a.bin"))).await.unwrap().unwrap();
        wait_terminal(&addr, known).await;
        let stats_before = addr.send(GetStats).await.unwrap();
        let list_before = addr.send(ListTasks).await.unwrap();
        let missing = TaskId(42);

        let looked_up = addr.send(LookupTask(missing)).await.unwrap();
        assert!(matches!(looked_up, Err(DownloadError::NotFound(id)) if id == missing));

        let controlled = addr.send(ControlTask { id: missing, command: TaskCommand::Pause }).await.unwrap();
        assert!(matches!(controlled, Err(DownloadError::NotFound(_))));

        let removed = addr.send(RemoveTask(missing)).await.unwrap();
        assert!(matches!(removed, Err(DownloadError::NotFound(_))));

        // 查不到的任务不会留下任何痕迹
        assert_eq!(addr.send(GetStats).await.unwrap(), stats_before);
        assert_eq!(addr.send(ListTasks).await.unwrap(), list_before);
        let next = addr.send(register(MemorySource::new(vec![5; 100]), dir.path().join("b.bin"))).await.unwrap().unwrap();
        assert_eq!(next, TaskId(known.0 + 1));
    }

    #[actix_rt::test]
    async fn test_destination_held_by_active_task() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        let addr = TaskRegistry::new(2).start();
        let slow = MemorySource::new(MemorySource::pattern(64 * 1024)).throttled(512, Duration::from_millis(2));
        let first = addr.send(register(slow, dest.clone())).await.unwrap().unwrap();

        let clash = addr.send(register(MemorySource::new(vec![1; 100]), dest.clone())).await.unwrap();
        assert!(matches!(clash, Err(DownloadError::Validation(_))));
        assert_eq!(addr.send(GetStats).await.unwrap().total, 1);

        let reply = addr.send(ControlTask { id: first, command: TaskCommand::Cancel }).await.unwrap().unwrap();
        assert_eq!(reply, CommandReply::State(TaskState::Cancelled));
        let cancelled = addr.send(LookupTask(first)).await.unwrap().unwrap();
        cancelled.wait_idle().await;

        // 原任务结束后同一路径可以重新注册
        let data = vec![9u8; 100];
        let second = addr.send(register(MemorySource::new(data.clone()), dest.clone())).await.unwrap().unwrap();
        let done = wait_terminal(&addr, second).await;
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[actix_rt::test]
    async fn test_invalid_destination_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let addr = TaskRegistry::new(1).start();

        let result = addr.send(register(MemorySource::new(vec![1; 100]), dir.path().to_path_buf())).await.unwrap();
        assert!(matches!(result, Err(DownloadError::Validation(_))));

        let stats = addr.send(GetStats).await.unwrap();
        assert_eq!(stats.total, 0);
    }

    #[actix_rt::test]
    async fn test_running_tasks_bounded_by_load() {
        let dir = tempfile::tempdir().unwrap();
        let addr = TaskRegistry::new(1).start();
        let mut ids = Vec::new();
        for i in 0..3 {
            let source = MemorySource::new(MemorySource::pattern(16 * 1024)).throttled(1024, Duration::from_millis(1));
            let id = addr.send(register(source, dir.path().join(format!("{}.bin", i)))).await.unwrap().unwrap();
            ids.push(id);
        }

        let mut saw_queued = false;
        loop {
            let stats = addr.send(GetStats).await.unwrap();
            assert!(stats.running <= 1, "同时运行的任务超过上限: {:?}", stats);
            assert_eq!(stats.failed + stats.cancelled, 0);
            saw_queued |= stats.pending > 0;
            if stats.completed == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        assert!(saw_queued);

        let stats = addr.send(GetStats).await.unwrap();
        assert_eq!(stats.downloaded_bytes, 3 * 16 * 1024);
        assert_eq!(stats.active(), 0);
    }

    #[actix_rt::test]
    async fn test_remove_requires_terminal_state() {
        let dir = tempfile::tempdir().unwrap();
        let addr = TaskRegistry::new(1).start();
        let source = MemorySource::new(MemorySource::pattern(64 * 1024)).throttled(512, Duration::from_millis(2));
        let id = addr.send(register(source, dir.path().join("a.bin"))).await.unwrap().unwrap();

        let removed = assert_err!(addr.send(RemoveTask(id)).await.unwrap());
        assert!(matches!(removed, DownloadError::NotTerminal(_)));

        let reply = addr.send(ControlTask { id, command: TaskCommand::Cancel }).await.unwrap().unwrap();
        assert_eq!(reply, CommandReply::State(TaskState::Cancelled));
        assert_ok!(addr.send(RemoveTask(id)).await.unwrap());
        assert!(matches!(addr.send(LookupTask(id)).await.unwrap(), Err(DownloadError::NotFound(_))));
    }

    #[actix_rt::test]
    async fn test_pause_reply_waits_for_workers() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a.bin");
        let data = MemorySource::pattern(128 * 1024);
        let addr = TaskRegistry::new(1).start();
        let source = MemorySource::new(data.clone()).throttled(1024, Duration::from_millis(1));
        let id = addr.send(register(source, dest.clone())).await.unwrap().unwrap();

        while status(&addr, id).await.bytes_downloaded == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        let reply = addr.send(ControlTask { id, command: TaskCommand::Pause }).await.unwrap().unwrap();
        assert_eq!(reply, CommandReply::State(TaskState::Paused));

        let first = status(&addr, id).await;
        tokio::time::sleep(Duration::from_millis(30)).await;
        let second = status(&addr, id).await;
        assert_eq!(first.bytes_downloaded, second.bytes_downloaded);
        assert!(first.bytes_downloaded > 0 && first.bytes_downloaded < 128 * 1024);

        let reply = addr.send(ControlTask { id, command: TaskCommand::Resume }).await.unwrap().unwrap();
        assert_eq!(reply, CommandReply::State(TaskState::Running));
        let done = wait_terminal(&addr, id).await;
        assert_eq!(done.state, TaskState::Completed);
        assert_eq!(std::fs::read(&dest).unwrap(), data);
    }

    #[actix_rt::test]
    async fn test_shutdown_cancels_everything() {
        let dir = tempfile::tempdir().unwrap();
        let addr = TaskRegistry::new(1).start();
        for i in 0..2 {
            let source = MemorySource::new(MemorySource::pattern(64 * 1024)).throttled(512, Duration::from_millis(2));
            addr.send(register(source, dir.path().join(format!("{}.bin", i)))).await.unwrap().unwrap();
        }
        let snapshots = addr.send(ListTasks).await.unwrap();
        let mut downloaders = Vec::new();
        for snapshot in &snapshots {
            downloaders.push(addr.send(LookupTask(snapshot.task_id)).await.unwrap().unwrap());
        }
        assert_eq!(downloaders.len(), 2);

        addr.send(Shutdown).await.unwrap();
        for downloader in &downloaders {
            assert_eq!(downloader.state(), TaskState::Cancelled);
        }
    }
}
