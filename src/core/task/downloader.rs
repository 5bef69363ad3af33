use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::fs::OpenOptions;
use tokio::sync::{watch, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinSet;

use crate::config::TaskConfig;
use crate::core::error::DownloadError;
use crate::core::source::RemoteSource;
use crate::utils::validator;
use super::chunk_manager::ChunkPlan;
use super::resume::{resume_path, ResumeInfo};
use super::state::{Signal, TaskId, TaskState};
use super::status::{SnapshotHeader, StatusAggregator, StatusSnapshot};
use super::util::BufferPool;
use super::worker::{Worker, WorkerContext};

/// 受任务锁保护的可变部分
#[derive(Debug)]
struct Control {
    state: TaskState,
    error: Option<String>,
    frozen: Option<StatusSnapshot>, // 取消时冻结的快照
    started_at: Option<DateTime<Utc>>,
    finished_at: Option<DateTime<Utc>>,
}

impl Control {
    /// 所有状态迁移都经过这里，按 `TaskState::can_transition_to` 检查
    fn transition(&mut self, next: TaskState, action: &'static str) -> Result<(), DownloadError> {
        if !self.state.can_transition_to(next) {
            return Err(DownloadError::InvalidTransition { state: self.state, action });
        }
        self.state = next;
        if next.is_terminal() {
            self.finished_at = Some(Utc::now());
        }
        Ok(())
    }
}

/// 单个下载任务：持有分块计划、worker 池和生命周期状态
pub struct Downloader {
    id: TaskId,
    source: Arc<dyn RemoteSource>,
    destination: PathBuf,
    config: TaskConfig,
    plan: Arc<ChunkPlan>,
    aggregator: Arc<StatusAggregator>,
    admission: Arc<Semaphore>,
    control: Mutex<Control>,
    signal: watch::Sender<Signal>,
    idle: watch::Sender<bool>,
    created_at: DateTime<Utc>,
}

impl Downloader {
    /// 探测远程大小、校验目标路径并预分配文件；有匹配的断点信息时从断点恢复
    pub async fn create(
        id: TaskId,
        source: Arc<dyn RemoteSource>,
        destination: PathBuf,
        config: TaskConfig,
        admission: Arc<Semaphore>,
    ) -> Result<Arc<Self>, DownloadError> {
        if config.max_parallel == 0 {
            return Err(DownloadError::Validation("单任务并发数必须大于0".to_string()));
        }
        if config.cache_size == 0 {
            return Err(DownloadError::Validation("下载缓存必须大于0".to_string()));
        }
        validator::validate_destination(&destination)?;

        let total_size = source.probe_size().await?;
        if total_size == 0 {
            return Err(DownloadError::Validation(format!(
                "无法获取远程文件大小: {}", source.location()
            )));
        }

        let plan = Arc::new(ChunkPlan::new(total_size, config.max_parallel, config.min_chunk_size));
        let restored = config.enable_resume
            && Self::restore(&plan, source.location(), &destination).await;

        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(!restored)
            .open(&destination)
            .await
            .map_err(|e| DownloadError::Validation(format!(
                "目标文件不可写 {}: {}", destination.display(), e
            )))?;
        file.set_len(total_size).await?;
        drop(file);

        if restored {
            log::info!(
                "[{}] 从断点恢复 {}，已下载 {}/{} 字节",
                id, destination.display(), plan.bytes_downloaded(), total_size
            );
        }
        log::info!(
            "[{}] 创建任务 {} -> {}，大小 {} 字节，{} 个分块",
            id, source.location(), destination.display(), total_size, plan.len()
        );

        let (signal, _) = watch::channel(Signal::Run);
        let (idle, _) = watch::channel(true);
        Ok(Arc::new(Self {
            id,
            source,
            destination,
            aggregator: Arc::new(StatusAggregator::new(config.status_interval())),
            config,
            plan,
            admission,
            control: Mutex::new(Control {
                state: TaskState::Pending,
                error: None,
                frozen: None,
                started_at: None,
                finished_at: None,
            }),
            signal,
            idle,
            created_at: Utc::now(),
        }))
    }

    /// 断点信息与远程文件一致、目标文件仍在时恢复各分块偏移
    async fn restore(plan: &ChunkPlan, location: &str, destination: &Path) -> bool {
        let info = match ResumeInfo::load(destination).await {
            Ok(Some(info)) => info,
            Ok(None) => return false,
            Err(e) => {
                log::warn!("读取断点文件失败: {}", e);
                return false;
            }
        };
        if !info.matches(location, plan.total_size()) {
            log::info!("断点信息与远程文件不一致，重新下载 {}", destination.display());
            return false;
        }
        let file_ok = tokio::fs::metadata(destination)
            .await
            .map(|m| m.is_file() && m.len() == plan.total_size())
            .unwrap_or(false);
        file_ok && plan.restore(&info.chunks)
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn location(&self) -> &str {
        self.source.location()
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    pub fn total_size(&self) -> u64 {
        self.plan.total_size()
    }

    pub fn config(&self) -> &TaskConfig {
        &self.config
    }

    pub fn plan(&self) -> &ChunkPlan {
        &self.plan
    }

    fn control(&self) -> MutexGuard<'_, Control> {
        self.control.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn state(&self) -> TaskState {
        self.control().state
    }

    fn invalid(&self, action: &'static str) -> DownloadError {
        DownloadError::InvalidTransition { state: self.state(), action }
    }

    /// 等待下载名额，期间被取消则返回 None
    async fn admit(&self) -> Option<OwnedSemaphorePermit> {
        let mut signal = self.signal.subscribe();
        tokio::select! {
            permit = Arc::clone(&self.admission).acquire_owned() => permit.ok(),
            _ = signal.wait_for(|s| *s == Signal::Cancel) => None,
        }
    }

    /// Pending -> Running，名额不足时在这里排队
    pub async fn start(self: &Arc<Self>) -> Result<TaskState, DownloadError> {
        if self.state() != TaskState::Pending {
            return Err(self.invalid("start"));
        }
        let Some(permit) = self.admit().await else {
            return Err(self.invalid("start"));
        };
        self.launch(permit, TaskState::Pending, "start")?;
        Ok(TaskState::Running)
    }

    /// Running -> Paused，worker 在下一个缓冲区边界停下
    ///
    /// 等所有 worker 把缓冲区落盘并退出后才返回，之后查询到的进度不再变化。
    /// 暂停时恰好下完的任务返回 Completed。
    pub async fn pause(&self) -> Result<TaskState, DownloadError> {
        {
            let mut control = self.control();
            if control.state != TaskState::Paused {
                control.transition(TaskState::Paused, "pause")?;
                self.signal.send_replace(Signal::Pause);
                log::info!("[{}] 暂停下载", self.id);
            }
        }
        self.wait_idle().await;
        Ok(self.state())
    }

    /// Paused -> Running：等旧的 worker 池退出后重新排队
    pub async fn resume(self: &Arc<Self>) -> Result<TaskState, DownloadError> {
        match self.state() {
            TaskState::Running => return Ok(TaskState::Running),
            TaskState::Paused => {}
            state => return Err(DownloadError::InvalidTransition { state, action: "resume" }),
        }
        self.wait_idle().await;
        let Some(permit) = self.admit().await else {
            return Err(self.invalid("resume"));
        };
        self.launch(permit, TaskState::Paused, "resume")?;
        Ok(TaskState::Running)
    }

    /// 任意非终止状态 -> Cancelled，进度冻结在这一刻
    pub fn cancel(&self) -> Result<TaskState, DownloadError> {
        {
            let mut control = self.control();
            if control.state == TaskState::Cancelled {
                return Ok(TaskState::Cancelled);
            }
            control.transition(TaskState::Cancelled, "cancel")?;
            self.signal.send_replace(Signal::Cancel);

            let mut frozen = self.snapshot(&control);
            frozen.speed = 0;
            for worker in &mut frozen.workers {
                worker.speed = 0;
            }
            control.frozen = Some(frozen);
        }
        log::info!("[{}] 取消下载", self.id);

        if self.config.enable_resume {
            let path = resume_path(&self.destination);
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    log::warn!("删除断点文件 {} 失败: {}", path.display(), e);
                }
            }
        }
        Ok(TaskState::Cancelled)
    }

    /// 任何状态都可以调用，不等待传输 IO
    pub fn status(&self) -> StatusSnapshot {
        let control = self.control();
        match &control.frozen {
            Some(frozen) => frozen.clone(),
            None => self.snapshot(&control),
        }
    }

    fn snapshot(&self, control: &Control) -> StatusSnapshot {
        self.aggregator.snapshot(&self.plan, SnapshotHeader {
            task_id: self.id,
            state: control.state,
            location: self.source.location(),
            destination: &self.destination,
            error: control.error.clone(),
            created_at: self.created_at,
            started_at: control.started_at,
            finished_at: control.finished_at,
        })
    }

    /// 等待当前 worker 池（如果有）全部退出
    pub async fn wait_idle(&self) {
        let mut idle = self.idle.subscribe();
        let _ = idle.wait_for(|idle| *idle).await;
    }

    fn launch(
        self: &Arc<Self>,
        permit: OwnedSemaphorePermit,
        expected: TaskState,
        action: &'static str,
    ) -> Result<(), DownloadError> {
        let mut control = self.control();
        if control.state == TaskState::Running && expected == TaskState::Paused {
            // 另一个 resume 已经抢先启动
            return Ok(());
        }
        if control.state != expected {
            return Err(DownloadError::InvalidTransition { state: control.state, action });
        }
        control.transition(TaskState::Running, action)?;
        control.started_at.get_or_insert_with(Utc::now);

        let requeued = self.plan.requeue_failed();
        if requeued > 0 {
            log::info!("[{}] 重新排队 {} 个失败的分块", self.id, requeued);
        }
        self.signal.send_replace(Signal::Run);
        self.idle.send_replace(false);
        tokio::spawn(Arc::clone(self).run_pool(permit));
        log::info!("[{}] 开始下载 {}", self.id, self.source.location());
        Ok(())
    }

    /// worker 出错：仅在 Running 时记为失败，并通知其余 worker 停止
    fn fail(&self, error: DownloadError) {
        let mut control = self.control();
        match control.transition(TaskState::Failed, "fail") {
            Ok(()) => {
                log::error!("[{}] 下载失败: {}", self.id, error);
                control.error = Some(error.user_message());
                self.signal.send_replace(Signal::Cancel);
            }
            Err(_) => log::debug!("[{}] 任务已{}，忽略错误: {}", self.id, control.state, error),
        }
    }

    async fn run_pool(self: Arc<Self>, permit: OwnedSemaphorePermit) {
        match OpenOptions::new().write(true).open(&self.destination).await {
            Ok(file) => {
                let workers = self.config.max_parallel.min(self.plan.remaining()).max(1);
                let ctx = Arc::new(WorkerContext {
                    task_id: self.id,
                    plan: Arc::clone(&self.plan),
                    source: Arc::clone(&self.source),
                    file: tokio::sync::Mutex::new(file),
                    buffers: BufferPool::new(workers, self.config.cache_size),
                    retry: self.config.retry_strategy(),
                });
                let sampler = self.aggregator.spawn_sampler(Arc::clone(&self.plan));

                let mut set = JoinSet::new();
                for id in 0..workers {
                    let worker = Worker::new(id, Arc::clone(&ctx), self.signal.subscribe());
                    set.spawn(worker.run());
                }
                while let Some(joined) = set.join_next().await {
                    match joined {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) => self.fail(e),
                        Err(e) => self.fail(DownloadError::LocalIo(std::io::Error::new(
                            std::io::ErrorKind::Other,
                            format!("worker 异常退出: {}", e),
                        ))),
                    }
                }

                sampler.abort();
                self.aggregator.reset();
                // 所有 worker 已退出，这里释放文件句柄
                drop(ctx);
            }
            Err(e) => self.fail(e.into()),
        }

        self.settle().await;
        drop(permit);
        self.idle.send_replace(true);
    }

    /// worker 池退出后的收尾：判定完成，保存或清理断点信息
    async fn settle(&self) {
        let state = {
            let mut control = self.control();
            let complete = self.plan.is_complete();
            match control.state {
                // 暂停与最后一个分块完成同时发生时也算下载完成
                TaskState::Running | TaskState::Paused if complete => {
                    if let Err(e) = control.transition(TaskState::Completed, "complete") {
                        log::warn!("[{}] {}", self.id, e);
                    }
                }
                TaskState::Running => {
                    if control.transition(TaskState::Failed, "settle").is_ok() {
                        control.error = Some("下载未完成，worker 已全部退出".to_string());
                    }
                }
                _ => {}
            }
            control.state
        };

        if self.config.enable_resume {
            match state {
                TaskState::Paused | TaskState::Failed => {
                    let info = ResumeInfo::new(
                        self.source.location(),
                        self.plan.total_size(),
                        self.plan.checkpoints(),
                    );
                    if let Err(e) = info.save(&self.destination).await {
                        log::warn!("[{}] 保存断点信息失败: {}", self.id, e);
                    }
                }
                TaskState::Completed | TaskState::Cancelled => {
                    ResumeInfo::remove(&self.destination).await;
                }
                _ => {}
            }
        }

        match state {
            TaskState::Completed => log::info!(
                "[{}] 下载完成 {} ({} 字节)", self.id, self.destination.display(), self.plan.total_size()
            ),
            other => log::info!(
                "[{}] worker 池已退出，状态: {}，已下载 {}/{} 字节",
                self.id, other, self.plan.bytes_downloaded(), self.plan.total_size()
            ),
        }
    }
}
