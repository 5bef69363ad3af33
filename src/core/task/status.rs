use chrono::{DateTime, Utc};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use super::chunk_manager::ChunkPlan;
use super::state::{ChunkState, TaskId, TaskState};

/// 单个 worker（即其当前负责的分块）的进度
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerStatus {
    pub chunk: usize,
    pub start: u64,
    pub end: u64,
    pub state: ChunkState,
    pub downloaded: u64,
    pub retries: u32,
    pub speed: u64, // B/s
}

/// 任务在某一时刻的进度快照，生成后不再修改
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusSnapshot {
    pub task_id: TaskId,
    pub state: TaskState,
    pub location: String,
    pub destination: PathBuf,
    pub total_size: u64,
    pub bytes_downloaded: u64,
    pub speed: u64, // B/s
    pub workers: Vec<WorkerStatus>,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl StatusSnapshot {
    pub fn progress(&self) -> f32 {
        if self.total_size == 0 {
            return 0.0;
        }
        (self.bytes_downloaded as f32 / self.total_size as f32) * 100.0
    }

    pub fn in_flight(&self) -> usize {
        self.workers.iter().filter(|w| w.state == ChunkState::InFlight).count()
    }
}

/// 快照中不来自分块计数器的部分
pub(crate) struct SnapshotHeader<'a> {
    pub task_id: TaskId,
    pub state: TaskState,
    pub location: &'a str,
    pub destination: &'a PathBuf,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct Sample {
    at: Option<Instant>,
    offsets: Vec<u64>,
    speeds: Vec<u64>,
    total_speed: u64,
}

/// 周期性读取分块原子计数器计算速度；不会碰传输路径上的任何锁
#[derive(Debug)]
pub struct StatusAggregator {
    interval: Duration,
    sample: Mutex<Sample>,
}

impl StatusAggregator {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            sample: Mutex::new(Sample::default()),
        }
    }

    /// 采样一次
    pub fn sample(&self, plan: &ChunkPlan) {
        let now = Instant::now();
        let offsets: Vec<u64> = plan.chunks().iter().map(|c| c.resume_offset()).collect();
        let Ok(mut sample) = self.sample.lock() else { return };

        let speeds = match sample.at {
            Some(previous) if sample.offsets.len() == offsets.len() => {
                let elapsed = now.duration_since(previous).as_secs_f64();
                offsets
                    .iter()
                    .zip(&sample.offsets)
                    .map(|(current, last)| {
                        if elapsed > 0.0 {
                            (current.saturating_sub(*last) as f64 / elapsed) as u64
                        } else {
                            0
                        }
                    })
                    .collect()
            }
            _ => vec![0; offsets.len()],
        };

        sample.total_speed = speeds.iter().sum();
        sample.speeds = speeds;
        sample.offsets = offsets;
        sample.at = Some(now);
    }

    /// 没有 worker 运行时速度归零，并丢弃基线
    pub fn reset(&self) {
        if let Ok(mut sample) = self.sample.lock() {
            *sample = Sample::default();
        }
    }

    pub fn speed(&self) -> u64 {
        self.sample.lock().map(|s| s.total_speed).unwrap_or(0)
    }

    pub(crate) fn spawn_sampler(self: &Arc<Self>, plan: Arc<ChunkPlan>) -> JoinHandle<()> {
        let aggregator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(aggregator.interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                aggregator.sample(&plan);
            }
        })
    }

    /// 合并最近一次采样与当前计数器，生成快照
    pub(crate) fn snapshot(&self, plan: &ChunkPlan, header: SnapshotHeader<'_>) -> StatusSnapshot {
        let (speeds, total_speed) = match self.sample.lock() {
            Ok(sample) => (sample.speeds.clone(), sample.total_speed),
            Err(_) => (Vec::new(), 0),
        };
        let workers = plan
            .chunks()
            .iter()
            .map(|c| WorkerStatus {
                chunk: c.index,
                start: c.start,
                end: c.end,
                state: c.state(),
                downloaded: c.resume_offset(),
                retries: c.retries(),
                speed: speeds.get(c.index).copied().unwrap_or(0),
            })
            .collect::<Vec<_>>();

        StatusSnapshot {
            task_id: header.task_id,
            state: header.state,
            location: header.location.to_string(),
            destination: header.destination.clone(),
            total_size: plan.total_size(),
            bytes_downloaded: workers.iter().map(|w| w.downloaded).sum(),
            speed: total_speed,
            workers,
            error: header.error,
            created_at: header.created_at,
            started_at: header.started_at,
            finished_at: header.finished_at,
        }
    }
}
