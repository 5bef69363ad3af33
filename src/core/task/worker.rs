use bytes::Bytes;
use futures::StreamExt;
use std::io::SeekFrom;
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::{watch, Mutex};

use crate::core::error::DownloadError;
use crate::core::source::RemoteSource;
use super::chunk_manager::{Chunk, ChunkPlan};
use super::retry::{RetryContext, RetryStrategy};
use super::state::{ChunkState, Signal, TaskId};
use super::util::{BufferPool, PooledBuffer};

/// 同一任务所有 worker 共享的资源
pub(crate) struct WorkerContext {
    pub task_id: TaskId,
    pub plan: Arc<ChunkPlan>,
    pub source: Arc<dyn RemoteSource>,
    pub file: Mutex<File>,
    pub buffers: Arc<BufferPool>,
    pub retry: RetryStrategy,
}

/// 单个分块的结束方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Outcome {
    Finished,
    Interrupted,
}

/// 下载 worker：反复领取分块，直到没有可领的块或收到暂停/取消信号
pub(crate) struct Worker {
    id: usize,
    ctx: Arc<WorkerContext>,
    signal: watch::Receiver<Signal>,
}

/// 等待信号离开 Run；发送端已关闭时按取消处理
async fn stopped(signal: &mut watch::Receiver<Signal>) -> Signal {
    match signal.wait_for(|s| *s != Signal::Run).await {
        Ok(s) => *s,
        Err(_) => Signal::Cancel,
    }
}

impl Worker {
    pub fn new(id: usize, ctx: Arc<WorkerContext>, signal: watch::Receiver<Signal>) -> Self {
        Self { id, ctx, signal }
    }

    fn current_signal(&self) -> Signal {
        *self.signal.borrow()
    }

    pub async fn run(mut self) -> Result<(), DownloadError> {
        let plan = Arc::clone(&self.ctx.plan);
        while self.current_signal() == Signal::Run {
            let Some(index) = plan.claim_next() else { break };
            let chunk = plan.chunk(index);
            log::debug!(
                "[{}] worker {} 领取分块 {} [{}, {}) 偏移 {}",
                self.ctx.task_id, self.id, index, chunk.start, chunk.end, chunk.resume_offset()
            );
            match self.run_chunk(chunk).await {
                Ok(Outcome::Finished) => {
                    plan.release(index, ChunkState::Done);
                    log::debug!("[{}] 分块 {} 完成", self.ctx.task_id, index);
                }
                Ok(Outcome::Interrupted) => {
                    plan.release(index, ChunkState::Pending);
                    break;
                }
                Err(e) => {
                    plan.release(index, ChunkState::Failed);
                    log::error!("[{}] 分块 {} 下载失败: {}", self.ctx.task_id, index, e);
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// 带重试地下载一个分块，每次都从当前断点继续
    async fn run_chunk(&mut self, chunk: &Chunk) -> Result<Outcome, DownloadError> {
        let mut retry = RetryContext::new(self.ctx.retry.clone());
        loop {
            let before = chunk.resume_offset();
            let error = match self.transfer(chunk).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) => e,
            };
            if error.is_fatal() {
                return Err(error);
            }
            if chunk.resume_offset() > before {
                retry.reset();
            }
            if !retry.should_retry(&error) {
                return Err(retry.exhausted(error));
            }
            let delay = retry.record_failure();
            let total = chunk.record_retry();
            log::warn!(
                "[{}] 分块 {} 出错: {}，{:?} 后第 {} 次重试（累计 {} 次）",
                self.ctx.task_id, chunk.index, error, delay, retry.attempt, total
            );
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stopped(&mut self.signal) => return Ok(Outcome::Interrupted),
            }
        }
    }

    /// 一次传输尝试：读取远程数据，按缓冲区大小写入目标文件
    async fn transfer(&mut self, chunk: &Chunk) -> Result<Outcome, DownloadError> {
        if chunk.remaining() == 0 {
            return Ok(Outcome::Finished);
        }
        let ctx = Arc::clone(&self.ctx);

        let mut stream = tokio::select! {
            biased;
            _ = stopped(&mut self.signal) => return Ok(Outcome::Interrupted),
            opened = ctx.source.read_range(chunk.next_offset(), chunk.end) => opened?,
        };
        let mut buffer = tokio::select! {
            biased;
            _ = stopped(&mut self.signal) => return Ok(Outcome::Interrupted),
            buffer = ctx.buffers.acquire() => buffer?,
        };

        let mut pending = Bytes::new();
        let mut failure = None;
        let mut eof = false;
        loop {
            let mut stop = None;
            while !buffer.is_full() && (buffer.len() as u64) < chunk.remaining() {
                if pending.is_empty() {
                    if eof || failure.is_some() {
                        break;
                    }
                    tokio::select! {
                        biased;
                        signal = stopped(&mut self.signal) => {
                            stop = Some(signal);
                            break;
                        }
                        item = stream.next() => match item {
                            Some(Ok(bytes)) => pending = bytes,
                            Some(Err(e)) => failure = Some(e),
                            None => eof = true,
                        },
                    }
                    continue;
                }
                let wanted = (chunk.remaining() - buffer.len() as u64).min(buffer.room() as u64) as usize;
                let take = pending.len().min(wanted);
                buffer.extend_from_slice(&pending.split_to(take));
            }

            // 取消后不再写入任何数据
            if stop == Some(Signal::Cancel) || self.current_signal() == Signal::Cancel {
                return Ok(Outcome::Interrupted);
            }
            if !buffer.is_empty() {
                self.flush(chunk, &mut buffer).await?;
            }
            if chunk.remaining() == 0 {
                return Ok(Outcome::Finished);
            }
            if stop.is_some() {
                return Ok(Outcome::Interrupted);
            }
            if let Some(e) = failure.take() {
                return Err(e);
            }
            if eof {
                return Err(DownloadError::TransientNetwork(format!(
                    "数据流提前结束，分块 {} 还差 {} 字节", chunk.index, chunk.remaining()
                )));
            }
        }
    }

    /// 定位写入，成功后才推进断点偏移
    async fn flush(&self, chunk: &Chunk, buffer: &mut PooledBuffer) -> Result<(), DownloadError> {
        let offset = chunk.next_offset();
        {
            let mut file = self.ctx.file.lock().await;
            file.seek(SeekFrom::Start(offset)).await?;
            file.write_all(&buffer[..]).await?;
            file.flush().await?;
        }
        chunk.advance(buffer.len() as u64);
        buffer.clear();
        Ok(())
    }
}
