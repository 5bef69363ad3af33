use std::io;
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::core::error::DownloadError;

/// 缓冲区池：容量固定，取不到缓冲区时等待而不是额外分配
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    permits: Arc<Semaphore>,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(capacity: usize, buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size,
            permits: Arc::new(Semaphore::new(capacity.max(1))),
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    /// 取一个清空的缓冲区，池空时挂起
    pub async fn acquire(self: &Arc<Self>) -> Result<PooledBuffer, DownloadError> {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|_| DownloadError::LocalIo(io::Error::new(io::ErrorKind::Other, "缓冲区池已关闭")))?;
        let buffer = self
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Vec::with_capacity(self.buffer_size));
        Ok(PooledBuffer {
            buffer,
            pool: Arc::clone(self),
            _permit: permit,
        })
    }
}

/// 从池中借出的缓冲区，drop 时归还
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
    _permit: OwnedSemaphorePermit,
}

impl PooledBuffer {
    /// 缓冲区剩余可写空间
    pub fn room(&self) -> usize {
        self.pool.buffer_size.saturating_sub(self.buffer.len())
    }

    pub fn is_full(&self) -> bool {
        self.room() == 0
    }
}

impl Deref for PooledBuffer {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buffer
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let mut buffer = std::mem::take(&mut self.buffer);
        buffer.clear();
        if let Ok(mut free) = self.pool.free.lock() {
            free.push(buffer);
        }
    }
}
