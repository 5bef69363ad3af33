use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use serde::{Serialize, Deserialize};

use super::state::ChunkState;

/// 下载块，范围为左闭右开 `[start, end)`
#[derive(Debug)]
pub struct Chunk {
    pub index: usize,
    pub start: u64,
    pub end: u64,
    state: AtomicU8,
    written: AtomicU64, // 已落盘的字节数，即断点偏移
    retries: AtomicU32,
}

impl Chunk {
    fn new(index: usize, start: u64, end: u64) -> Self {
        Self {
            index,
            start,
            end,
            state: AtomicU8::new(ChunkState::Pending as u8),
            written: AtomicU64::new(0),
            retries: AtomicU32::new(0),
        }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn state(&self) -> ChunkState {
        ChunkState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn resume_offset(&self) -> u64 {
        self.written.load(Ordering::Acquire)
    }

    pub fn retries(&self) -> u32 {
        self.retries.load(Ordering::Relaxed)
    }

    /// 下一次写入的绝对偏移
    pub fn next_offset(&self) -> u64 {
        self.start + self.resume_offset()
    }

    pub fn remaining(&self) -> u64 {
        self.len() - self.resume_offset()
    }

    /// 落盘后推进断点偏移，返回新的偏移
    pub(crate) fn advance(&self, bytes: u64) -> u64 {
        let previous = self.written.fetch_add(bytes, Ordering::AcqRel);
        debug_assert!(previous + bytes <= self.len(), "断点偏移超出分块范围");
        previous + bytes
    }

    pub(crate) fn record_retry(&self) -> u32 {
        self.retries.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn set_state(&self, state: ChunkState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// 分块计划：把 `[0, total_size)` 切成互不重叠、首尾相接的若干块
#[derive(Debug)]
pub struct ChunkPlan {
    chunks: Vec<Chunk>,
    total_size: u64,
    max_in_flight: usize,
    in_flight: AtomicUsize,
}

/// 单个分块的断点信息
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkCheckpoint {
    pub start: u64,
    pub end: u64,
    pub written: u64,
}

impl ChunkPlan {
    /// 分块数 = min(max_parallel, ceil(total / min_chunk_size))，各块大小尽量相等
    pub fn ranges(total_size: u64, max_parallel: usize, min_chunk_size: u64) -> Vec<(u64, u64)> {
        if total_size == 0 {
            return Vec::new();
        }
        let by_size = (total_size + min_chunk_size.max(1) - 1) / min_chunk_size.max(1);
        let count = by_size.min(max_parallel.max(1) as u64).max(1);
        let base = total_size / count;
        let remainder = total_size % count;

        let mut ranges = Vec::with_capacity(count as usize);
        let mut start = 0;
        for i in 0..count {
            let size = base + if i < remainder { 1 } else { 0 };
            ranges.push((start, start + size));
            start += size;
        }
        ranges
    }

    pub fn new(total_size: u64, max_parallel: usize, min_chunk_size: u64) -> Self {
        let chunks = Self::ranges(total_size, max_parallel, min_chunk_size)
            .into_iter()
            .enumerate()
            .map(|(index, (start, end))| Chunk::new(index, start, end))
            .collect();
        Self {
            chunks,
            total_size,
            max_in_flight: max_parallel.max(1),
            in_flight: AtomicUsize::new(0),
        }
    }

    pub fn total_size(&self) -> u64 {
        self.total_size
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn chunk(&self, index: usize) -> &Chunk {
        &self.chunks[index]
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// 领取下一个待下载的块并标记为下载中；并发数已满或没有待下载块时返回 None
    pub fn claim_next(&self) -> Option<usize> {
        let mut current = self.in_flight.load(Ordering::Acquire);
        loop {
            if current >= self.max_in_flight {
                return None;
            }
            match self.in_flight.compare_exchange(current, current + 1, Ordering::AcqRel, Ordering::Acquire) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }

        for chunk in &self.chunks {
            let claimed = chunk.state.compare_exchange(
                ChunkState::Pending as u8,
                ChunkState::InFlight as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if claimed.is_ok() {
                return Some(chunk.index);
            }
        }

        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        None
    }

    /// 归还下载中的块
    pub fn release(&self, index: usize, state: ChunkState) {
        let chunk = &self.chunks[index];
        debug_assert_eq!(chunk.state(), ChunkState::InFlight);
        if state == ChunkState::Done {
            chunk.written.store(chunk.len(), Ordering::Release);
        }
        chunk.set_state(state);
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
    }

    /// 恢复下载前把失败的块放回队列，已写入的偏移保留
    pub fn requeue_failed(&self) -> usize {
        let mut count = 0;
        for chunk in &self.chunks {
            let requeued = chunk.state.compare_exchange(
                ChunkState::Failed as u8,
                ChunkState::Pending as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            );
            if requeued.is_ok() {
                count += 1;
            }
        }
        count
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    /// 尚未完成的块数
    pub fn remaining(&self) -> usize {
        self.chunks.iter().filter(|c| c.state() != ChunkState::Done).count()
    }

    pub fn is_complete(&self) -> bool {
        self.chunks.iter().all(|c| c.state() == ChunkState::Done)
    }

    /// 已落盘字节数，只读原子计数
    pub fn bytes_downloaded(&self) -> u64 {
        self.chunks.iter().map(|c| c.resume_offset()).sum()
    }

    pub fn checkpoints(&self) -> Vec<ChunkCheckpoint> {
        self.chunks
            .iter()
            .map(|c| ChunkCheckpoint { start: c.start, end: c.end, written: c.resume_offset() })
            .collect()
    }

    /// 按断点恢复各块偏移；分块布局必须完全一致，否则不做任何修改
    pub fn restore(&self, checkpoints: &[ChunkCheckpoint]) -> bool {
        if checkpoints.len() != self.chunks.len() {
            return false;
        }
        let layout_matches = self.chunks.iter().zip(checkpoints).all(|(c, cp)| {
            c.start == cp.start && c.end == cp.end && cp.written <= c.len()
        });
        if !layout_matches || self.in_flight() != 0 {
            return false;
        }
        for (chunk, cp) in self.chunks.iter().zip(checkpoints) {
            chunk.written.store(cp.written, Ordering::Release);
            let state = if cp.written == chunk.len() { ChunkState::Done } else { ChunkState::Pending };
            chunk.set_state(state);
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn assert_partition(total: u64, ranges: &[(u64, u64)]) {
        let mut expected_start = 0;
        for &(start, end) in ranges {
            assert_eq!(start, expected_start, "分块之间存在空隙或重叠");
            assert!(end > start, "空分块");
            expected_start = end;
        }
        assert_eq!(expected_start, total);
    }

    #[test]
    fn test_million_bytes_four_chunks() {
        let ranges = ChunkPlan::ranges(1_000_000, 4, 1024);
        assert_eq!(ranges, vec![
            (0, 250_000),
            (250_000, 500_000),
            (500_000, 750_000),
            (750_000, 1_000_000),
        ]);
    }

    #[test]
    fn test_ranges_partition_exactly() {
        for &(total, parallel, min_chunk) in &[
            (1u64, 4usize, 1024u64),
            (1023, 8, 1024),
            (1025, 8, 1024),
            (999_999, 7, 1),
            (10_000_019, 16, 65_536),
            (5, 10, 1),
        ] {
            let ranges = ChunkPlan::ranges(total, parallel, min_chunk);
            assert!(ranges.len() <= parallel);
            assert_partition(total, &ranges);
            let sizes: Vec<u64> = ranges.iter().map(|(s, e)| e - s).collect();
            let max = *sizes.iter().max().unwrap();
            let min = *sizes.iter().min().unwrap();
            assert!(max - min <= 1, "分块大小不均匀: {:?}", sizes);
        }
    }

    #[test]
    fn test_small_file_uses_fewer_chunks() {
        let ranges = ChunkPlan::ranges(3000, 8, 1024);
        assert_eq!(ranges.len(), 3);
        assert!(ChunkPlan::ranges(0, 8, 1024).is_empty());
    }

    #[test]
    fn test_claim_respects_max_in_flight() {
        let plan = ChunkPlan::new(100, 4, 1);
        let first = plan.claim_next().unwrap();
        let second = plan.claim_next().unwrap();
        let third = plan.claim_next().unwrap();
        let fourth = plan.claim_next().unwrap();
        assert_eq!(plan.claim_next(), None);
        assert_eq!(plan.in_flight(), 4);

        plan.release(first, ChunkState::Done);
        plan.release(second, ChunkState::Pending);
        assert_eq!(plan.claim_next(), Some(second));
        assert_eq!(plan.claim_next(), None);

        plan.release(third, ChunkState::Done);
        plan.release(fourth, ChunkState::Done);
        plan.release(second, ChunkState::Done);
        assert!(plan.is_complete());
        assert_eq!(plan.bytes_downloaded(), 100);
        assert_eq!(plan.in_flight(), 0);
    }

    #[test]
    fn test_failed_chunks_requeued_with_offset() {
        let plan = ChunkPlan::new(100, 2, 1);
        let idx = plan.claim_next().unwrap();
        plan.chunk(idx).advance(10);
        plan.release(idx, ChunkState::Failed);
        assert_eq!(plan.requeue_failed(), 1);
        assert_eq!(plan.chunk(idx).state(), ChunkState::Pending);
        assert_eq!(plan.chunk(idx).resume_offset(), 10);
    }

    #[test]
    fn test_restore_checkpoints() {
        let plan = ChunkPlan::new(100, 2, 1);
        let checkpoints = vec![
            ChunkCheckpoint { start: 0, end: 50, written: 50 },
            ChunkCheckpoint { start: 50, end: 100, written: 20 },
        ];
        assert!(plan.restore(&checkpoints));
        assert_eq!(plan.chunk(0).state(), ChunkState::Done);
        assert_eq!(plan.chunk(1).state(), ChunkState::Pending);
        assert_eq!(plan.bytes_downloaded(), 70);
        assert_eq!(plan.checkpoints(), checkpoints);

        let other = ChunkPlan::new(100, 4, 1);
        assert!(!other.restore(&checkpoints));
        assert_eq!(other.bytes_downloaded(), 0);
    }
}
