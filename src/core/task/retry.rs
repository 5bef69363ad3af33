use std::time::Duration;
use crate::core::error::DownloadError;

/// 重试策略
#[derive(Debug, Clone)]
pub struct RetryStrategy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    pub jitter_factor: f64, // 抖动因子，避免多个分块同时重试
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }
}

impl RetryStrategy {
    /// `attempt` 为已经连续重试的次数
    pub fn should_retry(&self, error: &DownloadError, attempt: u32) -> bool {
        attempt < self.max_retries && error.is_retryable()
    }

    pub fn get_delay(&self, attempt: u32) -> Duration {
        let delay_secs = self.base_delay.as_secs_f64() *
            self.backoff_multiplier.powi(attempt as i32);

        let jitter = delay_secs * self.jitter_factor * (rand::random::<f64>() - 0.5);
        let final_delay = (delay_secs + jitter).max(0.0);

        Duration::from_secs_f64(final_delay).min(self.max_delay)
    }
}

/// 单个分块的重试上下文，取得进展后清零
#[derive(Debug)]
pub struct RetryContext {
    pub strategy: RetryStrategy,
    pub attempt: u32,
}

impl RetryContext {
    pub fn new(strategy: RetryStrategy) -> Self {
        Self {
            strategy,
            attempt: 0,
        }
    }

    pub fn should_retry(&self, error: &DownloadError) -> bool {
        self.strategy.should_retry(error, self.attempt)
    }

    /// 记录一次失败，返回下一次重试前需要等待的时间
    pub fn record_failure(&mut self) -> Duration {
        let delay = self.strategy.get_delay(self.attempt);
        self.attempt += 1;
        delay
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// 重试用尽后交给上层的错误
    pub fn exhausted(&self, error: DownloadError) -> DownloadError {
        if error.is_retryable() {
            DownloadError::MaxRetriesExceeded {
                attempts: self.attempt,
                last: error.to_string(),
            }
        } else {
            error
        }
    }
}
