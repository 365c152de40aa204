//! 重试策略

use crate::error::TransferError;
use std::time::Duration;

/// 两次尝试之间的等待方式
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    Fixed(Duration),
    /// `base * 2^(n-1)`，不超过 `max`
    Exponential { base: Duration, max: Duration },
}

impl Backoff {
    /// 第 `retry` 次重试（从 1 开始）前的等待时间
    pub fn delay(&self, retry: u32) -> Duration {
        match *self {
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, max } => {
                let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(factor).min(max)
            }
        }
    }
}

/// 传输失败后的重试策略
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 首次尝试之外最多重试的次数
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff: Backoff) -> Self {
        Self { max_retries, backoff }
    }

    /// 不重试
    pub fn none() -> Self {
        Self::new(0, Backoff::Fixed(Duration::ZERO))
    }

    /// 已经尝试 `attempts` 次并得到 `err` 后是否还应再试
    pub fn should_retry(&self, err: &TransferError, attempts: u32) -> bool {
        err.is_transient() && attempts <= self.max_retries
    }

    /// 已经尝试 `attempts` 次后，下一次尝试前的等待时间
    pub fn delay_before(&self, attempts: u32) -> Duration {
        self.backoff.delay(attempts)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(
            3,
            Backoff::Exponential {
                base: Duration::from_secs(2),
                max: Duration::from_secs(60),
            },
        )
    }
}
