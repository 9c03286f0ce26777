//! 重试策略
//!
//! - `RetryPolicy`：聚合写入遇到 `OutOfSequence` 时的整条命令重试（指数退避 + 抖动）；
//! - `ReactionRetryPolicy`：Saga 反应失败时的固定延迟阶梯。
//!
use rand::Rng;
use std::time::Duration;

/// 乐观并发冲突的重试策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// 包含首次尝试在内的最大尝试次数
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// 在退避时长上叠加的随机抖动上限
    pub jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(500),
            jitter: Duration::from_millis(10),
        }
    }
}

impl RetryPolicy {
    /// 不重试：首次冲突即失败
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// 第 `attempt` 次（从 1 开始）失败后的等待时长
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let backoff = self
            .base_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay);

        let jitter_ms = self.jitter.as_millis() as u64;
        if jitter_ms == 0 {
            return backoff;
        }
        backoff + Duration::from_millis(rand::rng().random_range(0..=jitter_ms))
    }

    pub fn has_attempts_left(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }
}

/// Saga 反应的重试阶梯：首次尝试失败后依次等待各延迟再试，
/// 总尝试次数为 `delays.len() + 1`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReactionRetryPolicy {
    pub delays: Vec<Duration>,
}

impl Default for ReactionRetryPolicy {
    fn default() -> Self {
        Self::new([1, 10, 100, 1000].map(Duration::from_millis))
    }
}

impl ReactionRetryPolicy {
    pub fn new(delays: impl IntoIterator<Item = Duration>) -> Self {
        Self {
            delays: delays.into_iter().collect(),
        }
    }

    pub fn attempts(&self) -> usize {
        self.delays.len() + 1
    }
}
