//! 领域运行配置
//!
use bon::Builder;
use chronicle_core::retry::{ReactionRetryPolicy, RetryPolicy};
use chronicle_core::unit::DEFAULT_CAUSAL_TIMEOUT;
use std::time::Duration;

/// 领域配置：以默认值起步，按需覆盖
///
/// ```
/// use chronicle_core::retry::ReactionRetryPolicy;
/// use chronicle_domain::config::DomainConfig;
/// use std::time::Duration;
///
/// let config = DomainConfig::builder()
///     .reaction_retry(ReactionRetryPolicy::new([Duration::from_millis(1); 4]))
///     .build();
/// assert_eq!(config.reaction_retry.attempts(), 5);
/// assert_eq!(config.write_retry.max_attempts, 10);
/// assert_eq!(config.causal_timeout, Duration::from_secs(30));
/// ```
#[derive(Debug, Clone, Builder)]
pub struct DomainConfig {
    /// 聚合写入冲突时的整条命令重试
    #[builder(default)]
    pub write_retry: RetryPolicy,
    /// Saga 反应失败时的重试阶梯
    #[builder(default)]
    pub reaction_retry: ReactionRetryPolicy,
    /// 实例在处理途中被策略卸载时，重新获取实例的次数上限
    #[builder(default = 3)]
    pub reload_attempts: u32,
    /// 带 `heads` 的查询等待投影追上的上限
    #[builder(default = DEFAULT_CAUSAL_TIMEOUT)]
    pub causal_timeout: Duration,
}

impl Default for DomainConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}
