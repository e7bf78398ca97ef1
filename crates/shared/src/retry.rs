//! 重试与退避
//!
//! 两处用到指数退避：
//! - 发布、重新入队等基础设施调用遇到瞬时故障时原地重试；
//! - 消费端处理失败的消息重新入队后，再次处理前按投递次数退避，避免热循环；
//! - 长期运行的后台任务异常退出后，按连续失败次数退避重建。

use std::future::Future;
use std::time::Duration;

use tracing::{info, warn};

use crate::error::FulfillmentError;

/// 指数退避策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// 最大重试次数（不含首次执行）
    pub max_retries: u32,
    pub initial_delay: Duration,
    /// 退避上限
    pub max_delay: Duration,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    /// 最多重试 3 次，初始等待 1 秒，最大等待 30 秒，倍数 2.0
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// 消费端重投递退避：500ms 起步，最长 10 秒
    pub fn redelivery(max_redeliveries: u32) -> Self {
        Self {
            max_retries: max_redeliveries,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            multiplier: 2.0,
        }
    }

    /// 第 N 次重试前的等待时间（attempt 从 0 开始）
    ///
    /// initial_delay * multiplier^attempt，不超过 max_delay。
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_ms = self.initial_delay.as_millis() as f64;
        let delay_ms = base_ms * self.multiplier.powi(attempt as i32);
        let capped_ms = delay_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64)
    }

    /// attempt 为已失败的重试轮次，小于 max_retries 时继续
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt < self.max_retries
    }

    /// 第 `delivery_attempt` 次投递（首次为 1）处理前的等待时间，首次投递不等待
    pub fn delay_before_delivery(&self, delivery_attempt: u32) -> Duration {
        match delivery_attempt {
            0 | 1 => Duration::ZERO,
            n => self.delay_for_attempt(n - 2),
        }
    }
}

/// 后台任务重建退避
///
/// 连续失败时按 `RetryPolicy` 递增等待；一次运行持续超过 `healthy_after`
/// 视为已恢复，失败计数清零。
#[derive(Debug, Clone)]
pub struct RestartBackoff {
    policy: RetryPolicy,
    healthy_after: Duration,
    failures: u32,
}

impl RestartBackoff {
    pub fn new(policy: RetryPolicy, healthy_after: Duration) -> Self {
        Self {
            policy,
            healthy_after,
            failures: 0,
        }
    }

    /// 记录一次异常退出，返回重建前的等待时间
    pub fn on_failure(&mut self, ran_for: Duration) -> Duration {
        if ran_for >= self.healthy_after {
            self.failures = 0;
        }
        let delay = self.policy.delay_for_attempt(self.failures);
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// 连续失败次数
    pub fn failures(&self) -> u32 {
        self.failures
    }
}

/// 带重试的异步执行器
///
/// 只在 `is_retryable` 返回 true 时重试，其余错误直接向上传播。
pub async fn retry_with_policy<F, Fut, T>(
    policy: &RetryPolicy,
    operation_name: &str,
    is_retryable: impl Fn(&FulfillmentError) -> bool,
    mut operation: F,
) -> Result<T, FulfillmentError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FulfillmentError>>,
{
    let mut attempt: u32 = 0;

    loop {
        match operation().await {
            Ok(value) => {
                if attempt > 0 {
                    info!(operation = operation_name, attempt, "操作在重试后成功");
                }
                return Ok(value);
            }
            Err(err) if !is_retryable(&err) => {
                warn!(operation = operation_name, error = %err, "操作失败且不可重试");
                return Err(err);
            }
            Err(err) if !policy.should_retry(attempt) => {
                warn!(
                    operation = operation_name,
                    attempt,
                    max_retries = policy.max_retries,
                    error = %err,
                    "已达最大重试次数，放弃"
                );
                return Err(err);
            }
            Err(err) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    operation = operation_name,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "操作失败，退避后重试"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
