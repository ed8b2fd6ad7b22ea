use std::future::Future;
use std::time::Duration;

use tracing::warn;

use scheduler_core::SchedulerResult;

/// 存储写入失败时的退避重试策略
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff_multiplier: f64,
    /// `None` 表示一直重试到成功
    pub max_attempts: Option<u32>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(10),
            backoff_multiplier: 2.0,
            max_attempts: None,
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts.max(1));
        self
    }

    /// 第 `attempt` 次失败后的等待时间，从 0 开始计数
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.backoff_multiplier.max(1.0).powi(attempt.min(32) as i32);
        self.initial_delay.mul_f64(factor).min(self.max_delay)
    }

    /// 执行操作直到成功；致命错误和用尽次数时返回最后一次错误
    pub async fn run<T, F, Fut>(&self, operation: &str, mut f: F) -> SchedulerResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = SchedulerResult<T>>,
    {
        let mut attempt = 0;
        loop {
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    attempt += 1;
                    if self.max_attempts.is_some_and(|max| attempt >= max) {
                        return Err(e);
                    }
                    let delay = self.delay_for(attempt - 1);
                    warn!("{}失败 (第 {} 次)，{:?} 后重试: {}", operation, attempt, delay, e);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}
