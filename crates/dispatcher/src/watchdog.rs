use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info};

use scheduler_core::SchedulerResult;
use scheduler_domain::Repositories;

use crate::notifier::Notifier;

/// 长时间运行提醒，每个执行最多通知一次
pub struct LongRunningWatchdog {
    repos: Repositories,
    notifier: Arc<dyn Notifier>,
    /// 为零时关闭
    threshold: Duration,
}

impl LongRunningWatchdog {
    pub fn new(repos: Repositories, notifier: Arc<dyn Notifier>, threshold: Duration) -> Self {
        Self {
            repos,
            notifier,
            threshold,
        }
    }

    pub async fn check(&self) -> SchedulerResult<usize> {
        if self.threshold.is_zero() {
            return Ok(0);
        }
        let Ok(threshold) = chrono::Duration::from_std(self.threshold) else {
            return Ok(0);
        };
        let now = Utc::now();

        let mut notified = 0;
        for execution in self.repos.executions.find_long_running(now - threshold).await? {
            // 先占用 mailed_at，保证只通知一次
            if !self.repos.executions.mark_mailed(execution.id, now).await? {
                continue;
            }
            if let Err(e) = self.notifier.notify_long_running(&execution).await {
                error!(execution_id = execution.id, "发送长时间运行通知失败: {}", e);
            }
            notified += 1;
        }

        if notified > 0 {
            info!("发现 {} 个长时间运行的执行", notified);
        }
        Ok(notified)
    }
}
