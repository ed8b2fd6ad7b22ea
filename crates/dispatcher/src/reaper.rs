use std::time::Duration;

use chrono::Utc;
use tracing::{info, warn};

use scheduler_core::SchedulerResult;
use scheduler_domain::Repositories;

/// 失联回收
///
/// Worker 停止心跳后，其持有的未结束执行被标记为结束（无退出码），
/// 由令牌执行器按普通失败处理重试与传播。
pub struct ExecutionReaper {
    repos: Repositories,
    heartbeat_timeout: Duration,
}

impl ExecutionReaper {
    pub fn new(repos: Repositories, heartbeat_timeout: Duration) -> Self {
        Self {
            repos,
            heartbeat_timeout,
        }
    }

    /// 返回回收的执行数
    pub async fn reap(&self) -> SchedulerResult<usize> {
        let now = Utc::now();
        let timeout = chrono::Duration::from_std(self.heartbeat_timeout).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = now.checked_sub_signed(timeout) else {
            return Ok(0);
        };

        let mut reaped = 0;
        for execution in self.repos.executions.find_orphaned(cutoff).await? {
            let worker = format!(
                "{}#{}",
                execution.hostname.as_deref().unwrap_or("?"),
                execution.worker_id.unwrap_or_default()
            );
            self.repos
                .executions
                .append_output(execution.id, &format!("\n[Worker {worker} 失联，执行被回收]\n"))
                .await?;
            if self.repos.executions.complete(execution.id, None, None, now).await? {
                warn!(execution_id = execution.id, worker = %worker, "回收失联Worker的执行");
                reaped += 1;
            }
        }

        for worker in self.repos.workers.find_stale(cutoff).await? {
            if worker.working {
                continue;
            }
            if self.repos.workers.unregister(&worker.hostname, worker.worker_id).await? {
                info!(worker = %worker.display_name(), "注销心跳超时的Worker");
            }
        }

        Ok(reaped)
    }
}
