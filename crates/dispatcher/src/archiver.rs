use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info};

use scheduler_core::SchedulerResult;
use scheduler_domain::{Execution, ExecutionHistory, Repositories};

/// 历史归档
///
/// 终态执行在被观察到时转入 `execution_histories`；已终结实例的令牌在保留期后清理。
pub struct HistoryArchiver {
    repos: Repositories,
    token_retention: Duration,
}

impl HistoryArchiver {
    pub fn new(repos: Repositories, token_retention: Duration) -> Self {
        Self { repos, token_retention }
    }

    pub async fn archive(&self, execution: &Execution) -> SchedulerResult<Option<ExecutionHistory>> {
        let history = self.repos.executions.archive(execution.id).await?;
        if let Some(history) = &history {
            debug!(
                execution_id = execution.id,
                token_id = execution.token_id,
                "执行已归档为历史 {}",
                history.id
            );
        }
        Ok(history)
    }

    /// 删除超过保留期的已终结实例的令牌，返回删除的令牌数
    pub async fn sweep_tokens(&self) -> SchedulerResult<u64> {
        let retention = chrono::Duration::from_std(self.token_retention).unwrap_or(chrono::Duration::MAX);
        let Some(cutoff) = Utc::now().checked_sub_signed(retention) else {
            return Ok(0);
        };

        let mut removed = 0;
        for instance_id in self.repos.instances.find_resolved_before(cutoff).await? {
            removed += self.repos.tokens.delete_by_instance(instance_id).await?;
        }

        if removed > 0 {
            info!("清理过期令牌 {} 个", removed);
        }
        Ok(removed)
    }
}
