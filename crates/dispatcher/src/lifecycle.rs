use std::sync::Arc;

use chrono::Utc;
use tracing::{error, info, warn};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{InstanceLogLevel, JobInstance, JobInstanceStatus, Repositories, TokenStatus};

use crate::executor::TokenExecutor;
use crate::notifier::Notifier;

/// 作业实例生命周期控制器
///
/// 观察根令牌的决议结果并设置实例的终态标记；处理人工取消与人工重试。
pub struct LifecycleController {
    repos: Repositories,
    executor: Arc<TokenExecutor>,
    notifier: Arc<dyn Notifier>,
}

impl LifecycleController {
    pub fn new(repos: Repositories, executor: Arc<TokenExecutor>, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            repos,
            executor,
            notifier,
        }
    }

    /// 根令牌终结后设置实例终态，返回本次新设置的状态
    pub async fn resolve(&self, instance: &JobInstance) -> SchedulerResult<Option<JobInstanceStatus>> {
        let Some(root) = self.repos.tokens.find_root(instance.id).await? else {
            return Ok(None);
        };

        let now = Utc::now();
        let resolved = match root.status {
            TokenStatus::Success | TokenStatus::Warning => {
                if !self.repos.instances.mark_finished(instance.id, now).await? {
                    return Ok(None);
                }
                self.repos
                    .logs
                    .append(instance.id, InstanceLogLevel::Info, "实例执行完成")
                    .await?;
                info!(instance_id = instance.id, "作业实例执行完成 ({})", root.status.as_str());
                JobInstanceStatus::Finished
            }
            TokenStatus::Failure => {
                if !self.repos.instances.mark_error(instance.id, now).await? {
                    return Ok(None);
                }
                let message = root.message.clone().unwrap_or_else(|| "根步骤失败".to_string());
                self.repos
                    .logs
                    .append(instance.id, InstanceLogLevel::Error, &format!("实例执行失败: {message}"))
                    .await?;
                warn!(instance_id = instance.id, "作业实例执行失败: {}", message);

                if let Err(e) = self.notifier.notify_error(instance, &message).await {
                    error!(instance_id = instance.id, "发送失败通知出错: {}", e);
                }
                JobInstanceStatus::Error
            }
            TokenStatus::Canceled => {
                if !self.repos.instances.mark_canceled(instance.id, now).await? {
                    return Ok(None);
                }
                JobInstanceStatus::Canceled
            }
            _ => return Ok(None),
        };
        Ok(Some(resolved))
    }

    /// 人工取消
    ///
    /// 立即设置 canceled_at 阻止后续认领，令牌树的取消由执行器异步完成。
    pub async fn cancel_instance(&self, job_instance_id: i64) -> SchedulerResult<JobInstance> {
        let instance = self.load(job_instance_id).await?;
        if instance.is_resolved() {
            return Err(SchedulerError::InvalidStateTransition(format!(
                "作业实例 {} 已终结，无法取消",
                job_instance_id
            )));
        }

        self.repos.instances.mark_canceled(job_instance_id, Utc::now()).await?;
        if let Some(root) = self.repos.tokens.find_root(job_instance_id).await? {
            self.executor.cancel_subtree(&root).await?;
        }
        self.repos
            .logs
            .append(job_instance_id, InstanceLogLevel::Warn, "实例被人工取消")
            .await?;
        info!(instance_id = job_instance_id, "作业实例已请求取消");

        let definition = self
            .repos
            .definitions
            .find_by_id(instance.job_definition_id)
            .await?;
        if definition.is_some_and(|d| d.notify_cancellation) {
            if let Err(e) = self.notifier.notify_cancellation(&instance).await {
                error!(instance_id = job_instance_id, "发送取消通知出错: {}", e);
            }
        }

        self.load(job_instance_id).await
    }

    /// 人工重试出错的实例
    ///
    /// 失败与被取消的令牌被重置：没有子令牌的回到 PENDING 并获得新的重试额度，
    /// 已展开的复合令牌回到 RUNNING 继续汇聚。
    pub async fn retry_instance(&self, job_instance_id: i64) -> SchedulerResult<JobInstance> {
        let instance = self.load(job_instance_id).await?;
        if instance.status() != JobInstanceStatus::Error {
            return Err(SchedulerError::InvalidStateTransition(format!(
                "作业实例 {} 不处于错误状态，无法重试",
                job_instance_id
            )));
        }

        let tokens = self.repos.tokens.find_by_instance(job_instance_id).await?;
        if tokens.is_empty() {
            return Err(SchedulerError::InvalidStateTransition(format!(
                "作业实例 {} 的令牌已被清理，无法重试",
                job_instance_id
            )));
        }

        let mut reset = 0;
        for token in tokens
            .iter()
            .filter(|t| matches!(t.status, TokenStatus::Failure | TokenStatus::Canceled))
        {
            let expanded = tokens.iter().any(|t| t.parent_id == Some(token.id));
            let changed = if expanded {
                self.repos
                    .tokens
                    .transition(token.id, token.status, TokenStatus::Running, Some("人工重试"))
                    .await?
            } else {
                self.repos.tokens.reset_for_retry(token.id, token.status, 0).await?
            };
            if changed {
                reset += 1;
            }
        }

        self.repos.instances.mark_retrying(job_instance_id).await?;
        self.repos
            .logs
            .append(
                job_instance_id,
                InstanceLogLevel::Info,
                &format!("实例被人工重试，重置 {reset} 个令牌"),
            )
            .await?;
        info!(instance_id = job_instance_id, "作业实例重试，重置 {} 个令牌", reset);

        self.load(job_instance_id).await
    }

    async fn load(&self, job_instance_id: i64) -> SchedulerResult<JobInstance> {
        self.repos
            .instances
            .find_by_id(job_instance_id)
            .await?
            .ok_or(SchedulerError::JobInstanceNotFound { id: job_instance_id })
    }
}
