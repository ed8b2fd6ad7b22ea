use tracing::info;

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{InstanceLogLevel, JobInstance, Repositories, Variables};

/// 触发接口：外部调度器或人工调用创建作业实例
pub struct TriggerService {
    repos: Repositories,
}

impl TriggerService {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// 为定义的当前版本创建实例
    ///
    /// 实例创建后处于等待准入状态，挂起或 prevent_multi 只会推迟准入，不会拒绝触发。
    pub async fn trigger(&self, job_definition_id: i64, context: Variables) -> SchedulerResult<JobInstance> {
        let definition = self
            .repos
            .definitions
            .find_by_id(job_definition_id)
            .await?
            .ok_or(SchedulerError::JobDefinitionNotFound { id: job_definition_id })?;

        // 不允许把无法编译的脚本带进实例
        definition.compile()?;

        let instance = self.repos.instances.create(&JobInstance::new(&definition, context)).await?;
        self.repos
            .logs
            .append(
                instance.id,
                InstanceLogLevel::Info,
                &format!("实例已创建: {} v{}", definition.name, definition.version),
            )
            .await?;

        info!(
            instance_id = instance.id,
            definition_id = definition.id,
            "触发作业 {} (版本 {})",
            definition.name,
            definition.version
        );
        Ok(instance)
    }
}
