use async_trait::async_trait;
use tracing::{info, warn};

use scheduler_core::SchedulerResult;
use scheduler_domain::{Execution, JobInstance};

/// 外部通知通道（邮件、聊天室、Webhook等）的接入点
///
/// 通知是尽力而为的：调用方记录错误后继续，不回滚任何状态变更。
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify_error(&self, instance: &JobInstance, message: &str) -> SchedulerResult<()>;

    async fn notify_cancellation(&self, instance: &JobInstance) -> SchedulerResult<()>;

    async fn notify_long_running(&self, execution: &Execution) -> SchedulerResult<()>;
}

/// 只写日志的默认实现
#[derive(Debug, Default, Clone)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify_error(&self, instance: &JobInstance, message: &str) -> SchedulerResult<()> {
        warn!(
            instance_id = instance.id,
            definition_id = instance.job_definition_id,
            "作业实例失败: {}",
            message
        );
        Ok(())
    }

    async fn notify_cancellation(&self, instance: &JobInstance) -> SchedulerResult<()> {
        info!(
            instance_id = instance.id,
            definition_id = instance.job_definition_id,
            "作业实例已取消"
        );
        Ok(())
    }

    async fn notify_long_running(&self, execution: &Execution) -> SchedulerResult<()> {
        warn!(
            execution_id = execution.id,
            instance_id = execution.job_instance_id,
            "执行运行时间过长: {}",
            execution.shell
        );
        Ok(())
    }
}
