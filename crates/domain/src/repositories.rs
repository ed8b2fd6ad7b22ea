//! 领域仓储抽象
//!
//! 共享的关系型存储是Worker之间唯一的同步点，所有跨进程的互斥都通过
//! 这里声明的条件更新完成。

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::entities::{
    Execution, ExecutionHistory, InstanceLog, InstanceLogLevel, JobDefinition, JobInstance,
    MemoryConsumptionLog, MemoryExpectancy, ProcessSignal, ScriptRevision, Token, TokenStatus,
    Worker,
};
use crate::value_objects::Variables;
use crate::SchedulerResult;

/// 作业定义仓储
#[async_trait]
pub trait JobDefinitionRepository: Send + Sync {
    /// 创建定义并写入第一条脚本修订
    async fn create(&self, definition: &JobDefinition, editor: Option<&str>) -> SchedulerResult<JobDefinition>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<JobDefinition>>;
    async fn find_all(&self) -> SchedulerResult<Vec<JobDefinition>>;
    /// 更新除脚本和版本以外的属性
    async fn update(&self, definition: &JobDefinition) -> SchedulerResult<JobDefinition>;
    /// 修改脚本：版本号加一并追加修订记录
    async fn update_script(&self, id: i64, script: &str, editor: Option<&str>) -> SchedulerResult<JobDefinition>;
    async fn find_revisions(&self, id: i64) -> SchedulerResult<Vec<ScriptRevision>>;
    /// 删除定义及其已终结的实例；仍有未终结实例时拒绝，定义不存在时返回 `false`
    async fn delete(&self, id: i64) -> SchedulerResult<bool>;
}

/// 作业实例仓储
///
/// finished_at / canceled_at / error_at 三个终态标记的写入都以"三者皆空"为前提，
/// 保证最多只有一个被设置。
#[async_trait]
pub trait JobInstanceRepository: Send + Sync {
    async fn create(&self, instance: &JobInstance) -> SchedulerResult<JobInstance>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<JobInstance>>;
    async fn find_by_definition(&self, job_definition_id: i64) -> SchedulerResult<Vec<JobInstance>>;
    /// 尚未准入且未终结的实例，按创建顺序
    async fn find_pending(&self, limit: u32) -> SchedulerResult<Vec<JobInstance>>;
    /// 已准入且未终结的实例
    async fn find_running(&self) -> SchedulerResult<Vec<JobInstance>>;
    /// 已准入且仍有未结束令牌（或尚未决议）的实例，包括正在取消中的实例
    async fn find_active(&self) -> SchedulerResult<Vec<JobInstance>>;
    /// 准入检查：定义未挂起，且同定义运行中的实例数小于 prevent_multi
    async fn try_admit(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool>;
    async fn mark_finished(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool>;
    async fn mark_error(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool>;
    async fn mark_canceled(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool>;
    /// 清除 error_at 并设置 retrying
    async fn mark_retrying(&self, id: i64) -> SchedulerResult<bool>;
    /// 在给定时间之前终结的实例ID
    async fn find_resolved_before(&self, cutoff: DateTime<Utc>) -> SchedulerResult<Vec<i64>>;
}

/// 令牌仓储
#[async_trait]
pub trait TokenRepository: Send + Sync {
    /// (job_instance_id, path) 唯一
    async fn create(&self, token: &Token) -> SchedulerResult<Token>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Token>>;
    async fn find_by_instance(&self, job_instance_id: i64) -> SchedulerResult<Vec<Token>>;
    async fn find_root(&self, job_instance_id: i64) -> SchedulerResult<Option<Token>>;
    async fn find_children(&self, parent_id: i64) -> SchedulerResult<Vec<Token>>;
    /// 比较并交换状态，只有当前状态等于 `from` 时才更新
    async fn transition(
        &self,
        id: i64,
        from: TokenStatus,
        to: TokenStatus,
        message: Option<&str>,
    ) -> SchedulerResult<bool>;
    /// 重置为 PENDING 并写入新的重试计数
    async fn reset_for_retry(&self, id: i64, from: TokenStatus, retry_count: i32) -> SchedulerResult<bool>;
    async fn update_context(&self, id: i64, context: &Variables) -> SchedulerResult<()>;
    async fn delete_by_instance(&self, job_instance_id: i64) -> SchedulerResult<u64>;
}

/// 调度队列与执行记录仓储
#[async_trait]
pub trait ExecutionRepository: Send + Sync {
    /// 在同一事务中写入执行记录并把所属令牌从 PENDING 推进到 RUNNING
    async fn dispatch(&self, execution: &Execution) -> SchedulerResult<Execution>;
    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Execution>>;
    async fn find_by_token(&self, token_id: i64) -> SchedulerResult<Option<Execution>>;
    /// 原子认领：取该队列中最早的未认领执行并绑定到Worker
    ///
    /// 挂起的定义、已取消的实例以及挂起的Worker都不会认领成功。
    async fn claim(
        &self,
        hostname: &str,
        worker_id: i32,
        queue: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Execution>>;
    async fn record_pid(&self, id: i64, pid: i32, started_at: DateTime<Utc>) -> SchedulerResult<bool>;
    async fn append_output(&self, id: i64, chunk: &str) -> SchedulerResult<()>;
    /// 写入退出信息并释放Worker绑定，已结束的执行不会被覆盖
    async fn complete(
        &self,
        id: i64,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
        finished_at: DateTime<Utc>,
    ) -> SchedulerResult<bool>;
    async fn find_running_on_host(&self, hostname: &str) -> SchedulerResult<Vec<Execution>>;
    /// 已认领未结束、但认领它的Worker在 cutoff 之后没有心跳
    async fn find_orphaned(&self, heartbeat_cutoff: DateTime<Utc>) -> SchedulerResult<Vec<Execution>>;
    async fn find_long_running(&self, started_before: DateTime<Utc>) -> SchedulerResult<Vec<Execution>>;
    async fn mark_mailed(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool>;
    /// 复制到执行历史并删除活动记录
    async fn archive(&self, id: i64) -> SchedulerResult<Option<ExecutionHistory>>;
    /// 仅当尚未被认领时撤回（归档并删除）
    async fn withdraw_unclaimed(&self, id: i64) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait ExecutionHistoryRepository: Send + Sync {
    async fn find_by_token(&self, token_id: i64) -> SchedulerResult<Vec<ExecutionHistory>>;
    async fn find_by_instance(&self, job_instance_id: i64) -> SchedulerResult<Vec<ExecutionHistory>>;
}

/// Worker注册表
#[async_trait]
pub trait WorkerRepository: Send + Sync {
    /// 按 (hostname, worker_id) 注册或重新注册，保留原有的挂起标记
    async fn register(&self, worker: &Worker) -> SchedulerResult<Worker>;
    async fn find(&self, hostname: &str, worker_id: i32) -> SchedulerResult<Option<Worker>>;
    async fn find_all(&self) -> SchedulerResult<Vec<Worker>>;
    async fn heartbeat(&self, hostname: &str, worker_id: i32, now: DateTime<Utc>) -> SchedulerResult<bool>;
    async fn set_suspended(&self, hostname: &str, worker_id: i32, suspended: bool) -> SchedulerResult<Worker>;
    async fn find_stale(&self, heartbeat_cutoff: DateTime<Utc>) -> SchedulerResult<Vec<Worker>>;
    async fn release(&self, hostname: &str, worker_id: i32) -> SchedulerResult<()>;
    async fn unregister(&self, hostname: &str, worker_id: i32) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait ProcessSignalRepository: Send + Sync {
    async fn create(&self, signal: &ProcessSignal) -> SchedulerResult<ProcessSignal>;
    async fn find_undelivered(&self, hostname: &str) -> SchedulerResult<Vec<ProcessSignal>>;
    async fn find_by_execution(&self, execution_id: i64) -> SchedulerResult<Vec<ProcessSignal>>;
    async fn mark_delivered(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool>;
}

#[async_trait]
pub trait MemoryRepository: Send + Sync {
    async fn append_consumption(&self, log: &MemoryConsumptionLog) -> SchedulerResult<MemoryConsumptionLog>;
    async fn find_consumption_by_instance(&self, job_instance_id: i64) -> SchedulerResult<Vec<MemoryConsumptionLog>>;
    async fn find_expectancy(&self, job_definition_id: i64) -> SchedulerResult<Option<MemoryExpectancy>>;
    async fn set_expectancy(&self, job_definition_id: i64, expected_value: i64) -> SchedulerResult<MemoryExpectancy>;
}

#[async_trait]
pub trait InstanceLogRepository: Send + Sync {
    async fn append(&self, job_instance_id: i64, level: InstanceLogLevel, message: &str) -> SchedulerResult<()>;
    async fn find_by_instance(&self, job_instance_id: i64) -> SchedulerResult<Vec<InstanceLog>>;
}

/// 仓储集合，由基础设施层统一构建后注入各服务
#[derive(Clone)]
pub struct Repositories {
    pub definitions: Arc<dyn JobDefinitionRepository>,
    pub instances: Arc<dyn JobInstanceRepository>,
    pub tokens: Arc<dyn TokenRepository>,
    pub executions: Arc<dyn ExecutionRepository>,
    pub histories: Arc<dyn ExecutionHistoryRepository>,
    pub workers: Arc<dyn WorkerRepository>,
    pub signals: Arc<dyn ProcessSignalRepository>,
    pub memory: Arc<dyn MemoryRepository>,
    pub logs: Arc<dyn InstanceLogRepository>,
}
