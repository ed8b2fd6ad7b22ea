use thiserror::Error;

/// 调度器错误类型定义
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("数据库错误: {0}")]
    Database(#[from] sqlx::Error),

    #[error("数据库迁移错误: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("序列化错误: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO错误: {0}")]
    Io(#[from] std::io::Error),

    #[error("配置错误: {0}")]
    Configuration(String),

    #[error("作业定义未找到: {id}")]
    JobDefinitionNotFound { id: i64 },

    #[error("作业实例未找到: {id}")]
    JobInstanceNotFound { id: i64 },

    #[error("令牌未找到: {id}")]
    TokenNotFound { id: i64 },

    #[error("执行记录未找到: {id}")]
    ExecutionNotFound { id: i64 },

    #[error("Worker未找到: {hostname}#{worker_id}")]
    WorkerNotFound { hostname: String, worker_id: i32 },

    #[error("Worker不允许挂起: {hostname}#{worker_id}")]
    WorkerNotSuspendable { hostname: String, worker_id: i32 },

    #[error("无效的脚本: {0}")]
    InvalidScript(String),

    #[error("无效的状态转换: {0}")]
    InvalidStateTransition(String),

    #[error("进程错误: {0}")]
    Process(String),

    #[error("内部错误: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// 致命错误会终止服务进程，其余错误只记录日志后继续下一轮循环
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SchedulerError::Configuration(_) | SchedulerError::Migration(_)
        )
    }

    /// 是否为"记录不存在"类错误
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            SchedulerError::JobDefinitionNotFound { .. }
                | SchedulerError::JobInstanceNotFound { .. }
                | SchedulerError::TokenNotFound { .. }
                | SchedulerError::ExecutionNotFound { .. }
                | SchedulerError::WorkerNotFound { .. }
        )
    }
}

/// 统一的Result类型
pub type SchedulerResult<T> = std::result::Result<T, SchedulerError>;
