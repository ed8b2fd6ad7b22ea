use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::script::Step;
use crate::value_objects::{TokenPath, Variables};
use crate::SchedulerResult;

/// 作业定义：命名、带版本的脚本
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDefinition {
    pub id: i64,
    pub name: String,
    pub description: String,
    pub script: String,
    pub version: i32,
    pub suspended: bool,
    /// 同一定义允许同时运行的实例数，0 表示不限制
    pub prevent_multi: i32,
    pub notify_cancellation: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobDefinition {
    pub fn new(name: impl Into<String>, script: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.into(),
            description: String::new(),
            script: script.into(),
            version: 1,
            suspended: false,
            prevent_multi: 1,
            notify_cancellation: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn compile(&self) -> SchedulerResult<Step> {
        Step::parse(&self.script)
    }
}

/// 脚本修订记录，只追加
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptRevision {
    pub id: i64,
    pub job_definition_id: i64,
    pub script: String,
    pub editor: Option<String>,
    pub changed_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum JobInstanceStatus {
    /// 已创建但尚未准入（挂起或受 prevent_multi 限制）
    Pending,
    Running,
    Finished,
    Canceled,
    Error,
}

/// 作业定义的一次运行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobInstance {
    pub id: i64,
    pub job_definition_id: i64,
    pub job_definition_version: i32,
    /// 创建时复制的脚本，定义后续修改不影响本实例
    pub script: String,
    pub context: Variables,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub canceled_at: Option<DateTime<Utc>>,
    pub error_at: Option<DateTime<Utc>>,
    pub retrying: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobInstance {
    pub fn new(definition: &JobDefinition, context: Variables) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            job_definition_id: definition.id,
            job_definition_version: definition.version,
            script: definition.script.clone(),
            context,
            started_at: None,
            finished_at: None,
            canceled_at: None,
            error_at: None,
            retrying: false,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn status(&self) -> JobInstanceStatus {
        if self.finished_at.is_some() {
            JobInstanceStatus::Finished
        } else if self.canceled_at.is_some() {
            JobInstanceStatus::Canceled
        } else if self.error_at.is_some() {
            JobInstanceStatus::Error
        } else if self.started_at.is_some() {
            JobInstanceStatus::Running
        } else {
            JobInstanceStatus::Pending
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.finished_at.is_some() || self.canceled_at.is_some() || self.error_at.is_some()
    }
}

/// 令牌状态
///
/// `Canceling` 表示已请求取消、正在等待执行进程退出。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TokenStatus {
    Pending,
    Running,
    Success,
    Warning,
    Failure,
    Canceling,
    Canceled,
}

impl TokenStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenStatus::Pending => "PENDING",
            TokenStatus::Running => "RUNNING",
            TokenStatus::Success => "SUCCESS",
            TokenStatus::Warning => "WARNING",
            TokenStatus::Failure => "FAILURE",
            TokenStatus::Canceling => "CANCELING",
            TokenStatus::Canceled => "CANCELED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(TokenStatus::Pending),
            "RUNNING" => Some(TokenStatus::Running),
            "SUCCESS" => Some(TokenStatus::Success),
            "WARNING" => Some(TokenStatus::Warning),
            "FAILURE" => Some(TokenStatus::Failure),
            "CANCELING" => Some(TokenStatus::Canceling),
            "CANCELED" => Some(TokenStatus::Canceled),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TokenStatus::Success | TokenStatus::Warning | TokenStatus::Failure | TokenStatus::Canceled
        )
    }

    /// SUCCESS 与 WARNING 都算成功
    pub fn is_successful(&self) -> bool {
        matches!(self, TokenStatus::Success | TokenStatus::Warning)
    }
}

/// 运行时步骤树中的一个节点
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Token {
    pub id: i64,
    pub uuid: Uuid,
    pub job_definition_id: i64,
    pub job_definition_version: i32,
    pub job_instance_id: i64,
    pub parent_id: Option<i64>,
    pub path: TokenPath,
    pub status: TokenStatus,
    /// 本节点对应的步骤片段 (JSON)
    pub script: String,
    pub context: Variables,
    pub message: Option<String>,
    pub retry_count: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Token {
    /// 实例的根令牌，上下文取实例上下文
    pub fn root(instance: &JobInstance, step: &Step) -> SchedulerResult<Self> {
        let now = Utc::now();
        let mut context = instance.context.clone();
        context.extend(step.env.clone());
        Ok(Self {
            id: 0,
            uuid: Uuid::new_v4(),
            job_definition_id: instance.job_definition_id,
            job_definition_version: instance.job_definition_version,
            job_instance_id: instance.id,
            parent_id: None,
            path: TokenPath::root(),
            status: TokenStatus::Pending,
            script: step.to_json()?,
            context,
            message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    /// 第 `index` 个子令牌，继承父令牌上下文并叠加子步骤的 env
    pub fn child(&self, index: u32, step: &Step) -> SchedulerResult<Self> {
        let now = Utc::now();
        let mut context = self.context.clone();
        context.extend(step.env.clone());
        Ok(Self {
            id: 0,
            uuid: Uuid::new_v4(),
            job_definition_id: self.job_definition_id,
            job_definition_version: self.job_definition_version,
            job_instance_id: self.job_instance_id,
            parent_id: Some(self.id),
            path: self.path.child(index),
            status: TokenStatus::Pending,
            script: step.to_json()?,
            context,
            message: None,
            retry_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn step(&self) -> SchedulerResult<Step> {
        Ok(serde_json::from_str(&self.script)?)
    }
}

/// 叶子令牌的一次 shell 级执行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    pub id: i64,
    pub uuid: Uuid,
    pub job_definition_id: i64,
    pub job_definition_version: i32,
    pub job_instance_id: i64,
    pub token_id: i64,
    pub queue: String,
    pub shell: String,
    pub context: Variables,
    pub pid: Option<i32>,
    pub output: String,
    pub exit_status: Option<i32>,
    pub term_signal: Option<i32>,
    pub hostname: Option<String>,
    pub worker_id: Option<i32>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub mailed_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Execution {
    pub fn for_token(token: &Token, queue: impl Into<String>, shell: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            uuid: Uuid::new_v4(),
            job_definition_id: token.job_definition_id,
            job_definition_version: token.job_definition_version,
            job_instance_id: token.job_instance_id,
            token_id: token.id,
            queue: queue.into(),
            shell: shell.into(),
            context: token.context.clone(),
            pid: None,
            output: String::new(),
            exit_status: None,
            term_signal: None,
            hostname: None,
            worker_id: None,
            claimed_at: None,
            started_at: None,
            finished_at: None,
            mailed_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_claimed(&self) -> bool {
        self.hostname.is_some()
    }

    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// 退出码为0且未被信号终止
    pub fn succeeded(&self) -> bool {
        self.is_finished() && self.exit_status == Some(0) && self.term_signal.is_none()
    }
}

/// 轮询代理的身份记录，(hostname, worker_id) 唯一
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Worker {
    pub id: i64,
    pub hostname: String,
    pub worker_id: i32,
    pub queue: String,
    pub working: bool,
    pub execution_id: Option<i64>,
    pub suspendable: bool,
    pub suspended: bool,
    pub heartbeat_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Worker {
    pub fn new(hostname: impl Into<String>, worker_id: i32, queue: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            hostname: hostname.into(),
            worker_id,
            queue: queue.into(),
            working: false,
            execution_id: None,
            suspendable: true,
            suspended: false,
            heartbeat_at: now,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn display_name(&self) -> String {
        format!("{}#{}", self.hostname, self.worker_id)
    }
}

/// POSIX SIGTERM
pub const DEFAULT_SIGNAL: i32 = 15;

/// 一次OS信号投递请求，按 (hostname, pid) 寻址
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessSignal {
    pub id: i64,
    pub hostname: String,
    pub pid: i32,
    pub number: i32,
    pub message: Option<String>,
    pub execution_id: Option<i64>,
    /// 投递时间，为空表示尚未投递
    pub started_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl ProcessSignal {
    pub fn terminate(hostname: impl Into<String>, pid: i32, execution_id: i64, message: impl Into<String>) -> Self {
        Self {
            id: 0,
            hostname: hostname.into(),
            pid,
            number: DEFAULT_SIGNAL,
            message: Some(message.into()),
            execution_id: Some(execution_id),
            started_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn is_delivered(&self) -> bool {
        self.started_at.is_some()
    }
}

/// 内存采样记录，单位 KB
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConsumptionLog {
    pub id: i64,
    pub job_instance_id: i64,
    pub execution_id: Option<i64>,
    pub value: i64,
    pub created_at: DateTime<Utc>,
}

impl MemoryConsumptionLog {
    pub fn sample(job_instance_id: i64, execution_id: i64, kilobytes: i64) -> Self {
        Self {
            id: 0,
            job_instance_id,
            execution_id: Some(execution_id),
            value: kilobytes,
            created_at: Utc::now(),
        }
    }
}

/// 作业定义的期望内存，单位 KB，0 表示不限制
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryExpectancy {
    pub id: i64,
    pub job_definition_id: i64,
    pub expected_value: i64,
    pub updated_at: DateTime<Utc>,
}

/// 已归档的终态执行
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionHistory {
    pub id: i64,
    pub execution_uuid: Uuid,
    pub hostname: Option<String>,
    pub worker_id: Option<i32>,
    pub queue: String,
    pub job_definition_id: i64,
    pub job_instance_id: i64,
    pub token_id: i64,
    pub shell: String,
    pub exit_status: Option<i32>,
    pub term_signal: Option<i32>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum InstanceLogLevel {
    Info,
    Warn,
    Error,
}

impl InstanceLogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            InstanceLogLevel::Info => "INFO",
            InstanceLogLevel::Warn => "WARN",
            InstanceLogLevel::Error => "ERROR",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "INFO" => Some(InstanceLogLevel::Info),
            "WARN" => Some(InstanceLogLevel::Warn),
            "ERROR" => Some(InstanceLogLevel::Error),
            _ => None,
        }
    }
}

/// 作业实例级别的审计日志
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstanceLog {
    pub id: i64,
    pub job_instance_id: i64,
    pub level: InstanceLogLevel,
    pub message: String,
    pub created_at: DateTime<Utc>,
}
