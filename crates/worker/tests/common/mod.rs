#![allow(dead_code)]

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::{Execution, ExecutionHistory, ExecutionRepository, Repositories, Step, DEFAULT_QUEUE};
use scheduler_testing_utils::{seed_dispatched, JobDefinitionBuilder, TEST_HOST};
use scheduler_worker::{AgentSettings, ProcessRunner, RetryPolicy, RunnerSettings, WorkerAgent};

/// 测试用的快速退避
pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        ..RetryPolicy::default()
    }
}

pub fn runner_settings() -> RunnerSettings {
    RunnerSettings {
        shell: "/bin/sh".to_string(),
        output_limit_bytes: 64 * 1024,
        output_flush_interval: Duration::from_millis(50),
        store_retry: fast_retry(),
    }
}

pub fn agent_settings() -> AgentSettings {
    AgentSettings {
        hostname: TEST_HOST.to_string(),
        queue: DEFAULT_QUEUE.to_string(),
        poll_interval: Duration::from_millis(20),
        heartbeat_interval: Duration::from_millis(50),
        suspendable: true,
        store_retry: fast_retry(),
    }
}

pub fn agent(repos: &Repositories, worker_id: i32) -> WorkerAgent {
    agent_with(repos, worker_id, runner_settings())
}

pub fn agent_with(repos: &Repositories, worker_id: i32, runner: RunnerSettings) -> WorkerAgent {
    WorkerAgent::new(
        repos.clone(),
        worker_id,
        agent_settings(),
        Arc::new(ProcessRunner::new(repos.clone(), runner)),
    )
}

/// 创建以给定步骤为根的定义并直接派发一个执行
pub async fn dispatch(repos: &Repositories, step: Step) -> SchedulerResult<Execution> {
    let definition = JobDefinitionBuilder::new(&step).create(repos).await?;
    let (_, _, execution) = seed_dispatched(repos, &definition).await?;
    Ok(execution)
}

/// 轮询直到执行结束或超时
pub async fn wait_finished(repos: &Repositories, execution_id: i64, timeout: Duration) -> SchedulerResult<Option<Execution>> {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if let Some(execution) = repos.executions.find_by_id(execution_id).await? {
            if execution.is_finished() {
                return Ok(Some(execution));
            }
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    Ok(None)
}

/// 包装真实的执行仓储，让 `complete` 与 `record_pid` 按设定次数失败
pub struct FlakyExecutions {
    inner: Arc<dyn ExecutionRepository>,
    complete_failures: AtomicU32,
    record_pid_failures: AtomicU32,
}

impl FlakyExecutions {
    /// 返回替换了执行仓储的仓储集合
    pub fn install(repos: &Repositories, complete_failures: u32, record_pid_failures: u32) -> Repositories {
        let mut flaky = repos.clone();
        flaky.executions = Arc::new(Self {
            inner: repos.executions.clone(),
            complete_failures: AtomicU32::new(complete_failures),
            record_pid_failures: AtomicU32::new(record_pid_failures),
        });
        flaky
    }

    fn should_fail(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }

    fn unavailable() -> SchedulerError {
        SchedulerError::Internal("存储暂时不可用".to_string())
    }
}

#[async_trait]
impl ExecutionRepository for FlakyExecutions {
    async fn dispatch(&self, execution: &Execution) -> SchedulerResult<Execution> {
        self.inner.dispatch(execution).await
    }

    async fn find_by_id(&self, id: i64) -> SchedulerResult<Option<Execution>> {
        self.inner.find_by_id(id).await
    }

    async fn find_by_token(&self, token_id: i64) -> SchedulerResult<Option<Execution>> {
        self.inner.find_by_token(token_id).await
    }

    async fn claim(
        &self,
        hostname: &str,
        worker_id: i32,
        queue: &str,
        now: DateTime<Utc>,
    ) -> SchedulerResult<Option<Execution>> {
        self.inner.claim(hostname, worker_id, queue, now).await
    }

    async fn record_pid(&self, id: i64, pid: i32, started_at: DateTime<Utc>) -> SchedulerResult<bool> {
        if Self::should_fail(&self.record_pid_failures) {
            return Err(Self::unavailable());
        }
        self.inner.record_pid(id, pid, started_at).await
    }

    async fn append_output(&self, id: i64, chunk: &str) -> SchedulerResult<()> {
        self.inner.append_output(id, chunk).await
    }

    async fn complete(
        &self,
        id: i64,
        exit_status: Option<i32>,
        term_signal: Option<i32>,
        finished_at: DateTime<Utc>,
    ) -> SchedulerResult<bool> {
        if Self::should_fail(&self.complete_failures) {
            return Err(Self::unavailable());
        }
        self.inner.complete(id, exit_status, term_signal, finished_at).await
    }

    async fn find_running_on_host(&self, hostname: &str) -> SchedulerResult<Vec<Execution>> {
        self.inner.find_running_on_host(hostname).await
    }

    async fn find_orphaned(&self, heartbeat_cutoff: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        self.inner.find_orphaned(heartbeat_cutoff).await
    }

    async fn find_long_running(&self, started_before: DateTime<Utc>) -> SchedulerResult<Vec<Execution>> {
        self.inner.find_long_running(started_before).await
    }

    async fn mark_mailed(&self, id: i64, now: DateTime<Utc>) -> SchedulerResult<bool> {
        self.inner.mark_mailed(id, now).await
    }

    async fn archive(&self, id: i64) -> SchedulerResult<Option<ExecutionHistory>> {
        self.inner.archive(id).await
    }

    async fn withdraw_unclaimed(&self, id: i64) -> SchedulerResult<bool> {
        self.inner.withdraw_unclaimed(id).await
    }
}
