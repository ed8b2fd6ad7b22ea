//! 模拟Worker行为的辅助函数

use chrono::Utc;
use scheduler_core::SchedulerResult;
use scheduler_domain::{
    Execution, JobDefinition, JobInstance, Repositories, StepKind, Token, Variables, Worker,
    DEFAULT_QUEUE,
};

pub const TEST_HOST: &str = "test-host";

/// 不会对应真实进程的pid
pub const FAKE_PID: i32 = 3_999_999;

pub async fn register_worker(repos: &Repositories, worker_id: i32, queue: &str) -> SchedulerResult<Worker> {
    repos.workers.register(&Worker::new(TEST_HOST, worker_id, queue)).await
}

/// 以指定Worker身份认领默认队列中的一个执行并记录pid
pub async fn claim_and_start(repos: &Repositories, worker_id: i32) -> SchedulerResult<Option<Execution>> {
    let Some(execution) = repos
        .executions
        .claim(TEST_HOST, worker_id, DEFAULT_QUEUE, Utc::now())
        .await?
    else {
        return Ok(None);
    };
    repos.executions.record_pid(execution.id, FAKE_PID, Utc::now()).await?;
    repos.executions.find_by_id(execution.id).await
}

/// 模拟进程退出
pub async fn finish_execution(
    repos: &Repositories,
    execution_id: i64,
    exit_status: Option<i32>,
    term_signal: Option<i32>,
) -> SchedulerResult<bool> {
    repos
        .executions
        .complete(execution_id, exit_status, term_signal, Utc::now())
        .await
}

/// 认领、启动并以给定退出码结束一个执行
pub async fn run_one(repos: &Repositories, worker_id: i32, exit_status: i32) -> SchedulerResult<Option<Execution>> {
    let Some(execution) = claim_and_start(repos, worker_id).await? else {
        return Ok(None);
    };
    finish_execution(repos, execution.id, Some(exit_status), None).await?;
    Ok(Some(execution))
}

/// 绕过调度器直接准入实例并派发根令牌
///
/// 根步骤为命令步骤时按其命令与队列派发，否则派发到默认队列执行 `true`。
pub async fn seed_dispatched(
    repos: &Repositories,
    definition: &JobDefinition,
) -> SchedulerResult<(JobInstance, Token, Execution)> {
    let instance = repos
        .instances
        .create(&JobInstance::new(definition, Variables::new()))
        .await?;
    repos.instances.try_admit(instance.id, Utc::now()).await?;

    let step = definition.compile()?;
    let token = repos.tokens.create(&Token::root(&instance, &step)?).await?;
    let (queue, shell) = match &step.kind {
        StepKind::Command(command) => (command.queue.as_str(), command.shell.as_str()),
        _ => (DEFAULT_QUEUE, "true"),
    };
    let execution = repos
        .executions
        .dispatch(&Execution::for_token(&token, queue, shell))
        .await?;
    Ok((instance, token, execution))
}
