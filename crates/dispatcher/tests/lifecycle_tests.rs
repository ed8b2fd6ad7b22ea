mod common;

use std::time::Duration;

use anyhow::Result;
use scheduler_core::{DispatcherConfig, SchedulerError};
use scheduler_dispatcher::{ExecutionReaper, HistoryArchiver, LongRunningWatchdog};
use scheduler_domain::{JobInstanceStatus, JoinPolicy, Step, TokenStatus, Variables};
use scheduler_testing_utils::{claim_and_start, finish_execution, run_one, JobDefinitionBuilder, TEST_HOST};

use common::Harness;

#[tokio::test]
async fn test_cancel_signals_only_running_leaf() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::parallel(
        vec![
            Step::command("sleep 600"),
            Step::command("echo b").on_queue("batch"),
            Step::command("echo c").on_queue("batch"),
        ],
        JoinPolicy::AllSucceed,
    );
    let (_, instance) = h.start(&step, Variables::new()).await?;
    let running = claim_and_start(h.repos(), 1).await?.expect("running leaf");

    let canceled = h.service.lifecycle().cancel_instance(instance.id).await?;
    assert_eq!(canceled.status(), JobInstanceStatus::Canceled);

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens["/0"].status, TokenStatus::Canceling);
    assert_eq!(tokens["/1"].status, TokenStatus::Canceled);
    assert_eq!(tokens["/2"].status, TokenStatus::Canceled);

    // 重复推进不会产生新的信号
    h.service.tick().await?;
    h.service.tick().await?;
    let signals = h.repos().signals.find_undelivered(TEST_HOST).await?;
    assert_eq!(signals.len(), 1);
    assert_eq!(signals[0].execution_id, Some(running.id));
    assert_eq!(signals[0].pid, running.pid.expect("pid recorded"));
    assert_eq!(signals[0].number, 15);

    finish_execution(h.repos(), running.id, None, Some(15)).await?;
    h.service.tick().await?;

    let tokens = h.tokens(instance.id).await?;
    for path in ["/", "/0", "/1", "/2"] {
        assert_eq!(tokens[path].status, TokenStatus::Canceled, "令牌 {path}");
    }
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Canceled);
    assert!(h.repos().instances.find_active().await?.is_empty());
    assert_eq!(h.notifier.events(), vec![format!("cancel:{}", instance.id)]);
    Ok(())
}

#[tokio::test]
async fn test_cancel_sequence_never_expands_remaining_steps() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::sequence(vec![Step::command("a"), Step::command("b"), Step::command("c")]);
    let (_, instance) = h.start(&step, Variables::new()).await?;
    let running = claim_and_start(h.repos(), 1).await?.expect("first step");

    h.service.lifecycle().cancel_instance(instance.id).await?;
    finish_execution(h.repos(), running.id, None, Some(15)).await?;
    h.service.tick().await?;

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens.len(), 2);
    assert!(tokens.values().all(|t| t.status == TokenStatus::Canceled));
    assert!(run_one(h.repos(), 1, 0).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_cancel_timeout_forces_termination() -> Result<()> {
    let h = Harness::with_config(DispatcherConfig {
        cancel_timeout_seconds: 0,
        ..DispatcherConfig::default()
    })
    .await?;
    let (_, instance) = h.start(&Step::command("trap '' TERM; sleep 600"), Variables::new()).await?;
    let running = claim_and_start(h.repos(), 1).await?.expect("running");

    h.service.lifecycle().cancel_instance(instance.id).await?;
    h.service.tick().await?;

    let tokens = h.tokens(instance.id).await?;
    let root = &tokens["/"];
    assert_eq!(root.status, TokenStatus::Canceled);
    let history = h.repos().histories.find_by_token(root.id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].exit_status, None);

    // Worker 稍后上报结束不会覆盖已归档的结果
    assert!(!finish_execution(h.repos(), running.id, None, Some(9)).await?);
    let worker = h.repos().workers.find(TEST_HOST, 1).await?.expect("worker");
    assert!(!worker.working);
    Ok(())
}

#[tokio::test]
async fn test_cancel_before_admission() -> Result<()> {
    let h = Harness::new().await?;
    let definition = JobDefinitionBuilder::new(&Step::command("true"))
        .suspended()
        .without_cancellation_notice()
        .create(h.repos())
        .await?;
    let instance = h.service.trigger().trigger(definition.id, Variables::new()).await?;
    h.service.tick().await?;
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Pending);

    h.service.lifecycle().cancel_instance(instance.id).await?;
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Canceled);
    assert!(h.tokens(instance.id).await?.is_empty());
    assert!(h.notifier.events().is_empty());

    let again = h.service.lifecycle().cancel_instance(instance.id).await;
    assert!(matches!(again, Err(SchedulerError::InvalidStateTransition(_))));
    Ok(())
}

#[tokio::test]
async fn test_prevent_multi_defers_second_instance() -> Result<()> {
    let h = Harness::new().await?;
    let definition = JobDefinitionBuilder::new(&Step::command("report"))
        .with_prevent_multi(1)
        .create(h.repos())
        .await?;

    let first = h.service.trigger().trigger(definition.id, Variables::new()).await?;
    let second = h.service.trigger().trigger(definition.id, Variables::new()).await?;
    h.service.tick().await?;

    assert_eq!(h.instance(first.id).await?.status(), JobInstanceStatus::Running);
    assert_eq!(h.instance(second.id).await?.status(), JobInstanceStatus::Pending);
    assert!(h.tokens(second.id).await?.is_empty());

    run_one(h.repos(), 1, 0).await?.expect("first instance execution");
    assert!(run_one(h.repos(), 2, 0).await?.is_none());
    h.service.tick().await?;
    assert_eq!(h.instance(first.id).await?.status(), JobInstanceStatus::Finished);

    h.service.tick().await?;
    assert_eq!(h.instance(second.id).await?.status(), JobInstanceStatus::Running);
    Ok(())
}

#[tokio::test]
async fn test_suspended_definition_resumes_admission() -> Result<()> {
    let h = Harness::new().await?;
    let mut definition = JobDefinitionBuilder::new(&Step::command("true"))
        .suspended()
        .create(h.repos())
        .await?;
    let instance = h.service.trigger().trigger(definition.id, Variables::new()).await?;
    h.service.tick().await?;
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Pending);

    definition.suspended = false;
    h.repos().definitions.update(&definition).await?;
    h.service.tick().await?;
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Running);
    Ok(())
}

#[tokio::test]
async fn test_operator_retry_resumes_from_failure() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::sequence(vec![Step::command("extract"), Step::command("load")]);
    let (_, instance) = h.start(&step, Variables::new()).await?;

    run_one(h.repos(), 1, 0).await?.expect("extract");
    h.service.tick().await?;
    run_one(h.repos(), 1, 1).await?.expect("load");
    h.service.tick().await?;
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Error);

    let retried = h.service.lifecycle().retry_instance(instance.id).await?;
    assert!(retried.retrying);
    assert_eq!(retried.status(), JobInstanceStatus::Running);

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens["/"].status, TokenStatus::Running);
    assert_eq!(tokens["/0"].status, TokenStatus::Success);
    assert_eq!(tokens["/1"].status, TokenStatus::Pending);

    h.service.tick().await?;
    let executed = run_one(h.repos(), 1, 0).await?.expect("load retried");
    assert_eq!(executed.shell, "load");
    h.service.tick().await?;

    let finished = h.instance(instance.id).await?;
    assert_eq!(finished.status(), JobInstanceStatus::Finished);
    assert!(!finished.retrying);
    Ok(())
}

#[tokio::test]
async fn test_retry_rejects_non_errored_instance() -> Result<()> {
    let h = Harness::new().await?;
    let (_, instance) = h.start(&Step::command("true"), Variables::new()).await?;

    let result = h.service.lifecycle().retry_instance(instance.id).await;
    assert!(matches!(result, Err(SchedulerError::InvalidStateTransition(_))));

    let missing = h.service.lifecycle().retry_instance(9999).await;
    assert!(matches!(missing, Err(SchedulerError::JobInstanceNotFound { id: 9999 })));
    Ok(())
}

#[tokio::test]
async fn test_trigger_unknown_definition() -> Result<()> {
    let h = Harness::new().await?;
    let result = h.service.trigger().trigger(4242, Variables::new()).await;
    assert!(matches!(result, Err(SchedulerError::JobDefinitionNotFound { id: 4242 })));
    Ok(())
}

#[tokio::test]
async fn test_reaper_fails_orphaned_execution() -> Result<()> {
    let h = Harness::new().await?;
    let (_, instance) = h.start(&Step::command("sleep 600").with_retry(1), Variables::new()).await?;
    let orphan = claim_and_start(h.repos(), 1).await?.expect("claimed");

    let reaper = ExecutionReaper::new(h.repos().clone(), Duration::ZERO);
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(reaper.reap().await?, 1);

    h.service.tick().await?;
    let tokens = h.tokens(instance.id).await?;
    let root = &tokens["/"];
    assert_eq!(root.status, TokenStatus::Running);
    assert_eq!(root.retry_count, 1);

    let history = h.repos().histories.find_by_token(root.id).await?;
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].execution_uuid, orphan.uuid);
    assert_eq!(history[0].exit_status, None);

    // 心跳超时且空闲的Worker被注销
    assert!(h.repos().workers.find(TEST_HOST, 1).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_long_running_notified_once() -> Result<()> {
    let h = Harness::new().await?;
    h.start(&Step::command("sleep 600"), Variables::new()).await?;
    let running = claim_and_start(h.repos(), 1).await?.expect("running");

    let watchdog = LongRunningWatchdog::new(h.repos().clone(), h.notifier.clone(), Duration::from_millis(1));
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(watchdog.check().await?, 1);
    assert_eq!(watchdog.check().await?, 0);
    assert_eq!(h.notifier.events(), vec![format!("long:{}", running.id)]);

    let disabled = LongRunningWatchdog::new(h.repos().clone(), h.notifier.clone(), Duration::ZERO);
    assert_eq!(disabled.check().await?, 0);
    Ok(())
}

#[tokio::test]
async fn test_archiver_sweeps_tokens_after_retention() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::sequence(vec![Step::command("a")]);
    let (_, instance) = h.start(&step, Variables::new()).await?;
    run_one(h.repos(), 1, 0).await?.expect("a");
    h.service.tick().await?;
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Finished);

    let keep = HistoryArchiver::new(h.repos().clone(), Duration::from_secs(3600));
    assert_eq!(keep.sweep_tokens().await?, 0);

    tokio::time::sleep(Duration::from_millis(5)).await;
    let purge = HistoryArchiver::new(h.repos().clone(), Duration::ZERO);
    assert_eq!(purge.sweep_tokens().await?, 2);
    assert!(h.tokens(instance.id).await?.is_empty());

    // 执行历史不受影响
    assert_eq!(h.repos().histories.find_by_instance(instance.id).await?.len(), 1);
    Ok(())
}
