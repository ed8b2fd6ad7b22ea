use std::os::unix::process::ExitStatusExt;

use anyhow::Result;
use chrono::Utc;
use scheduler_domain::{ProcessSignal, Step, DEFAULT_QUEUE};
use scheduler_testing_utils::{
    finish_execution, register_worker, seed_dispatched, JobDefinitionBuilder, TestDatabase, FAKE_PID, TEST_HOST,
};
use scheduler_worker::SignalRelay;
use tokio::process::Command;

#[tokio::test]
async fn test_relay_terminates_running_process_once() -> Result<()> {
    let db = TestDatabase::new().await?;
    let repos = &db.repos;
    let definition = JobDefinitionBuilder::new(&Step::command("sleep 30")).create(repos).await?;
    let (_, _, execution) = seed_dispatched(repos, &definition).await?;
    register_worker(repos, 1, DEFAULT_QUEUE).await?;
    repos.executions.claim(TEST_HOST, 1, DEFAULT_QUEUE, Utc::now()).await?.expect("claimed");

    let mut child = Command::new("sleep").arg("30").spawn()?;
    let pid = child.id().expect("pid") as i32;
    repos.executions.record_pid(execution.id, pid, Utc::now()).await?;

    repos
        .signals
        .create(&ProcessSignal::terminate(TEST_HOST, pid, execution.id, "取消"))
        .await?;
    let relay = SignalRelay::new(repos.clone(), TEST_HOST);
    assert_eq!(relay.deliver_pending().await?, 1);

    let status = child.wait().await?;
    assert_eq!(status.signal(), Some(15));
    finish_execution(repos, execution.id, None, status.signal()).await?;

    // 进程退出后的重复请求不产生任何效果
    repos
        .signals
        .create(&ProcessSignal::terminate(TEST_HOST, pid, execution.id, "重复"))
        .await?;
    assert_eq!(relay.deliver_pending().await?, 0);
    assert!(repos.signals.find_undelivered(TEST_HOST).await?.is_empty());

    let signals = repos.signals.find_by_execution(execution.id).await?;
    assert_eq!(signals.len(), 2);
    assert!(signals.iter().all(|s| s.is_delivered()));
    Ok(())
}

#[tokio::test]
async fn test_relay_ignores_exited_process() -> Result<()> {
    let db = TestDatabase::new().await?;
    let repos = &db.repos;
    let signal = ProcessSignal {
        execution_id: None,
        ..ProcessSignal::terminate(TEST_HOST, FAKE_PID, 0, "过期的请求")
    };
    repos.signals.create(&signal).await?;

    let relay = SignalRelay::new(repos.clone(), TEST_HOST);
    assert_eq!(relay.deliver_pending().await?, 0);
    assert_eq!(relay.deliver_pending().await?, 0);
    assert!(repos.signals.find_undelivered(TEST_HOST).await?.is_empty());
    Ok(())
}

#[tokio::test]
async fn test_relay_only_consumes_own_host() -> Result<()> {
    let db = TestDatabase::new().await?;
    let repos = &db.repos;
    let signal = ProcessSignal {
        execution_id: None,
        ..ProcessSignal::terminate("other-host", FAKE_PID, 0, "别的主机")
    };
    repos.signals.create(&signal).await?;

    let relay = SignalRelay::new(repos.clone(), TEST_HOST);
    assert_eq!(relay.deliver_pending().await?, 0);
    assert_eq!(repos.signals.find_undelivered("other-host").await?.len(), 1);
    Ok(())
}
