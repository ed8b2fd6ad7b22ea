use std::collections::HashSet;

use anyhow::Result;
use futures::future::join_all;
use scheduler_domain::{Step, DEFAULT_QUEUE};
use scheduler_testing_utils::{claim_and_start, register_worker, seed_dispatched, JobDefinitionBuilder, TestDatabase};

const WORKERS: i32 = 8;

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claim_has_single_winner() -> Result<()> {
    let db = TestDatabase::with_max_connections(WORKERS as u32).await?;
    let repos = db.repos.clone();

    let definition = JobDefinitionBuilder::new(&Step::command("true")).create(&repos).await?;
    let (_, _, execution) = seed_dispatched(&repos, &definition).await?;
    for worker_id in 0..WORKERS {
        register_worker(&repos, worker_id, DEFAULT_QUEUE).await?;
    }

    let attempts = (0..WORKERS).map(|worker_id| {
        let repos = repos.clone();
        tokio::spawn(async move { claim_and_start(&repos, worker_id).await })
    });

    let mut winners = Vec::new();
    for result in join_all(attempts).await {
        if let Some(claimed) = result?? {
            winners.push(claimed);
        }
    }

    assert_eq!(winners.len(), 1);
    assert_eq!(winners[0].id, execution.id);

    let working: Vec<_> = repos.workers.find_all().await?.into_iter().filter(|w| w.working).collect();
    assert_eq!(working.len(), 1);
    assert_eq!(Some(working[0].worker_id), winners[0].worker_id);
    Ok(())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claim_distributes_distinct_executions() -> Result<()> {
    let db = TestDatabase::with_max_connections(WORKERS as u32).await?;
    let repos = db.repos.clone();

    let definition = JobDefinitionBuilder::new(&Step::command("true"))
        .with_prevent_multi(0)
        .create(&repos)
        .await?;
    for _ in 0..3 {
        seed_dispatched(&repos, &definition).await?;
    }
    for worker_id in 0..WORKERS {
        register_worker(&repos, worker_id, DEFAULT_QUEUE).await?;
    }

    let attempts = (0..WORKERS).map(|worker_id| {
        let repos = repos.clone();
        tokio::spawn(async move { claim_and_start(&repos, worker_id).await })
    });

    let mut claimed = HashSet::new();
    for result in join_all(attempts).await {
        if let Some(execution) = result?? {
            assert!(claimed.insert(execution.id), "执行 {} 被重复认领", execution.id);
        }
    }
    assert_eq!(claimed.len(), 3);
    Ok(())
}
