mod common;

use anyhow::Result;
use chrono::Utc;
use scheduler_domain::{
    BranchArm, Condition, JobInstanceStatus, JoinPolicy, Step, TokenStatus, Variables, DEFAULT_QUEUE,
};
use scheduler_testing_utils::{claim_and_start, finish_execution, run_one, JobDefinitionBuilder, TEST_HOST};

use common::{vars, Harness};

#[tokio::test]
async fn test_single_command_finishes_instance() -> Result<()> {
    let h = Harness::new().await?;
    let (_, instance) = h.start(&Step::command("echo hello"), Variables::new()).await?;

    let executed = run_one(h.repos(), 1, 0).await?.expect("execution dispatched");
    assert_eq!(executed.shell, "echo hello");
    assert_eq!(executed.queue, DEFAULT_QUEUE);

    h.service.tick().await?;
    let instance = h.instance(instance.id).await?;
    assert_eq!(instance.status(), JobInstanceStatus::Finished);

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens["/"].status, TokenStatus::Success);
    assert!(h.repos().executions.find_by_token(tokens["/"].id).await?.is_none());
    assert_eq!(h.repos().histories.find_by_instance(instance.id).await?.len(), 1);
    Ok(())
}

#[tokio::test]
async fn test_sequence_short_circuits_on_failure() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::sequence(vec![
        Step::command("echo one"),
        Step::command("exit 1"),
        Step::command("echo three"),
    ]);
    let (_, instance) = h.start(&step, Variables::new()).await?;

    assert_eq!(run_one(h.repos(), 1, 0).await?.expect("first").shell, "echo one");
    h.service.tick().await?;
    assert_eq!(run_one(h.repos(), 1, 1).await?.expect("second").shell, "exit 1");
    h.service.tick().await?;

    // 第三步从未获得执行
    assert!(run_one(h.repos(), 1, 0).await?.is_none());
    let tokens = h.tokens(instance.id).await?;
    assert!(!tokens.contains_key("/2"));
    assert_eq!(tokens["/0"].status, TokenStatus::Success);
    assert_eq!(tokens["/1"].status, TokenStatus::Failure);
    assert_eq!(tokens["/"].status, TokenStatus::Failure);

    let instance = h.instance(instance.id).await?;
    assert_eq!(instance.status(), JobInstanceStatus::Error);
    assert!(!instance.retrying);
    assert_eq!(h.repos().histories.find_by_instance(instance.id).await?.len(), 2);
    assert_eq!(h.notifier.events(), vec![format!("error:{}", instance.id)]);
    Ok(())
}

#[tokio::test]
async fn test_paths_extend_parent_paths() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::sequence(vec![Step::parallel(
        vec![Step::command("echo a"), Step::command("echo b")],
        JoinPolicy::AllSucceed,
    )]);
    let (_, instance) = h.start(&step, Variables::new()).await?;

    let tokens = h.repos().tokens.find_by_instance(instance.id).await?;
    assert_eq!(tokens.len(), 4);
    for token in &tokens {
        if let Some(parent_id) = token.parent_id {
            let parent = tokens.iter().find(|t| t.id == parent_id).expect("parent");
            assert!(parent.path.is_ancestor_of(&token.path));
            assert_eq!(parent.path.depth() + 1, token.path.depth());
        }
    }
    let paths: std::collections::HashSet<_> = tokens.iter().map(|t| t.path.to_string()).collect();
    assert_eq!(paths.len(), tokens.len());
    Ok(())
}

#[tokio::test]
async fn test_retry_bound_creates_initial_plus_retries() -> Result<()> {
    let h = Harness::new().await?;
    let (_, instance) = h.start(&Step::command("exit 2").with_retry(2), Variables::new()).await?;

    for _ in 0..3 {
        run_one(h.repos(), 1, 2).await?.expect("attempt dispatched");
        h.service.tick().await?;
    }
    assert!(run_one(h.repos(), 1, 2).await?.is_none());

    let tokens = h.tokens(instance.id).await?;
    let root = &tokens["/"];
    assert_eq!(root.status, TokenStatus::Failure);
    assert_eq!(root.retry_count, 2);
    assert_eq!(h.repos().histories.find_by_token(root.id).await?.len(), 3);
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_retry_recovers_after_transient_failure() -> Result<()> {
    let h = Harness::new().await?;
    let (_, instance) = h.start(&Step::command("flaky").with_retry(3), Variables::new()).await?;

    run_one(h.repos(), 1, 1).await?.expect("first attempt");
    h.service.tick().await?;
    run_one(h.repos(), 1, 0).await?.expect("second attempt");
    h.service.tick().await?;

    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Finished);
    let tokens = h.tokens(instance.id).await?;
    let root = &tokens["/"];
    assert_eq!(root.status, TokenStatus::Success);
    assert_eq!(h.repos().histories.find_by_token(root.id).await?.len(), 2);
    Ok(())
}

#[tokio::test]
async fn test_warning_exit_codes_and_ignored_errors() -> Result<()> {
    let h = Harness::new().await?;
    let mut warned = Step::command("grep -q pattern file");
    if let scheduler_domain::StepKind::Command(command) = &mut warned.kind {
        command.warning_exit_codes = vec![1];
    }
    let step = Step::sequence(vec![warned, Step::command("exit 5").ignoring_errors(), Step::command("true")]);
    let (_, instance) = h.start(&step, Variables::new()).await?;

    run_one(h.repos(), 1, 1).await?.expect("warned");
    h.service.tick().await?;
    run_one(h.repos(), 1, 5).await?.expect("ignored");
    h.service.tick().await?;
    run_one(h.repos(), 1, 0).await?.expect("last");
    h.service.tick().await?;

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens["/0"].status, TokenStatus::Warning);
    assert_eq!(tokens["/1"].status, TokenStatus::Failure);
    assert_eq!(tokens["/"].status, TokenStatus::Warning);
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Finished);
    Ok(())
}

#[tokio::test]
async fn test_parallel_all_succeed_cancels_remainder_on_failure() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::parallel(
        vec![Step::command("exit 1"), Step::command("sleep 600")],
        JoinPolicy::AllSucceed,
    );
    let (_, instance) = h.start(&step, Variables::new()).await?;

    let failing = claim_and_start(h.repos(), 1).await?.expect("first child");
    let sleeping = claim_and_start(h.repos(), 2).await?.expect("second child");
    finish_execution(h.repos(), failing.id, Some(1), None).await?;
    h.service.tick().await?;

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens["/0"].status, TokenStatus::Failure);
    assert_eq!(tokens["/1"].status, TokenStatus::Canceling);
    assert_eq!(tokens["/"].status, TokenStatus::Running);
    assert_eq!(h.repos().signals.find_by_execution(sleeping.id).await?.len(), 1);

    finish_execution(h.repos(), sleeping.id, None, Some(15)).await?;
    h.service.tick().await?;

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens["/1"].status, TokenStatus::Canceled);
    assert_eq!(tokens["/"].status, TokenStatus::Failure);
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_parallel_any_succeed() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::parallel(vec![Step::command("exit 1"), Step::command("true")], JoinPolicy::AnySucceed);
    let (_, instance) = h.start(&step, Variables::new()).await?;

    run_one(h.repos(), 1, 1).await?.expect("first child");
    h.service.tick().await?;
    assert_eq!(h.tokens(instance.id).await?["/"].status, TokenStatus::Running);

    run_one(h.repos(), 1, 0).await?.expect("second child");
    h.service.tick().await?;
    assert_eq!(h.tokens(instance.id).await?["/"].status, TokenStatus::Success);
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Finished);
    Ok(())
}

#[tokio::test]
async fn test_parallel_any_succeed_withdraws_unclaimed_siblings() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::parallel(
        vec![Step::command("true"), Step::command("true").on_queue("heavy")],
        JoinPolicy::AnySucceed,
    );
    let (_, instance) = h.start(&step, Variables::new()).await?;

    run_one(h.repos(), 1, 0).await?.expect("default queue child");
    h.service.tick().await?;

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens["/1"].status, TokenStatus::Canceled);
    assert_eq!(tokens["/"].status, TokenStatus::Success);
    assert!(h.repos().executions.find_by_token(tokens["/1"].id).await?.is_none());
    Ok(())
}

#[tokio::test]
async fn test_branch_selects_matching_arm() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::branch(
        vec![BranchArm {
            condition: Condition::Equals {
                var: "ENV".to_string(),
                value: "production".to_string(),
            },
            step: Step::command("deploy production"),
        }],
        Some(Step::command("deploy staging")),
    );

    let (_, staging) = h.start(&step, vars(&[("ENV", "staging")])).await?;
    let executed = run_one(h.repos(), 1, 0).await?.expect("otherwise arm");
    assert_eq!(executed.shell, "deploy staging");
    assert_eq!(executed.context.get("ENV").map(String::as_str), Some("staging"));
    h.service.tick().await?;

    let tokens = h.tokens(staging.id).await?;
    assert!(tokens.contains_key("/1"));
    assert!(!tokens.contains_key("/0"));
    assert_eq!(tokens["/"].status, TokenStatus::Success);
    Ok(())
}

#[tokio::test]
async fn test_branch_without_match_succeeds() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::branch(
        vec![BranchArm {
            condition: Condition::Present { var: "FORCE".to_string() },
            step: Step::command("rebuild"),
        }],
        None,
    );
    let (_, instance) = h.start(&step, Variables::new()).await?;
    h.service.tick().await?;

    assert_eq!(h.tokens(instance.id).await?.len(), 1);
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Finished);
    Ok(())
}

#[tokio::test]
async fn test_loop_exceeding_bound_fails() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::looping(Condition::Always, Step::command("poll"), 2);
    let (_, instance) = h.start(&step, Variables::new()).await?;

    for _ in 0..2 {
        run_one(h.repos(), 1, 0).await?.expect("iteration");
        h.service.tick().await?;
    }
    assert!(run_one(h.repos(), 1, 0).await?.is_none());

    let tokens = h.tokens(instance.id).await?;
    let root = &tokens["/"];
    assert_eq!(root.status, TokenStatus::Failure);
    assert!(root.message.as_deref().is_some_and(|m| m.contains("最大迭代次数")));
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Error);
    Ok(())
}

#[tokio::test]
async fn test_loop_guard_reads_exported_context() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::looping(
        Condition::LessThan {
            var: "COUNT".to_string(),
            value: 3,
        },
        Step::command("next"),
        10,
    );
    let (_, instance) = h.start(&step, vars(&[("COUNT", "0")])).await?;

    for n in 1..=3 {
        let execution = claim_and_start(h.repos(), 1).await?.expect("iteration");
        assert_eq!(execution.context["COUNT"], (n - 1).to_string());
        h.repos()
            .executions
            .append_output(execution.id, &format!("working\n::set COUNT={n}\n"))
            .await?;
        finish_execution(h.repos(), execution.id, Some(0), None).await?;
        h.service.tick().await?;
    }

    let tokens = h.tokens(instance.id).await?;
    assert_eq!(tokens.len(), 4);
    assert_eq!(tokens["/"].status, TokenStatus::Success);
    assert_eq!(tokens["/"].context["COUNT"], "3");
    assert_eq!(h.instance(instance.id).await?.status(), JobInstanceStatus::Finished);
    Ok(())
}

#[tokio::test]
async fn test_sequence_passes_exports_to_later_siblings() -> Result<()> {
    let h = Harness::new().await?;
    let step = Step::sequence(vec![
        Step::command("build"),
        Step::command("publish").with_env("CHANNEL", "beta"),
    ]);
    let (_, _) = h.start(&step, Variables::new()).await?;

    let build = claim_and_start(h.repos(), 1).await?.expect("build");
    h.repos()
        .executions
        .append_output(build.id, "::set ARTIFACT=app-1.2.tar.gz\n")
        .await?;
    finish_execution(h.repos(), build.id, Some(0), None).await?;
    h.service.tick().await?;

    let publish = claim_and_start(h.repos(), 1).await?.expect("publish");
    assert_eq!(publish.context["ARTIFACT"], "app-1.2.tar.gz");
    assert_eq!(publish.context["CHANNEL"], "beta");
    assert_eq!(publish.hostname.as_deref(), Some(TEST_HOST));
    Ok(())
}

#[tokio::test]
async fn test_admitted_instance_without_root_is_recovered() -> Result<()> {
    let h = Harness::new().await?;
    let definition = JobDefinitionBuilder::new(&Step::command("echo recovered"))
        .with_prevent_multi(1)
        .create(h.repos())
        .await?;
    let first = h.service.trigger().trigger(definition.id, Variables::new()).await?;
    // 准入已提交但根令牌尚未写入
    assert!(h.repos().instances.try_admit(first.id, Utc::now()).await?);
    let second = h.service.trigger().trigger(definition.id, Variables::new()).await?;

    h.service.tick().await?;
    let tokens = h.tokens(first.id).await?;
    assert_eq!(tokens.len(), 1);
    assert!(tokens.contains_key("/"));
    assert_eq!(h.instance(second.id).await?.status(), JobInstanceStatus::Pending);

    assert_eq!(run_one(h.repos(), 1, 0).await?.expect("execution").shell, "echo recovered");
    h.service.tick().await?;
    assert_eq!(h.instance(first.id).await?.status(), JobInstanceStatus::Finished);

    h.service.tick().await?;
    assert_eq!(h.instance(second.id).await?.status(), JobInstanceStatus::Running);
    assert!(h.tokens(second.id).await?.contains_key("/"));
    Ok(())
}
