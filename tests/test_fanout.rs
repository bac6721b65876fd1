//! End-to-end tests for the fan-out coordinator

use fanout::{
    work_unit, Coordinator, FanoutConfig, FanoutError, FixedDecomposition, FnWorkUnit,
    MarkdownSink, MonitorOutcome, ParentTask, SledStore, SubtaskContext, SubtaskStatus,
    SubtaskStore, WaitMode, WorkUnit, WorkUnitRegistry,
};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Uppercases the subtask title
#[work_unit(name = "shout", description = "Uppercase the subtask title")]
async fn shout(ctx: SubtaskContext) -> anyhow::Result<String> {
    Ok(ctx.title.to_uppercase())
}

/// Always fails
#[work_unit(name = "refuse")]
async fn refuse(_ctx: SubtaskContext) -> anyhow::Result<String> {
    anyhow::bail!("refused")
}

fn five_way() -> Arc<FixedDecomposition> {
    Arc::new(FixedDecomposition::from_pairs(
        "five-way",
        ["A", "B", "C", "D", "E"].map(|t| (t, format!("Research area {}", t))),
    ))
}

fn fast_config() -> FanoutConfig {
    FanoutConfig::builder()
        .poll_interval(Duration::from_millis(25))
        .max_wait(Duration::from_secs(10))
        .build()
        .unwrap()
}

// Distinct durations per title, 100..=500 ms
fn staggered(fail_on: Option<&'static str>) -> Arc<dyn WorkUnit> {
    Arc::new(FnWorkUnit::new("staggered", move |ctx: SubtaskContext| async move {
        let step = (ctx.title.as_bytes()[0] - b'A' + 1) as u64;
        tokio::time::sleep(Duration::from_millis(100 * step)).await;
        if Some(ctx.title.as_str()) == fail_on {
            anyhow::bail!("source for {} unreachable", ctx.title);
        }
        Ok(format!("Findings for {} by {}", ctx.title, ctx.worker))
    }))
}

fn researchers() -> Vec<&'static str> {
    vec!["researcher-1", "researcher-2", "coder-1", "reviewer-1", "planner-1"]
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_five_way_run_completes_in_creation_order() {
    let coordinator = Coordinator::builder()
        .config(fast_config())
        .policy(five_way())
        .work_unit(staggered(None))
        .workers(researchers())
        .build()
        .unwrap();

    let start = Instant::now();
    let report = coordinator
        .run(ParentTask::new("task-research", "research", "five-way", "out.md"))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    assert!(report.is_complete());
    assert_eq!(report.completed_count(), 5);
    assert_eq!(report.failed_count(), 0);
    // Concurrent: bounded by the slowest unit, not the sum of all five
    assert!(elapsed < Duration::from_millis(1200), "took {:?}", elapsed);

    let titles: Vec<&str> = report.subtasks.iter().map(|s| s.title.as_str()).collect();
    assert_eq!(titles, vec!["A", "B", "C", "D", "E"]);
    for (subtask, worker) in report.subtasks.iter().zip(researchers()) {
        assert_eq!(subtask.assigned_worker.as_deref(), Some(worker));
        assert!(!subtask.result.as_deref().unwrap_or_default().is_empty());
        subtask.check_invariants().unwrap();
    }

    let listed: Vec<String> = coordinator.store().list().await.unwrap().into_iter().map(|s| s.id).collect();
    assert_eq!(listed, report.parent.subtask_ids);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_failing_unit_does_not_affect_siblings() {
    let coordinator = Coordinator::builder()
        .config(fast_config())
        .policy(five_way())
        .work_unit(staggered(Some("C")))
        .build()
        .unwrap();

    let report = coordinator
        .run(ParentTask::new("task-research", "research", "five-way", "out.md"))
        .await
        .unwrap();

    assert!(report.is_complete());
    assert_eq!(report.completed_count(), 4);
    assert_eq!(report.failed_count(), 1);
    let failed = &report.subtasks[2];
    assert_eq!(failed.status, SubtaskStatus::Failed);
    assert_eq!(failed.error.as_deref(), Some("source for C unreachable"));
    assert!(failed.result.is_none());
    failed.check_invariants().unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn test_registered_units_from_attribute() {
    let registry = WorkUnitRegistry::with_registered().unwrap();
    let names = registry.names();
    assert!(names.contains(&"shout".to_string()), "registered: {:?}", names);
    assert!(names.contains(&"refuse".to_string()));
    assert_eq!(registry.get("shout").unwrap().description(), "Uppercase the subtask title");
    assert!(matches!(registry.get("whisper"), Err(FanoutError::WorkUnitNotFound(_))));

    let coordinator = Coordinator::builder()
        .config(fast_config())
        .policy(five_way())
        .work_unit(registry.get("shout").unwrap())
        .build()
        .unwrap();
    let report = coordinator
        .run(ParentTask::new("task-shout", "shout", "five-way", "out.md"))
        .await
        .unwrap();
    assert_eq!(report.subtasks[0].result.as_deref(), Some("A"));

    let coordinator = Coordinator::builder()
        .config(fast_config())
        .policy(five_way())
        .work_unit(registry.get("refuse").unwrap())
        .build()
        .unwrap();
    let report = coordinator
        .run(ParentTask::new("task-refuse", "refuse", "five-way", "out.md"))
        .await
        .unwrap();
    assert_eq!(report.failed_count(), 5);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_sled_backed_run_with_markdown_output() {
    let dir = std::env::temp_dir().join(format!("fanout-e2e-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    let target = dir.join("research").join("combined.md");

    let store = Arc::new(SledStore::temporary().unwrap());
    let config = FanoutConfig::builder()
        .poll_interval(Duration::from_millis(25))
        .max_wait(Duration::from_secs(10))
        .wait_strategy(WaitMode::Notify)
        .build()
        .unwrap();
    let coordinator = Coordinator::builder()
        .config(config)
        .store(store.clone())
        .policy(five_way())
        .work_unit(staggered(Some("E")))
        .sink(Arc::new(MarkdownSink::new("# Combined", "end of report")))
        .build()
        .unwrap();

    let report = coordinator
        .run(ParentTask::new(
            "task-sled",
            "sled",
            "five-way",
            target.to_str().unwrap(),
        ))
        .await
        .unwrap();
    assert!(report.aggregated);

    let doc = std::fs::read_to_string(&target).unwrap();
    let positions: Vec<usize> = ["## A", "## B", "## C", "## D", "## E"]
        .iter()
        .map(|h| doc.find(h).unwrap())
        .collect();
    assert!(positions.windows(2).all(|w| w[0] < w[1]));
    assert!(doc.contains("source for E unreachable"));

    let parent = store.get_parent("task-sled").await.unwrap();
    assert_eq!(parent.subtask_ids.len(), 5);
    let _ = std::fs::remove_dir_all(&dir);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_second_run_of_same_parent_is_rejected() {
    let coordinator = Coordinator::builder()
        .config(fast_config())
        .policy(five_way())
        .work_unit(staggered(None))
        .build()
        .unwrap();
    let report = coordinator
        .run(ParentTask::new("task-once", "once", "five-way", "out.md"))
        .await
        .unwrap();

    let err = coordinator.run(report.parent).await.unwrap_err();
    assert!(matches!(err, FanoutError::AlreadyDispatched(id) if id == "task-once"));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_timed_out_run_lists_unfinished() {
    let config = FanoutConfig::builder()
        .poll_interval(Duration::from_millis(50))
        .max_wait(Duration::from_millis(250))
        .build()
        .unwrap();
    let coordinator = Coordinator::builder()
        .config(config)
        .policy(five_way())
        .work_unit(staggered(None))
        .build()
        .unwrap();

    let start = Instant::now();
    let report = coordinator
        .run(ParentTask::new("task-late", "late", "five-way", "out.md"))
        .await
        .unwrap();
    let elapsed = start.elapsed();

    match &report.outcome {
        MonitorOutcome::TimedOut { unfinished } => {
            assert!(unfinished.contains(&"late-5".to_string()));
            assert!(!unfinished.contains(&"late-1".to_string()));
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert!(elapsed < Duration::from_millis(250 + 50 + 150), "took {:?}", elapsed);
    assert!(!report.aggregated);
}
