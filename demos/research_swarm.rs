//! Five researchers work one topic in parallel and the findings are merged
//! into a single markdown document.
//!
//! ```text
//! cargo run --example research_swarm [task.yaml]
//! ```

use std::io::Write;
use std::sync::Arc;
use std::time::Duration;

use fanout::{
    Coordinator, FanoutConfig, FixedDecomposition, FnWorkUnit, MarkdownSink, ParentTask,
    ProgressReporter, ProgressSnapshot, SubtaskContext, SubtaskSpec, WaitMode,
};

const AGENTS: [&str; 5] = ["researcher-1", "researcher-2", "coder-1", "reviewer-1", "planner-1"];

fn research_areas() -> Vec<SubtaskSpec> {
    vec![
        SubtaskSpec::new(
            "Virtual Actor Model and Grains",
            "How Orleans implements virtual actors: grain lifecycle, activation and deactivation, grain identity.",
        ),
        SubtaskSpec::new(
            "Persistence and State Management",
            "Grain state persistence, storage providers, transaction support and consistency models.",
        ),
        SubtaskSpec::new(
            "Communication Patterns",
            "Grain-to-grain messaging, the streaming API, timers, reminders and delivery guarantees.",
        ),
        SubtaskSpec::new(
            "Distributed Systems Capabilities",
            "Clustering, silo architecture, membership protocols, scaling and fault tolerance.",
        ),
        SubtaskSpec::new(
            "Relevance for Agent Swarm Coordination",
            "How the capabilities above map to coordinating a swarm of agents.",
        ),
    ]
}

/// Single-line progress bar redrawn in place
struct ProgressBar;

impl ProgressReporter for ProgressBar {
    fn report(&self, snapshot: &ProgressSnapshot) {
        let percent = snapshot.percent() as usize;
        let filled = (percent / 5).min(20);
        let bar = format!("{}{}", "█".repeat(filled), "░".repeat(20 - filled));
        let mut out = std::io::stdout();
        let _ = write!(
            out,
            "\r[{}] {:>3}% ({}/{} completed, {} failed) | Active: {:<60}",
            bar,
            percent,
            snapshot.completed,
            snapshot.total,
            snapshot.failed,
            snapshot.active_workers.join(", ")
        );
        let _ = out.flush();
    }
}

async fn simulate_research(ctx: SubtaskContext) -> anyhow::Result<String> {
    let millis = fastrand::u64(1_500..4_500);
    tokio::time::sleep(Duration::from_millis(millis)).await;
    Ok(format!(
        "{}\n\n- Investigated by **{}** in {} ms\n- Subtask `{}`",
        ctx.description, ctx.worker, millis, ctx.subtask_id
    ))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    fanout::init_tracing();

    let parent = match std::env::args().nth(1) {
        Some(path) => ParentTask::from_file(path)?,
        None => ParentTask::new(
            "task-research-orleans",
            "orleans",
            "research-five-way",
            "research/orleans-framework-architecture.md",
        )
        .with_description("Microsoft Orleans framework architecture and capabilities"),
    };

    let config = FanoutConfig::builder()
        .poll_interval(Duration::from_millis(100))
        .max_wait(Duration::from_secs(60))
        .wait_strategy(WaitMode::Notify)
        .build()?;

    let header = format!(
        "# {}\n\n*Task ID: {}*\n*Execution strategy: parallel*",
        parent.description.as_deref().unwrap_or(&parent.id),
        parent.id
    );
    let footer = format!(
        "Researched in parallel by {} agents: {}.",
        AGENTS.len(),
        AGENTS.join(", ")
    );

    let coordinator = Coordinator::builder()
        .config(config)
        .policy(Arc::new(FixedDecomposition::new(parent.policy.clone(), research_areas())))
        .work_unit(Arc::new(FnWorkUnit::new("simulated-research", simulate_research)))
        .workers(AGENTS)
        .reporter(Arc::new(ProgressBar))
        .sink(Arc::new(MarkdownSink::new(header, footer)))
        .build()?;

    println!("Dispatching {} ({})", parent.id, parent.policy);
    let report = coordinator.run(parent).await?;
    println!();

    for subtask in &report.subtasks {
        let duration = subtask
            .duration()
            .map(|d| format!("{} ms", d.num_milliseconds()))
            .unwrap_or_else(|| "n/a".to_string());
        println!(
            "{} {:<12} {:<40} {:<14} {}",
            subtask.status,
            subtask.id,
            subtask.title,
            subtask.assigned_worker.as_deref().unwrap_or("-"),
            duration
        );
    }

    if report.aggregated {
        println!("\nCombined document written to {}", report.parent.output_target);
    } else if let Some(reason) = &report.aggregation_error {
        println!("\nNo document written: {}", reason);
    } else {
        println!("\nTimed out before every subtask finished; no document written");
    }
    println!(
        "{} completed, {} failed in {:.1}s",
        report.completed_count(),
        report.failed_count(),
        report.elapsed.as_secs_f64()
    );
    Ok(())
}
