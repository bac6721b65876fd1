//! Fan-out/fan-in coordinator
//!
//! A parent task is split by a decomposition policy into independent
//! subtasks, every subtask runs concurrently under its own worker, a monitor
//! polls the shared store until all of them are terminal (or a deadline
//! passes) and the results are combined by an aggregator sink.

// Lets `#[work_unit]` expand to `::fanout::...` inside this crate too.
extern crate self as fanout;

pub mod aggregate;
pub mod config;
pub mod coordinator;
pub mod dispatcher;
pub mod errors;
pub mod monitor;
pub mod store;
pub mod subtask;
pub mod worker;

use std::sync::Arc;

pub use aggregate::{collect_terminal, AggregatorSink, MarkdownSink};
pub use config::{FanoutConfig, FanoutConfigBuilder, WaitMode};
pub use coordinator::{Coordinator, CoordinatorBuilder, RunReport};
pub use dispatcher::{Assignment, DecompositionPolicy, Dispatcher, FixedDecomposition, PolicyRegistry};
pub use errors::{FanoutError, Result};
pub use fanout_macros::work_unit;
pub use monitor::{
    ChannelReporter, Monitor, MonitorOutcome, MonitorReport, NoopReporter, NotifyWait, PollingWait,
    ProgressReporter, ProgressSnapshot, TracingReporter, WaitStrategy,
};
pub use store::{MemoryStore, SledStore, SubtaskStore};
pub use subtask::{
    ParentStatus, ParentTask, Subtask, SubtaskContext, SubtaskId, SubtaskSpec, SubtaskStatus, WorkerId,
};
pub use worker::{ExecutionHandle, FnWorkUnit, WorkUnit, WorkUnitRegistry, WorkerRunner};

// Global registry for units declared with #[work_unit]
#[linkme::distributed_slice]
pub static WORK_UNITS: [fn() -> Arc<dyn WorkUnit>] = [..];

/// Install a `tracing` subscriber honouring `RUST_LOG` (default `info`).
///
/// Meant for binaries and demos; calling it twice is harmless.
pub fn init_tracing() {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}
