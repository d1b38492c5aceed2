//! Task graph runner.
//!
//! Every plugkit pipeline (build, test, release) is a [`TaskGraph`] executed
//! by a [`GraphRunner`]. The graph is built once at startup from explicit
//! task definitions and validated as tasks are registered.
//!
//! ## Architecture
//!
//! 1. **Builder** - registers tasks, rejecting duplicate ids and cycles
//! 2. **Scheduler** - per-run task states, readiness and failure propagation
//! 3. **Executor** - runs ready tasks concurrently and collects the report
//!
//! ## Example
//!
//! ```no_run
//! use plugkit::dag::{GraphRunner, RunnerConfig, TaskGraph};
//! use plugkit::task::{Outcome, Task};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let mut graph = TaskGraph::new();
//! graph.register(Task::from_fn("manifest", Vec::<String>::new(), |_| async { Outcome::success() }))?;
//! graph.register(Task::from_fn("ui-bundle", ["manifest"], |_| async { Outcome::success() }))?;
//! graph.register(Task::from_fn("main-bundle", ["manifest"], |_| async { Outcome::success() }))?;
//! graph.register(Task::from_fn(
//!     "package",
//!     ["manifest", "ui-bundle", "main-bundle"],
//!     |_| async { Outcome::success() },
//! ))?;
//!
//! let mut runner = GraphRunner::new(RunnerConfig::default());
//! let report = runner.run(&graph, None).await;
//! assert!(report.is_success());
//! # Ok(())
//! # }
//! ```

mod builder;
mod executor;
mod scheduler;
pub(crate) mod state;

pub use builder::{GRAPH_ROOT_ID, TaskGraph, TaskIndex};
pub use executor::GraphRunner;
pub use scheduler::{RunScheduler, RunnerConfig, TaskStatus};
pub use state::{ExecutionTimer, GraphEvent, RunReport, RunState, RunSummary, TaskReport};
