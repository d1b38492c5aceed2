//! CLI command implementations.
//!
//! | Module    | Commands handled |
//! |-----------|------------------|
//! | `build`   | `Build`          |
//! | `test`    | `Test`           |
//! | `watch`   | `Watch`          |
//! | `release` | `Release`        |
//! | `room`    | `Room`           |
//! | `config`  | `Config`         |
//!
//! Graph-running commands return the process exit code.

pub mod build;
pub mod config;
pub mod release;
pub mod room;
pub mod test;
pub mod watch;

pub use build::cmd_build;
pub use config::cmd_config;
pub use release::cmd_release;
pub use room::cmd_room;
pub use test::cmd_test;
pub use watch::cmd_watch;

use crate::Cli;
use anyhow::Result;
use plugkit::config::PlugkitConfig;
use plugkit::dag::{GraphRunner, RunReport, RunScheduler, TaskGraph};
use plugkit::task::TaskId;
use plugkit::ui::{RunUI, UiMode, render_report};
use std::path::PathBuf;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

pub(crate) fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<PlugkitConfig> {
    let config = PlugkitConfig::with_cli_args(project_dir, cli.verbose, cli.yes)?;
    for warning in config.toml.validate() {
        warn!("{}", warning);
    }
    Ok(config)
}

/// A token cancelled on the first Ctrl-C.
pub(crate) fn interrupt_token() -> CancellationToken {
    let token = CancellationToken::new();
    let child = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupted, stopping...");
            child.cancel();
        }
    });
    token
}

/// Run `graph` with progress output, print the report and persist it as
/// the last run.
pub(crate) async fn run_with_ui(
    runner: GraphRunner,
    graph: &TaskGraph,
    changed: Option<&[TaskId]>,
    cancel: CancellationToken,
    config: &PlugkitConfig,
    title: &str,
    mode: UiMode,
) -> (GraphRunner, RunReport) {
    let (tx, rx) = mpsc::channel(256);
    let ui = RunUI::new(title, mode, config.verbose);
    if changed.is_none() {
        ui.print_waves(&RunScheduler::new(graph).compute_waves());
    }
    let ui_task = tokio::spawn(async move { ui.consume(rx).await });

    let mut runner = runner.with_event_channel(tx);
    let report = runner.run_until(graph, changed, cancel).await;
    let runner = runner.without_event_channel();
    let _ = ui_task.await;

    println!("{}", render_report(&report, mode));
    if let Err(e) = report.write_to(&config.last_run_file()) {
        warn!(error = %e, "failed to write last-run report");
    }
    (runner, report)
}
