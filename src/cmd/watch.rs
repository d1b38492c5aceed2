//! `plugkit watch`

use anyhow::Result;
use console::style;
use plugkit::build::{BuildPipeline, MANIFEST_TASK, ManifestArtifact};
use plugkit::dag::{GraphRunner, RunReport};
use plugkit::ui::UiMode;
use plugkit::ui::icons::WATCH;
use plugkit::watch::{ChangeMapper, DEBOUNCE, ProjectWatcher};
use std::path::PathBuf;
use tracing::info;

use super::{interrupt_token, load_config, run_with_ui};
use crate::Cli;

fn learn_entries(mapper: &mut ChangeMapper, report: &RunReport) {
    if let Some(manifest) = report
        .outcome(MANIFEST_TASK)
        .and_then(|o| o.artifact_as::<ManifestArtifact>())
    {
        mapper.update_entries(&manifest);
    }
}

pub async fn cmd_watch(cli: &Cli, project_dir: PathBuf) -> Result<i32> {
    let config = load_config(cli, project_dir)?;
    let mode = UiMode::parse(&cli.ui);
    let graph = BuildPipeline::from_config(&config).graph()?;
    let cancel = interrupt_token();

    let mut mapper = ChangeMapper::new(
        config.manifest_path(),
        vec![config.out_dir(), config.state_dir()],
    );
    let mut watcher = ProjectWatcher::new(&config.project_dir)?;

    let runner = GraphRunner::new(config.runner_config());
    let (mut runner, report) =
        run_with_ui(runner, &graph, None, cancel.clone(), &config, "build", mode).await;
    learn_entries(&mut mapper, &report);

    loop {
        if mode != UiMode::Json {
            println!(
                "{}Watching {} for changes (Ctrl-C to stop)",
                WATCH,
                style(config.project_dir.display()).dim()
            );
        }

        let batch = tokio::select! {
            _ = cancel.cancelled() => break,
            batch = watcher.next_batch(DEBOUNCE) => batch,
        };
        let Some(paths) = batch else { break };

        let changed = mapper.task_ids(&paths);
        if changed.is_empty() {
            continue;
        }
        info!(files = paths.len(), tasks = ?changed, "rebuilding");

        let (next, report) =
            run_with_ui(runner, &graph, Some(&changed), cancel.clone(), &config, "rebuild", mode).await;
        runner = next;
        learn_entries(&mut mapper, &report);
    }

    Ok(0)
}
