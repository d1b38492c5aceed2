//! `plugkit build`

use anyhow::Result;
use plugkit::build::BuildPipeline;
use plugkit::dag::GraphRunner;
use plugkit::ui::UiMode;
use std::path::PathBuf;

use super::{interrupt_token, load_config, run_with_ui};
use crate::Cli;

pub async fn cmd_build(cli: &Cli, project_dir: PathBuf) -> Result<i32> {
    let config = load_config(cli, project_dir)?;
    let graph = BuildPipeline::from_config(&config).graph()?;

    let runner = GraphRunner::new(config.runner_config());
    let (_, report) = run_with_ui(
        runner,
        &graph,
        None,
        interrupt_token(),
        &config,
        "build",
        UiMode::parse(&cli.ui),
    )
    .await;

    Ok(report.exit_code())
}
