//! `plugkit test`

use anyhow::{Context, Result};
use plugkit::bridge::{BridgeController, host_for};
use plugkit::build::BuildPipeline;
use plugkit::dag::GraphRunner;
use plugkit::room::{EnvCapabilities, RoomPreference, current_room};
use plugkit::session::TestSession;
use plugkit::ui::UiMode;
use std::path::PathBuf;
use tracing::{info, warn};

use super::{interrupt_token, load_config, run_with_ui};
use crate::Cli;

pub async fn cmd_test(
    cli: &Cli,
    project_dir: PathBuf,
    room: Option<RoomPreference>,
    only: &[String],
) -> Result<i32> {
    let mut config = load_config(cli, project_dir)?;
    if let Some(room) = room {
        config.toml.launch.room = room;
    }

    let caps = EnvCapabilities::probe(&config.toml.launch);
    let room = current_room(&caps);
    info!(room = %room, "launch room selected");

    let host = host_for(room, &config).context("Cannot launch the plugin")?;
    let controller = BridgeController::from_config(host, &config.toml.launch);

    let assertions = TestSession::filter_assertions(&config.toml.tests.assertions, only);
    if assertions.is_empty() {
        warn!("no assertions selected; the run only builds and launches");
    }
    for name in only {
        if !assertions.iter().any(|a| &a.name == name) {
            warn!(assertion = %name, "--only names an assertion that is not configured");
        }
    }

    let session = TestSession::new(controller, assertions);
    let mut graph = BuildPipeline::from_config(&config).graph()?;
    session.register(&mut graph)?;

    let runner = GraphRunner::new(config.runner_config());
    let (_, report) = run_with_ui(
        runner,
        &graph,
        None,
        interrupt_token(),
        &config,
        "test",
        UiMode::parse(&cli.ui),
    )
    .await;
    session.teardown();

    Ok(report.exit_code())
}
