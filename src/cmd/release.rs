//! `plugkit release`

use anyhow::{Context, Result};
use console::style;
use plugkit::dag::GraphRunner;
use plugkit::release::{BumpKind, ReleasePipeline, VersionFile};
use plugkit::ui::UiMode;
use std::path::PathBuf;

use super::{interrupt_token, load_config, run_with_ui};
use crate::Cli;

pub async fn cmd_release(cli: &Cli, project_dir: PathBuf, bump: &str, dry_run: bool) -> Result<i32> {
    use dialoguer::Confirm;

    let config = load_config(cli, project_dir)?;
    let pipeline = ReleasePipeline::from_config(&config, bump, dry_run);

    if !dry_run && !config.yes {
        // Best-effort preview; the bump task reports the real error
        let preview = bump
            .parse::<BumpKind>()
            .ok()
            .and_then(|kind| {
                VersionFile::new(&pipeline.version_file)
                    .read()
                    .ok()
                    .map(|v| (v.clone(), v.bump(kind)))
            })
            .map(|(from, to)| format!("{} -> {}", from, to))
            .unwrap_or_else(|| bump.to_string());

        let confirm = Confirm::new()
            .with_prompt(format!(
                "Release {} and push to {}?",
                style(preview).yellow().bold(),
                config.toml.release.remote
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Release cancelled");
            return Ok(0);
        }
    }

    let prepared = pipeline.prepare().context("Cannot start the release")?;
    let runner = GraphRunner::new(config.runner_config());
    let (_, report) = run_with_ui(
        runner,
        &prepared.graph,
        None,
        interrupt_token(),
        &config,
        if dry_run { "release (dry run)" } else { "release" },
        UiMode::parse(&cli.ui),
    )
    .await;

    let state = prepared.state();
    if let Some(version) = &state.current_version {
        if state.pushed {
            println!("Released {}", style(version.tag()).green().bold());
        } else if dry_run {
            println!("Dry run: would release {}", style(version.tag()).yellow());
        }
    }

    Ok(report.exit_code())
}
