use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plugkit::room::RoomPreference;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "plugkit")]
#[command(version, about = "Build, test and release design-tool plugins")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Skip confirmation prompts
    #[arg(long, global = true)]
    pub yes: bool,

    /// Emit diagnostics as JSON lines on stderr
    #[arg(long, global = true)]
    pub log_json: bool,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// UI output mode: full, minimal, json
    #[arg(long, default_value = "full", global = true)]
    pub ui: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Validate the manifest, bundle and package the plugin
    Build,
    /// Build, launch the plugin in a room and run the configured assertions
    Test {
        /// Room to launch in
        #[arg(long, value_enum)]
        room: Option<RoomPreference>,

        /// Only run these assertions (comma-separated)
        #[arg(long, value_delimiter = ',')]
        only: Vec<String>,
    },
    /// Build, then rebuild incrementally on file changes
    Watch,
    /// Bump the version, sync CI workflows, commit, tag and push
    Release {
        /// patch, minor or major
        bump: String,

        /// Compute every step without writing, committing or pushing
        #[arg(long)]
        dry_run: bool,
    },
    /// Show the detected room and why
    Room,
    /// View, validate or create plugkit.toml
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Write a default plugkit.toml
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    plugkit::logging::init(cli.verbose, cli.log_json);

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    let code = match &cli.command {
        Commands::Build => cmd::cmd_build(&cli, project_dir).await?,
        Commands::Test { room, only } => cmd::cmd_test(&cli, project_dir, *room, only).await?,
        Commands::Watch => cmd::cmd_watch(&cli, project_dir).await?,
        Commands::Release { bump, dry_run } => {
            cmd::cmd_release(&cli, project_dir, bump, *dry_run).await?
        }
        Commands::Room => cmd::cmd_room(&project_dir)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    };

    if code != 0 {
        std::process::exit(code);
    }
    Ok(())
}
