//! Configuration view and validation commands: `plugkit config`.

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<i32> {
    use plugkit::config::{CONFIG_FILE, DEFAULT_CONFIG, PlugkitConfig};

    let config_path = project_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("plugkit configuration");
            println!("=====================");
            println!();

            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No {} found; showing defaults.", CONFIG_FILE);
                println!("Run 'plugkit config init' to create one.");
            }
            println!();

            let config = PlugkitConfig::new(project_dir.to_path_buf())?;
            print!("{}", toml::to_string_pretty(&config.toml)?);
            println!();

            println!("Resolved paths:");
            println!("  manifest      = {}", config.manifest_path().display());
            println!("  out_dir       = {}", config.out_dir().display());
            println!("  state_dir     = {}", config.state_dir().display());
            println!("  version_file  = {}", config.version_file().display());
            println!("  workflows_dir = {}", config.workflows_dir().display());
            println!();
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No {} found. Using defaults.", CONFIG_FILE);
            }
            let warnings = PlugkitConfig::new(project_dir.to_path_buf())?.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in &warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("{} already exists at {}", CONFIG_FILE, config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(0);
            }

            std::fs::write(&config_path, DEFAULT_CONFIG)?;

            println!("Created {} at {}", CONFIG_FILE, config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [build] bundler command and parallelism");
            println!("  - [launch] room, host_command and timeouts");
            println!("  - [[tests.assertions]] the checks run by 'plugkit test'");
            println!();
        }
    }

    Ok(0)
}
