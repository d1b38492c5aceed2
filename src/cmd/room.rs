//! `plugkit room`

use anyhow::Result;
use console::style;
use plugkit::config::PlugkitConfig;
use plugkit::room::{EnvCapabilities, detect_room};
use std::path::Path;

pub fn cmd_room(project_dir: &Path) -> Result<i32> {
    let config = PlugkitConfig::new(project_dir.to_path_buf())?;
    let caps = EnvCapabilities::probe(&config.toml.launch);
    let room = detect_room(&caps);

    println!();
    println!("Detected: {}", style(room).green().bold());
    println!();
    println!("  configured room  = {}", config.toml.launch.room);
    println!("  host_api         = {}", caps.host_api);
    if let Some(source) = &caps.host_source {
        println!("    (from {})", source);
    }
    println!("  embedded_frame   = {}", caps.embedded_frame);
    println!("  standalone_page  = {}", caps.standalone_page);
    println!();
    Ok(0)
}
