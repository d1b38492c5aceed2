//! Room detection.
//!
//! A plugin runs either inside the host application's sandboxed runtime
//! (the plugin room) or in a plain browser context (the browser room).
//! Detection is a pure classification over an [`EnvCapabilities`] value;
//! only [`EnvCapabilities::probe`] looks at the process environment.

use crate::config::LaunchSection;
use serde::{Deserialize, Serialize};
use std::sync::OnceLock;

/// The execution environment a plugin instance runs in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Room {
    /// The host application's sandboxed runtime.
    Plugin,
    /// A browser page or embedded frame.
    Browser,
}

impl std::fmt::Display for Room {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Plugin => write!(f, "plugin room"),
            Self::Browser => write!(f, "browser room"),
        }
    }
}

/// Which room to launch in, as configured.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, clap::ValueEnum,
)]
#[serde(rename_all = "lowercase")]
pub enum RoomPreference {
    /// Detect from the environment
    #[default]
    Auto,
    Plugin,
    Browser,
}

impl RoomPreference {
    pub fn forced(self) -> Option<Room> {
        match self {
            Self::Auto => None,
            Self::Plugin => Some(Room::Plugin),
            Self::Browser => Some(Room::Browser),
        }
    }
}

impl std::fmt::Display for RoomPreference {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Auto => write!(f, "auto"),
            Self::Plugin => write!(f, "plugin"),
            Self::Browser => write!(f, "browser"),
        }
    }
}

impl std::str::FromStr for RoomPreference {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "plugin" => Ok(Self::Plugin),
            "browser" => Ok(Self::Browser),
            _ => Err(format!(
                "Invalid room '{}'. Valid values: auto, plugin, browser",
                s
            )),
        }
    }
}

/// What the current environment offers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EnvCapabilities {
    /// The host runtime's API surface is reachable.
    pub host_api: bool,
    /// Running inside an embedded frame.
    pub embedded_frame: bool,
    /// Running as a standalone page.
    pub standalone_page: bool,
    /// An explicit room choice that overrides detection.
    pub forced: Option<Room>,
    /// Where `host_api` came from, for display.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_source: Option<String>,
}

impl EnvCapabilities {
    /// Probe the process environment.
    pub fn probe(launch: &LaunchSection) -> Self {
        Self::probe_with(launch, |key| std::env::var(key).ok(), |cmd| {
            which::which(cmd).is_ok()
        })
    }

    /// Probe with injected lookups for environment variables and `PATH`.
    pub fn probe_with<E, W>(launch: &LaunchSection, env: E, on_path: W) -> Self
    where
        E: Fn(&str) -> Option<String>,
        W: Fn(&str) -> bool,
    {
        let flag = |key: &str| {
            env(key)
                .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
                .unwrap_or(false)
        };

        let mut host_source = None;
        if flag("PLUGKIT_HOST_API") {
            host_source = Some("PLUGKIT_HOST_API".to_string());
        } else if let Some(cmd) = launch.host_command.as_deref()
            && let Some(program) = cmd.split_whitespace().next()
            && on_path(program)
        {
            host_source = Some(format!("host_command '{}' on PATH", program));
        }

        let embedded_frame = flag("PLUGKIT_EMBEDDED");
        Self {
            host_api: host_source.is_some(),
            embedded_frame,
            standalone_page: !embedded_frame,
            forced: launch.room.forced(),
            host_source,
        }
    }
}

/// Classify the environment. Pure: the same capabilities always give the same room.
pub fn detect_room(caps: &EnvCapabilities) -> Room {
    if let Some(room) = caps.forced {
        return room;
    }
    if caps.host_api {
        return Room::Plugin;
    }
    // Embedded frame or standalone page; with no host runtime this is the fallback
    Room::Browser
}

static CURRENT_ROOM: OnceLock<Room> = OnceLock::new();

/// The room for this process, detected on first call and fixed afterwards.
pub fn current_room(caps: &EnvCapabilities) -> Room {
    *CURRENT_ROOM.get_or_init(|| detect_room(caps))
}
