//! Request/response bridge between the local orchestrator and a room.
//!
//! - [`protocol`]: the JSON frame format
//! - [`host`]: how rooms are started ([`RoomHost`]) and the in-memory host
//! - [`process`]: plugin room over child-process stdio
//! - [`browser`]: browser room over a local page and WebSocket
//! - [`channel`]: correlation, timeouts and teardown
//! - [`remote`]: the room-side assertion registry

pub mod browser;
pub mod channel;
pub mod host;
pub mod process;
pub mod protocol;
pub mod remote;

pub use browser::BrowserRoomHost;
pub use channel::{BridgeChannel, BridgeController, ChannelState};
pub use host::{LaunchRequest, MemoryRoomHost, RoomHandle, RoomHost};
pub use process::ProcessRoomHost;
pub use protocol::{AssertionResult, BridgeMessage, CorrelationId, RemoteOutcome};
pub use remote::{AssertionContext, AssertionHandler, RemoteHarness};

use crate::config::PlugkitConfig;
use crate::errors::BridgeError;
use crate::room::Room;
use crate::task::{Failure, Outcome};
use std::sync::Arc;

/// Run one named assertion in the room and fold every transport error into
/// a failed outcome.
pub async fn execute_assertion(
    channel: &BridgeChannel,
    name: &str,
    payload: serde_json::Value,
) -> Outcome {
    match channel.send(name, payload).await {
        Ok(result) => result.outcome,
        Err(e) => Failure::new(e.failure_kind(), e.to_string()).into(),
    }
}

/// The host that starts rooms of the given kind.
pub fn host_for(room: Room, config: &PlugkitConfig) -> Result<Arc<dyn RoomHost>, BridgeError> {
    match room {
        Room::Plugin => ProcessRoomHost::from_config(&config.toml.launch, &config.project_dir)
            .map(|host| Arc::new(host) as Arc<dyn RoomHost>)
            .ok_or_else(|| {
                BridgeError::SpawnFailed(
                    "the plugin room needs [launch].host_command in plugkit.toml".to_string(),
                )
            }),
        Room::Browser => Ok(Arc::new(BrowserRoomHost::from_config(&config.toml.launch))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::build::package::PackageArtifact;
    use crate::errors::FailureKind;
    use serde_json::json;
    use std::time::Duration;

    fn package() -> PackageArtifact {
        PackageArtifact {
            out_dir: "dist".into(),
            manifest: "dist/manifest.json".into(),
            main: "dist/main.bundle.js".into(),
            ui: None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_execute_assertion_maps_every_result() {
        let harness = RemoteHarness::new(Room::Browser)
            .register_fn("holds", |_, _| async { RemoteOutcome::pass() })
            .register_fn("broken", |_, _| async { RemoteOutcome::error("TypeError: x is undefined") })
            .register_fn("hangs", |_, _| std::future::pending::<RemoteOutcome>());
        let controller = BridgeController::new(Arc::new(MemoryRoomHost::new(harness)))
            .with_assertion_timeout(Duration::from_secs(1));
        let channel = controller.launch(&package()).await.unwrap();

        assert!(execute_assertion(&channel, "holds", json!({})).await.is_success());
        assert_eq!(
            execute_assertion(&channel, "broken", json!({})).await.failure_kind(),
            Some(FailureKind::AssertionError)
        );
        assert_eq!(
            execute_assertion(&channel, "hangs", json!({})).await.failure_kind(),
            Some(FailureKind::AssertionTimeout)
        );

        channel.teardown();
        assert_eq!(
            execute_assertion(&channel, "holds", json!({})).await.failure_kind(),
            Some(FailureKind::ChannelClosed)
        );
    }

    #[test]
    fn test_plugin_room_needs_host_command() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = PlugkitConfig::with_env(dir.path().to_path_buf(), |_| None).unwrap();
        assert!(host_for(Room::Plugin, &config).is_err());
        assert_eq!(host_for(Room::Browser, &config).unwrap().room(), Room::Browser);

        config.toml.launch.host_command = Some("host".into());
        assert_eq!(host_for(Room::Plugin, &config).unwrap().room(), Room::Plugin);
    }
}
