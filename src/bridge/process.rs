//! Plugin-room host backed by a child process.
//!
//! The configured host command is started with the package directory as its
//! last argument. Frames travel as newline-delimited JSON over the child's
//! stdin and stdout; stderr is forwarded to the log.

use crate::bridge::host::{LaunchRequest, RoomHandle, RoomHost};
use crate::config::LaunchSection;
use crate::errors::BridgeError;
use crate::room::Room;
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct ProcessRoomHost {
    command: String,
    args: Vec<String>,
    working_dir: PathBuf,
}

impl ProcessRoomHost {
    pub fn new(command: impl Into<String>, args: Vec<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            args,
            working_dir: working_dir.into(),
        }
    }

    /// `None` when no `host_command` is configured.
    pub fn from_config(launch: &LaunchSection, working_dir: impl Into<PathBuf>) -> Option<Self> {
        let command = launch.host_command.as_ref()?;
        Some(Self::new(command.clone(), launch.host_args.clone(), working_dir))
    }
}

#[async_trait]
impl RoomHost for ProcessRoomHost {
    fn room(&self) -> Room {
        Room::Plugin
    }

    async fn spawn_room(&self, request: &LaunchRequest) -> Result<RoomHandle, BridgeError> {
        let mut child = Command::new(&self.command)
            .args(&self.args)
            .arg(&request.package.out_dir)
            .current_dir(&self.working_dir)
            .env("PLUGKIT_SESSION_ID", &request.session_id)
            .env("PLUGKIT_PACKAGE_DIR", &request.package.out_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| BridgeError::SpawnFailed(format!("{}: {}", self.command, e)))?;

        let (Some(mut stdin), Some(stdout), Some(stderr)) =
            (child.stdin.take(), child.stdout.take(), child.stderr.take())
        else {
            return Err(BridgeError::SpawnFailed(
                "child stdio was not captured".to_string(),
            ));
        };

        info!(command = %self.command, pid = ?child.id(), "room process started");

        let (to_room, mut from_local) = mpsc::unbounded_channel::<Vec<u8>>();
        let (to_local, from_room) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();
        let exited = CancellationToken::new();

        tokio::spawn(async move {
            while let Some(mut frame) = from_local.recv().await {
                frame.push(b'\n');
                if let Err(e) = stdin.write_all(&frame).await {
                    debug!(error = %e, "room stdin closed");
                    break;
                }
                if stdin.flush().await.is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                if to_local.send(line.as_bytes().to_vec()).is_err() {
                    break;
                }
            }
        });

        tokio::spawn(async move {
            let mut lines = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                debug!(target: "plugkit::room", "{}", line);
            }
        });

        tokio::spawn({
            let shutdown = shutdown.clone();
            let exited = exited.clone();
            async move {
                let _exit = exited.drop_guard();
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        if let Err(e) = child.kill().await {
                            warn!(error = %e, "failed to kill room process");
                        }
                    }
                    status = child.wait() => match status {
                        Ok(status) => info!(%status, "room process exited"),
                        Err(e) => warn!(error = %e, "failed to wait for room process"),
                    },
                }
            }
        });

        Ok(RoomHandle {
            room: Room::Plugin,
            outgoing: to_room,
            incoming: from_room,
            shutdown,
            exited,
        })
    }
}
