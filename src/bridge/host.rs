//! Room hosts.
//!
//! A [`RoomHost`] starts one instance of the packaged plugin and hands back a
//! [`RoomHandle`]: a pair of frame queues plus lifecycle tokens. The host
//! owns the transport (stdio, WebSocket, in-memory); the channel on top of
//! it only ever sees whole frames.

use crate::bridge::remote::RemoteHarness;
use crate::build::package::PackageArtifact;
use crate::errors::BridgeError;
use crate::room::Room;
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, DropGuard};

/// What a host needs to start a room.
#[derive(Debug, Clone)]
pub struct LaunchRequest {
    /// The room must echo this id in its `ready` handshake.
    pub session_id: String,
    pub package: PackageArtifact,
}

/// Local end of a running room.
pub struct RoomHandle {
    pub room: Room,
    /// Frames to the room
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    /// Frames from the room
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    /// Cancelled by the controller to stop the room.
    pub shutdown: CancellationToken,
    /// Cancelled by the host once the room is gone.
    pub exited: CancellationToken,
}

/// Remote end of an in-process transport.
pub struct RemoteEnd {
    pub incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    pub outgoing: mpsc::UnboundedSender<Vec<u8>>,
    pub shutdown: CancellationToken,
    _exit: DropGuard,
}

/// Create a connected handle/remote pair. Dropping the remote end marks
/// the room as exited.
pub fn duplex(room: Room) -> (RoomHandle, RemoteEnd) {
    let (to_room, from_local) = mpsc::unbounded_channel();
    let (to_local, from_room) = mpsc::unbounded_channel();
    let shutdown = CancellationToken::new();
    let exited = CancellationToken::new();

    let handle = RoomHandle {
        room,
        outgoing: to_room,
        incoming: from_room,
        shutdown: shutdown.clone(),
        exited: exited.clone(),
    };
    let remote = RemoteEnd {
        incoming: from_local,
        outgoing: to_local,
        shutdown,
        _exit: exited.drop_guard(),
    };
    (handle, remote)
}

#[async_trait]
pub trait RoomHost: Send + Sync {
    fn room(&self) -> Room;

    /// Start a room for `request.package`. Returns once the transport is
    /// up; the `ready` handshake is awaited by the caller.
    async fn spawn_room(&self, request: &LaunchRequest) -> Result<RoomHandle, BridgeError>;
}

/// Runs a [`RemoteHarness`] on a tokio task in this process.
pub struct MemoryRoomHost {
    harness: Arc<RemoteHarness>,
    silent_launches: AtomicU32,
    launches: AtomicU32,
    handshake_delay: Duration,
}

impl MemoryRoomHost {
    pub fn new(harness: RemoteHarness) -> Self {
        Self {
            harness: Arc::new(harness),
            silent_launches: AtomicU32::new(0),
            launches: AtomicU32::new(0),
            handshake_delay: Duration::ZERO,
        }
    }

    /// The first `count` launches never send `ready`.
    pub fn with_silent_launches(self, count: u32) -> Self {
        self.silent_launches.store(count, Ordering::SeqCst);
        self
    }

    pub fn with_handshake_delay(mut self, delay: Duration) -> Self {
        self.handshake_delay = delay;
        self
    }

    /// Number of rooms started so far.
    pub fn launches(&self) -> u32 {
        self.launches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RoomHost for MemoryRoomHost {
    fn room(&self) -> Room {
        self.harness.room()
    }

    async fn spawn_room(&self, request: &LaunchRequest) -> Result<RoomHandle, BridgeError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        let silent = self
            .silent_launches
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();

        let (handle, remote) = duplex(self.room());
        let harness = Arc::clone(&self.harness);
        let session_id = request.session_id.clone();
        let delay = self.handshake_delay;

        tokio::spawn(async move {
            if silent {
                remote.shutdown.cancelled().await;
                return;
            }
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            harness.serve(remote, &session_id).await;
        });

        Ok(handle)
    }
}
