//! Bridge channel and controller.
//!
//! The controller launches a room, waits for its `ready` handshake and hands
//! out a [`BridgeChannel`]. The channel sends requests with monotonically
//! increasing correlation ids and resolves each pending request exactly once:
//! with its result, with a timeout, or with `ChannelClosed` on teardown.

use crate::bridge::host::{LaunchRequest, RoomHandle, RoomHost};
use crate::bridge::protocol::{
    AssertionResult, BridgeMessage, CorrelationId, LifecycleSignal, decode, encode,
};
use crate::build::package::PackageArtifact;
use crate::config::LaunchSection;
use crate::errors::BridgeError;
use crate::room::Room;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closed,
}

impl std::fmt::Display for ChannelState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "connecting"),
            Self::Open => write!(f, "open"),
            Self::Closed => write!(f, "closed"),
        }
    }
}

struct PendingRequest {
    name: String,
    reply: oneshot::Sender<Result<AssertionResult, BridgeError>>,
}

/// How many resolved ids a channel remembers for duplicate detection.
const SETTLED_MEMORY: usize = 1024;

#[derive(Default)]
struct Correlation {
    pending: HashMap<CorrelationId, PendingRequest>,
    /// Recently resolved ids, so late or repeated results can be told
    /// apart from ids that were never issued. Oldest forgotten first.
    settled: HashSet<CorrelationId>,
    settled_order: VecDeque<CorrelationId>,
}

impl Correlation {
    fn settle(&mut self, correlation_id: CorrelationId) {
        if !self.settled.insert(correlation_id) {
            return;
        }
        self.settled_order.push_back(correlation_id);
        if self.settled_order.len() > SETTLED_MEMORY
            && let Some(oldest) = self.settled_order.pop_front()
        {
            self.settled.remove(&oldest);
        }
    }
}

struct Shared {
    session_id: String,
    room: Room,
    state: Mutex<ChannelState>,
    correlation: Mutex<Correlation>,
    next_id: AtomicU64,
    outgoing: mpsc::UnboundedSender<Vec<u8>>,
    shutdown: CancellationToken,
    closed: CancellationToken,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl Shared {
    fn closed_error(&self) -> BridgeError {
        BridgeError::ChannelClosed {
            session_id: self.session_id.clone(),
        }
    }

    /// Track a request awaiting its result. The state is checked while the
    /// correlation lock is held, so a concurrent teardown either drains this
    /// entry or has already closed the channel and the insert is refused.
    fn register_pending(
        &self,
        correlation_id: CorrelationId,
        request: PendingRequest,
    ) -> Result<(), BridgeError> {
        let mut correlation = lock(&self.correlation);
        if *lock(&self.state) != ChannelState::Open {
            return Err(self.closed_error());
        }
        correlation.pending.insert(correlation_id, request);
        Ok(())
    }

    /// Close the channel. Only the first call has any effect.
    fn teardown(&self, reason: &str) {
        {
            let mut state = lock(&self.state);
            if *state == ChannelState::Closed {
                return;
            }
            *state = ChannelState::Closed;
        }

        if let Ok(frame) = encode(&BridgeMessage::Lifecycle {
            signal: LifecycleSignal::Close,
            reason: Some(reason.to_string()),
        }) {
            let _ = self.outgoing.send(frame);
        }
        self.shutdown.cancel();

        let drained: Vec<(CorrelationId, PendingRequest)> =
            lock(&self.correlation).pending.drain().collect();
        for (correlation_id, request) in drained {
            debug!(correlation_id, name = %request.name, "rejecting pending request");
            let _ = request.reply.send(Err(self.closed_error()));
        }

        self.closed.cancel();
        info!(session_id = %self.session_id, reason, "bridge channel closed");
    }

    fn handle_frame(&self, frame: &[u8]) {
        let message = match decode(frame) {
            Ok(message) => message,
            Err(e) => {
                warn!(session_id = %self.session_id, error = %e, "dropping malformed frame");
                return;
            }
        };

        match message {
            BridgeMessage::Result {
                correlation_id,
                outcome,
                timestamp_ordering,
            } => {
                let mut correlation = lock(&self.correlation);
                let request = correlation.pending.remove(&correlation_id);
                match request {
                    Some(request) => {
                        correlation.settle(correlation_id);
                        drop(correlation);
                        debug!(correlation_id, name = %request.name, "result received");
                        let _ = request.reply.send(Ok(AssertionResult {
                            correlation_id,
                            outcome: outcome.into_outcome(),
                            timestamp_ordering,
                        }));
                    }
                    None if correlation.settled.contains(&correlation_id) => {
                        warn!(correlation_id, "discarding result for an already settled request");
                    }
                    None => {
                        warn!(correlation_id, "discarding result with unknown correlation id");
                    }
                }
            }
            BridgeMessage::Lifecycle {
                signal: LifecycleSignal::Exit,
                reason,
            } => {
                let reason = reason.unwrap_or_else(|| "room exited".to_string());
                self.teardown(&reason);
            }
            other => debug!(?other, "ignoring frame"),
        }
    }
}

async fn read_loop(
    shared: Arc<Shared>,
    mut incoming: mpsc::UnboundedReceiver<Vec<u8>>,
    exited: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            _ = shared.closed.cancelled() => break,
            frame = incoming.recv() => match frame {
                Some(frame) => shared.handle_frame(&frame),
                None => {
                    shared.teardown("room closed the transport");
                    break;
                }
            },
            _ = exited.cancelled() => {
                shared.teardown("room exited");
                break;
            }
        }
    }
}

/// An open session with one room.
///
/// Dropping the channel tears it down.
pub struct BridgeChannel {
    shared: Arc<Shared>,
    assertion_timeout: Duration,
    reader: JoinHandle<()>,
}

impl BridgeChannel {
    fn open(handle: RoomHandle, session_id: String, assertion_timeout: Duration) -> Self {
        let RoomHandle {
            room,
            outgoing,
            incoming,
            shutdown,
            exited,
        } = handle;

        let shared = Arc::new(Shared {
            session_id,
            room,
            state: Mutex::new(ChannelState::Open),
            correlation: Mutex::new(Correlation::default()),
            next_id: AtomicU64::new(1),
            outgoing,
            shutdown,
            closed: CancellationToken::new(),
        });
        let reader = tokio::spawn(read_loop(Arc::clone(&shared), incoming, exited));

        Self {
            shared,
            assertion_timeout,
            reader,
        }
    }

    pub fn session_id(&self) -> &str {
        &self.shared.session_id
    }

    pub fn room(&self) -> Room {
        self.shared.room
    }

    pub fn state(&self) -> ChannelState {
        *lock(&self.shared.state)
    }

    pub fn pending_count(&self) -> usize {
        lock(&self.shared.correlation).pending.len()
    }

    /// Resolves once the channel has been torn down.
    pub async fn closed(&self) {
        self.shared.closed.cancelled().await
    }

    /// Send a request using the configured assertion timeout.
    pub async fn send(
        &self,
        name: &str,
        payload: serde_json::Value,
    ) -> Result<AssertionResult, BridgeError> {
        self.send_with_timeout(name, payload, self.assertion_timeout)
            .await
    }

    pub async fn send_with_timeout(
        &self,
        name: &str,
        payload: serde_json::Value,
        limit: Duration,
    ) -> Result<AssertionResult, BridgeError> {
        if self.state() != ChannelState::Open {
            return Err(self.shared.closed_error());
        }

        let correlation_id = self.shared.next_id.fetch_add(1, Ordering::SeqCst);
        let frame = encode(&BridgeMessage::Request {
            correlation_id,
            name: name.to_string(),
            payload,
        })?;

        let (reply, response) = oneshot::channel();
        self.shared.register_pending(
            correlation_id,
            PendingRequest {
                name: name.to_string(),
                reply,
            },
        )?;
        if self.shared.outgoing.send(frame).is_err() {
            lock(&self.shared.correlation).pending.remove(&correlation_id);
            self.shared.teardown("transport gone");
            return Err(self.shared.closed_error());
        }
        debug!(correlation_id, name, "request sent");

        match timeout(limit, response).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(self.shared.closed_error()),
            Err(_) => {
                let mut correlation = lock(&self.shared.correlation);
                correlation.pending.remove(&correlation_id);
                correlation.settle(correlation_id);
                warn!(correlation_id, name, ?limit, "assertion timed out");
                Err(BridgeError::AssertionTimeout {
                    name: name.to_string(),
                    correlation_id,
                    timeout: limit,
                })
            }
        }
    }

    /// Close the channel and reject everything still pending. Idempotent.
    pub fn teardown(&self) {
        self.shared.teardown("teardown requested");
    }
}

impl Drop for BridgeChannel {
    fn drop(&mut self) {
        self.shared.teardown("channel dropped");
        self.reader.abort();
    }
}

/// Launches rooms through a [`RoomHost`] and performs the handshake.
pub struct BridgeController {
    host: Arc<dyn RoomHost>,
    handshake_timeout: Duration,
    assertion_timeout: Duration,
    retry_backoff: Duration,
}

impl BridgeController {
    pub fn new(host: Arc<dyn RoomHost>) -> Self {
        Self {
            host,
            handshake_timeout: Duration::from_millis(5000),
            assertion_timeout: Duration::from_millis(10_000),
            retry_backoff: Duration::from_millis(500),
        }
    }

    pub fn from_config(host: Arc<dyn RoomHost>, launch: &LaunchSection) -> Self {
        Self::new(host)
            .with_handshake_timeout(launch.handshake_timeout())
            .with_assertion_timeout(launch.assertion_timeout())
            .with_retry_backoff(launch.retry_backoff())
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_assertion_timeout(mut self, timeout: Duration) -> Self {
        self.assertion_timeout = timeout;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn room(&self) -> Room {
        self.host.room()
    }

    /// Launch with one retry after a handshake timeout.
    pub async fn launch(&self, package: &PackageArtifact) -> Result<BridgeChannel, BridgeError> {
        match self.launch_attempt(package).await {
            Err(BridgeError::LaunchTimeout(limit)) => {
                warn!(?limit, backoff = ?self.retry_backoff, "no handshake, relaunching once");
                tokio::time::sleep(self.retry_backoff).await;
                self.launch_attempt(package).await
            }
            other => other,
        }
    }

    /// A single launch: start the room and wait for `ready`.
    pub async fn launch_attempt(
        &self,
        package: &PackageArtifact,
    ) -> Result<BridgeChannel, BridgeError> {
        let session_id = uuid::Uuid::new_v4().to_string();
        let request = LaunchRequest {
            session_id: session_id.clone(),
            package: package.clone(),
        };

        info!(session_id = %session_id, room = %self.host.room(), "launching room");
        let mut handle = self.host.spawn_room(&request).await?;

        match timeout(self.handshake_timeout, wait_ready(&mut handle, &session_id)).await {
            Ok(Ok(())) => {
                info!(session_id = %session_id, "room ready");
                Ok(BridgeChannel::open(handle, session_id, self.assertion_timeout))
            }
            Ok(Err(e)) => {
                handle.shutdown.cancel();
                Err(e)
            }
            Err(_) => {
                handle.shutdown.cancel();
                Err(BridgeError::LaunchTimeout(self.handshake_timeout))
            }
        }
    }
}

async fn wait_ready(handle: &mut RoomHandle, session_id: &str) -> Result<(), BridgeError> {
    loop {
        let Some(frame) = handle.incoming.recv().await else {
            return Err(BridgeError::ChannelClosed {
                session_id: session_id.to_string(),
            });
        };
        match decode(&frame) {
            Ok(BridgeMessage::Ready { session_id: id, .. }) if id == session_id => return Ok(()),
            Ok(BridgeMessage::Ready { session_id: id, .. }) => {
                warn!(expected = session_id, got = %id, "ready for another session ignored");
            }
            Ok(other) => debug!(?other, "frame before handshake ignored"),
            Err(e) => warn!(error = %e, "malformed frame before handshake"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::host::{MemoryRoomHost, duplex};
    use crate::bridge::protocol::RemoteOutcome;
    use crate::bridge::remote::RemoteHarness;
    use crate::errors::FailureKind;
    use serde_json::json;

    fn package() -> PackageArtifact {
        PackageArtifact {
            out_dir: "dist".into(),
            manifest: "dist/manifest.json".into(),
            main: "dist/main.bundle.js".into(),
            ui: None,
        }
    }

    fn harness() -> RemoteHarness {
        RemoteHarness::new(Room::Browser)
            .register_fn("pass", |_, _| async { RemoteOutcome::pass() })
            .register_fn("fail", |_, _| async { RemoteOutcome::fail("swatch missing") })
            .register_fn("hang", |_, _| std::future::pending::<RemoteOutcome>())
    }

    /// A channel over a raw duplex, for driving the remote side by hand.
    fn manual_channel(limit: Duration) -> (BridgeChannel, crate::bridge::host::RemoteEnd) {
        let (handle, remote) = duplex(Room::Plugin);
        (BridgeChannel::open(handle, "manual".into(), limit), remote)
    }

    fn result_frame(id: u64, order: u64) -> Vec<u8> {
        encode(&BridgeMessage::Result {
            correlation_id: id,
            outcome: RemoteOutcome::Pass {
                value: Some(json!(id)),
            },
            timestamp_ordering: order,
        })
        .unwrap()
    }

    async fn next_request_id(remote: &mut crate::bridge::host::RemoteEnd) -> u64 {
        match decode(&remote.incoming.recv().await.unwrap()).unwrap() {
            BridgeMessage::Request { correlation_id, .. } => correlation_id,
            other => panic!("expected request, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_launch_and_send() {
        let controller = BridgeController::new(Arc::new(MemoryRoomHost::new(harness())));
        let channel = controller.launch(&package()).await.unwrap();

        assert_eq!(channel.state(), ChannelState::Open);
        assert_eq!(channel.room(), Room::Browser);

        let result = channel.send("pass", json!({})).await.unwrap();
        assert!(result.outcome.is_success());
        assert_eq!(result.correlation_id, 1);

        let result = channel.send("fail", json!({})).await.unwrap();
        assert_eq!(result.correlation_id, 2);
        assert_eq!(
            result.outcome.failure_kind(),
            Some(FailureKind::AssertionFailed)
        );
    }

    #[tokio::test]
    async fn test_out_of_order_results_match_by_correlation_id() {
        let (channel, mut remote) = manual_channel(Duration::from_secs(5));
        let channel = Arc::new(channel);

        let first = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send("a", json!(null)).await }
        });
        let id_a = next_request_id(&mut remote).await;
        let second = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send("b", json!(null)).await }
        });
        let id_b = next_request_id(&mut remote).await;
        assert!(id_b > id_a);

        remote.outgoing.send(result_frame(id_b, 1)).unwrap();
        remote.outgoing.send(result_frame(id_a, 2)).unwrap();

        let a = first.await.unwrap().unwrap();
        let b = second.await.unwrap().unwrap();
        assert_eq!(a.correlation_id, id_a);
        assert_eq!(a.outcome.artifact(), Some(&json!(id_a)));
        assert_eq!(b.correlation_id, id_b);
        assert_eq!(b.timestamp_ordering, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_results_are_dropped() {
        let (channel, mut remote) = manual_channel(Duration::from_secs(5));
        let channel = Arc::new(channel);

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send("a", json!(null)).await }
        });
        let id = next_request_id(&mut remote).await;

        remote.outgoing.send(result_frame(999, 1)).unwrap();
        remote.outgoing.send(b"{garbage".to_vec()).unwrap();
        remote.outgoing.send(result_frame(id, 2)).unwrap();
        remote.outgoing.send(result_frame(id, 3)).unwrap();

        let result = pending.await.unwrap().unwrap();
        assert_eq!(result.timestamp_ordering, 2);

        // The channel survives stray frames.
        let follow_up = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send("b", json!(null)).await }
        });
        let next_id = next_request_id(&mut remote).await;
        remote.outgoing.send(result_frame(next_id, 4)).unwrap();
        assert!(follow_up.await.unwrap().is_ok());
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_assertion_timeout() {
        let controller = BridgeController::new(Arc::new(MemoryRoomHost::new(harness())))
            .with_assertion_timeout(Duration::from_secs(2));
        let channel = controller.launch(&package()).await.unwrap();

        let err = channel.send("hang", json!({})).await.unwrap_err();
        match err {
            BridgeError::AssertionTimeout {
                name,
                correlation_id,
                timeout,
            } => {
                assert_eq!(name, "hang");
                assert_eq!(correlation_id, 1);
                assert_eq!(timeout, Duration::from_secs(2));
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        assert_eq!(channel.pending_count(), 0);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test]
    async fn test_teardown_rejects_pending_and_is_idempotent() {
        let (channel, mut remote) = manual_channel(Duration::from_secs(5));
        let channel = Arc::new(channel);

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send("a", json!(null)).await }
        });
        next_request_id(&mut remote).await;

        channel.teardown();
        channel.teardown();

        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(
            err,
            BridgeError::ChannelClosed {
                session_id: "manual".into()
            }
        );
        assert_eq!(channel.state(), ChannelState::Closed);
        assert!(remote.shutdown.is_cancelled());

        // Exactly one close frame was sent.
        let close = decode(&remote.incoming.recv().await.unwrap()).unwrap();
        assert!(matches!(
            close,
            BridgeMessage::Lifecycle {
                signal: LifecycleSignal::Close,
                ..
            }
        ));
        assert!(remote.incoming.try_recv().is_err());

        let err = channel.send("b", json!(null)).await.unwrap_err();
        assert!(matches!(err, BridgeError::ChannelClosed { .. }));
    }

    #[tokio::test]
    async fn test_register_after_close_is_refused() {
        let (channel, _remote) = manual_channel(Duration::from_secs(5));

        // The channel closed and drained before this request got in.
        *lock(&channel.shared.state) = ChannelState::Closed;
        let (reply, _response) = oneshot::channel();
        let err = channel
            .shared
            .register_pending(
                7,
                PendingRequest {
                    name: "late".into(),
                    reply,
                },
            )
            .unwrap_err();

        assert!(matches!(err, BridgeError::ChannelClosed { .. }));
        assert_eq!(channel.pending_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_send_racing_transport_close_resolves_closed() {
        for _ in 0..100 {
            let (channel, remote) = manual_channel(Duration::from_secs(30));
            let channel = Arc::new(channel);

            let sender = tokio::spawn({
                let channel = Arc::clone(&channel);
                async move { channel.send("a", json!(null)).await }
            });
            // Only the room's sending side goes away; requests still queue.
            drop(remote.outgoing);

            let result = tokio::time::timeout(Duration::from_secs(5), sender)
                .await
                .expect("send should resolve on teardown, not on its own timeout")
                .unwrap();
            assert!(matches!(result, Err(BridgeError::ChannelClosed { .. })));
            assert_eq!(channel.pending_count(), 0);
        }
    }

    #[test]
    fn test_settled_ids_are_bounded() {
        let mut correlation = Correlation::default();
        for id in 0..(SETTLED_MEMORY as u64 + 10) {
            correlation.settle(id);
        }
        correlation.settle(20);

        assert_eq!(correlation.settled.len(), SETTLED_MEMORY);
        assert_eq!(correlation.settled_order.len(), SETTLED_MEMORY);
        assert!(!correlation.settled.contains(&0));
        assert!(correlation.settled.contains(&(SETTLED_MEMORY as u64 + 9)));
    }

    #[tokio::test]
    async fn test_room_exit_closes_channel() {
        let (channel, mut remote) = manual_channel(Duration::from_secs(5));
        let channel = Arc::new(channel);

        let pending = tokio::spawn({
            let channel = Arc::clone(&channel);
            async move { channel.send("a", json!(null)).await }
        });
        next_request_id(&mut remote).await;
        drop(remote);

        assert!(matches!(
            pending.await.unwrap(),
            Err(BridgeError::ChannelClosed { .. })
        ));
        channel.closed().await;
        assert_eq!(channel.state(), ChannelState::Closed);
    }

    #[tokio::test]
    async fn test_drop_tears_down() {
        let (channel, remote) = manual_channel(Duration::from_secs(5));
        drop(channel);
        assert!(remote.shutdown.is_cancelled());
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_retries_once_after_handshake_timeout() {
        let host = Arc::new(MemoryRoomHost::new(harness()).with_silent_launches(1));
        let controller = BridgeController::new(host.clone())
            .with_handshake_timeout(Duration::from_secs(1))
            .with_retry_backoff(Duration::from_millis(100));

        let channel = controller.launch(&package()).await.unwrap();
        assert_eq!(host.launches(), 2);
        assert_eq!(channel.state(), ChannelState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_launch_gives_up_after_second_timeout() {
        let host = Arc::new(MemoryRoomHost::new(harness()).with_silent_launches(5));
        let controller =
            BridgeController::new(host.clone()).with_handshake_timeout(Duration::from_secs(1));

        let err = controller.launch(&package()).await.err().unwrap();
        assert_eq!(err, BridgeError::LaunchTimeout(Duration::from_secs(1)));
        assert_eq!(host.launches(), 2);
    }

    #[tokio::test]
    async fn test_each_launch_gets_a_fresh_session() {
        let controller = BridgeController::new(Arc::new(MemoryRoomHost::new(harness())));
        let a = controller.launch(&package()).await.unwrap();
        let b = controller.launch(&package()).await.unwrap();
        assert_ne!(a.session_id(), b.session_id());
    }
}
