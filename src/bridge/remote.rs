//! Room-side assertion harness.
//!
//! Inside a room, assertions are registered by name and invoked when a
//! matching `request` frame arrives. Requests are handled concurrently and
//! each produces exactly one `result` frame, so results may come back in a
//! different order than their requests.

use crate::bridge::host::RemoteEnd;
use crate::bridge::protocol::{
    BridgeMessage, CorrelationId, LifecycleSignal, RemoteOutcome, decode, encode,
};
use crate::room::Room;
use async_trait::async_trait;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, warn};

/// What an assertion can see about the request it is answering.
#[derive(Debug, Clone)]
pub struct AssertionContext {
    pub session_id: String,
    pub correlation_id: CorrelationId,
    pub name: String,
    pub room: Room,
}

#[async_trait]
pub trait AssertionHandler: Send + Sync {
    async fn check(&self, ctx: AssertionContext, payload: serde_json::Value) -> RemoteOutcome;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> AssertionHandler for FnHandler<F>
where
    F: Fn(AssertionContext, serde_json::Value) -> Fut + Send + Sync,
    Fut: Future<Output = RemoteOutcome> + Send,
{
    async fn check(&self, ctx: AssertionContext, payload: serde_json::Value) -> RemoteOutcome {
        (self.0)(ctx, payload).await
    }
}

/// Registry of named assertions plus the loop that serves them.
pub struct RemoteHarness {
    room: Room,
    handlers: HashMap<String, Arc<dyn AssertionHandler>>,
}

impl RemoteHarness {
    pub fn new(room: Room) -> Self {
        Self {
            room,
            handlers: HashMap::new(),
        }
    }

    pub fn room(&self) -> Room {
        self.room
    }

    pub fn register(mut self, name: impl Into<String>, handler: Arc<dyn AssertionHandler>) -> Self {
        self.handlers.insert(name.into(), handler);
        self
    }

    pub fn register_fn<F, Fut>(self, name: impl Into<String>, f: F) -> Self
    where
        F: Fn(AssertionContext, serde_json::Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = RemoteOutcome> + Send + 'static,
    {
        self.register(name, Arc::new(FnHandler(f)))
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    async fn handle(
        &self,
        session_id: &str,
        correlation_id: CorrelationId,
        name: String,
        payload: serde_json::Value,
    ) -> (CorrelationId, RemoteOutcome) {
        let Some(handler) = self.handlers.get(&name).cloned() else {
            return (
                correlation_id,
                RemoteOutcome::error(format!("Unknown assertion '{}'", name)),
            );
        };
        let ctx = AssertionContext {
            session_id: session_id.to_string(),
            correlation_id,
            name,
            room: self.room,
        };
        (correlation_id, handler.check(ctx, payload).await)
    }

    /// Announce `ready`, then answer requests until the local side closes
    /// the channel or asks the room to shut down.
    pub async fn serve(&self, remote: RemoteEnd, session_id: &str) {
        let RemoteEnd {
            mut incoming,
            outgoing,
            shutdown,
            ..
        } = remote;

        let send = |message: &BridgeMessage| match encode(message) {
            Ok(frame) => outgoing.send(frame).is_ok(),
            Err(e) => {
                warn!(error = %e, "failed to encode frame");
                true
            }
        };

        let ready = BridgeMessage::Ready {
            session_id: session_id.to_string(),
            room: Some(self.room),
        };
        if !send(&ready) {
            return;
        }

        let mut in_flight = FuturesUnordered::new();
        let mut ordering = 0u64;

        loop {
            tokio::select! {
                frame = incoming.recv() => {
                    let Some(frame) = frame else { break };
                    match decode(&frame) {
                        Ok(BridgeMessage::Request { correlation_id, name, payload }) => {
                            debug!(correlation_id, name = %name, "assertion requested");
                            in_flight.push(self.handle(session_id, correlation_id, name, payload));
                        }
                        Ok(BridgeMessage::Lifecycle { signal: LifecycleSignal::Close, .. }) => {
                            debug!(session_id, "close received");
                            break;
                        }
                        Ok(other) => debug!(?other, "ignoring frame"),
                        Err(e) => warn!(error = %e, "dropping malformed frame"),
                    }
                }
                Some((correlation_id, outcome)) = in_flight.next(), if !in_flight.is_empty() => {
                    ordering += 1;
                    let result = BridgeMessage::Result {
                        correlation_id,
                        outcome,
                        timestamp_ordering: ordering,
                    };
                    if !send(&result) {
                        break;
                    }
                }
                _ = shutdown.cancelled() => break,
            }
        }

        let _ = send(&BridgeMessage::Lifecycle {
            signal: LifecycleSignal::Exit,
            reason: None,
        });
    }
}
