//! Notifications emitted by a [`crate::BusConnection`].
//!
//! Fire-and-forget over a single `broadcast` channel: any number of
//! listeners, no backpressure. A listener that falls behind skips events
//! (`RecvError::Lagged`).

use serde::Serialize;
use tokio::sync::broadcast;

use crate::transport::Status;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ConnectionEvent {
    /// The active connection was replaced. Anything bound to the old one
    /// (subscriptions, watchers) must be re-established.
    Reconnect,
    /// Status change on whichever connection is currently active.
    Status { status: Status },
    /// Too many subscriptions: the connection went into standby and will
    /// resume after `resume_in_ms`.
    SubscriptionLimit {
        subscriptions: usize,
        resume_in_ms: u64,
    },
}

#[derive(Clone)]
pub struct EventHub {
    sender: broadcast::Sender<ConnectionEvent>,
}

impl EventHub {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.sender.subscribe()
    }

    pub fn emit(&self, event: ConnectionEvent) {
        // No listeners is fine.
        let _ = self.sender.send(event);
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new()
    }
}
