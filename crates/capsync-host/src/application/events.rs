//! Host event bus: an explicit publish/subscribe interface.
//!
//! Every outcome a presentation layer might care about (a device connecting,
//! a sensor sample arriving, a file failing its integrity check, the host
//! dropping into a degraded performance level) is published here as a
//! [`HostEvent`].  Subscribers are called synchronously, in subscription
//! order, on the task that produced the event.
//!
//! A handler that returns an error or panics is logged and skipped; the
//! remaining handlers still receive the event.  No failure inside a handler
//! ever reaches the publisher.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use capsync_core::protocol::messages::{CommandAck, PreviewFrame};
use capsync_core::protocol::SequenceCounter;
use capsync_core::{DeviceId, DeviceStatus, Message, PerformanceLevel, SensorSample, Session};
use thiserror::Error;
use tracing::{error, warn};

use crate::sync::{read, write};

/// Why a device left the registry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The device closed its socket.
    Closed,
    /// No inbound traffic for longer than the heartbeat timeout.
    HeartbeatTimeout,
    /// Too many consecutive send/receive failures.
    ErrorThreshold,
    /// The device sent a frame that violates the protocol.
    ProtocolViolation(String),
    /// A newer connection presented the same device ID.
    Superseded,
    /// The host is shutting down.
    Shutdown,
    /// An operator asked for the disconnect.
    Requested(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => f.write_str("connection closed by device"),
            Self::HeartbeatTimeout => f.write_str("heartbeat timeout"),
            Self::ErrorThreshold => f.write_str("error threshold exceeded"),
            Self::ProtocolViolation(detail) => write!(f, "protocol violation: {detail}"),
            Self::Superseded => f.write_str("superseded by a new connection"),
            Self::Shutdown => f.write_str("host shutdown"),
            Self::Requested(detail) => write!(f, "requested: {detail}"),
        }
    }
}

/// Everything the host reports to subscribers.
#[derive(Debug, Clone)]
pub enum HostEvent {
    DeviceConnected {
        device_id: DeviceId,
        capabilities: Vec<String>,
    },
    /// Fires exactly once per Device, whatever ended it.
    DeviceDisconnected {
        device_id: DeviceId,
        reason: DisconnectReason,
    },
    StatusUpdated {
        device_id: DeviceId,
        status: DeviceStatus,
    },
    Sample(SensorSample),
    PreviewFrame {
        device_id: DeviceId,
        frame: PreviewFrame,
    },
    CommandAck {
        device_id: DeviceId,
        ack: CommandAck,
    },
    FileReceived {
        device_id: DeviceId,
        name: String,
        session_id: Option<String>,
        data: Arc<Vec<u8>>,
    },
    FileRejected {
        device_id: DeviceId,
        name: String,
        reason: String,
    },
    /// A message no typed handler claimed, forwarded unchanged.
    Unrouted {
        device_id: DeviceId,
        message: Message,
    },
    SessionStarted(Session),
    SessionStopped(Session),
    SyncBroadcast {
        kind: String,
        sync_id: String,
        devices: usize,
    },
    /// A device's sensor stream went quiet; the device stays connected.
    DataStale {
        device_id: DeviceId,
        silent_for: Duration,
    },
    PerformanceLevelChanged {
        from: PerformanceLevel,
        to: PerformanceLevel,
    },
    Backpressure {
        queue: String,
        depth: usize,
        capacity: usize,
    },
}

impl HostEvent {
    /// Short name used in log lines.
    pub fn name(&self) -> &'static str {
        match self {
            Self::DeviceConnected { .. } => "device_connected",
            Self::DeviceDisconnected { .. } => "device_disconnected",
            Self::StatusUpdated { .. } => "status_updated",
            Self::Sample(_) => "sample",
            Self::PreviewFrame { .. } => "preview_frame",
            Self::CommandAck { .. } => "command_ack",
            Self::FileReceived { .. } => "file_received",
            Self::FileRejected { .. } => "file_rejected",
            Self::Unrouted { .. } => "unrouted",
            Self::SessionStarted(_) => "session_started",
            Self::SessionStopped(_) => "session_stopped",
            Self::SyncBroadcast { .. } => "sync_broadcast",
            Self::DataStale { .. } => "data_stale",
            Self::PerformanceLevelChanged { .. } => "performance_level_changed",
            Self::Backpressure { .. } => "backpressure",
        }
    }
}

/// Error a subscriber may return; logged by the bus and otherwise ignored.
#[derive(Debug, Error)]
#[error("{0}")]
pub struct HandlerError(pub String);

impl From<&str> for HandlerError {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for HandlerError {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// A subscriber.  Closures of the right shape implement this automatically.
pub trait EventHandler: Send + Sync {
    fn handle(&self, event: &HostEvent) -> Result<(), HandlerError>;
}

impl<F> EventHandler for F
where
    F: Fn(&HostEvent) -> Result<(), HandlerError> + Send + Sync,
{
    fn handle(&self, event: &HostEvent) -> Result<(), HandlerError> {
        self(event)
    }
}

/// Handle returned by [`EventBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

/// Ordered list of subscribers.
#[derive(Default)]
pub struct EventBus {
    handlers: RwLock<Vec<(SubscriptionId, Arc<dyn EventHandler>)>>,
    ids: SequenceCounter,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a closure handler; it sees every event published from now on.
    pub fn subscribe<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&HostEvent) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        self.subscribe_handler(handler)
    }

    /// Appends any [`EventHandler`] implementation.
    pub fn subscribe_handler(&self, handler: impl EventHandler + 'static) -> SubscriptionId {
        let id = SubscriptionId(self.ids.next());
        write(&self.handlers).push((id, Arc::new(handler)));
        id
    }

    /// Removes a handler.  Returns `false` if it was already gone.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut handlers = write(&self.handlers);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    pub fn handler_count(&self) -> usize {
        read(&self.handlers).len()
    }

    /// Delivers `event` to every handler in order.
    ///
    /// Returns how many handlers completed without error.  The handler list
    /// is copied first, so handlers may subscribe or unsubscribe re-entrantly.
    pub fn publish(&self, event: HostEvent) -> usize {
        let handlers: Vec<_> = read(&self.handlers)
            .iter()
            .map(|(id, h)| (*id, Arc::clone(h)))
            .collect();

        let mut delivered = 0;
        for (id, handler) in handlers {
            match catch_unwind(AssertUnwindSafe(|| handler.handle(&event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => warn!("event handler {id:?} failed on {}: {e}", event.name()),
                Err(_) => error!("event handler {id:?} panicked on {}", event.name()),
            }
        }
        delivered
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
