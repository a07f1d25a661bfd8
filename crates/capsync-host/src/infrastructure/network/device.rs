//! One live device connection.
//!
//! A [`Device`] is created after a successful handshake and lives until its
//! connection ends.  It is never reused: a device that reconnects gets a new
//! `Device` (and a new `connection_id`) bound to the same device ID.
//!
//! Counters are atomics so the receive loop, send loop, and sweeps can update
//! them without sharing a lock.  The small mutable fields (state, status,
//! session stamp, quality tier, latency window) each sit behind their own
//! short-lived std mutex.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use capsync_core::domain::link::recommend_tier;
use capsync_core::protocol::messages::now_secs;
use capsync_core::{
    DeviceConnectionState, DeviceId, DeviceStatus, LinkStats, LinkSummary, Message,
    MessagePriority, QualityTier,
};
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use super::outbound_queue::{EnqueueError, OutboundQueue};
use crate::application::adaptive_load::QueueDepth;
use crate::application::orchestrate_session::DeviceContext;
use crate::sync::lock;

/// Read-only copy of a device's state, as returned by the registry snapshot.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceSnapshot {
    pub device_id: DeviceId,
    pub connection_id: Uuid,
    pub address: SocketAddr,
    pub device_name: Option<String>,
    pub capabilities: Vec<String>,
    pub state: DeviceConnectionState,
    pub connected_at: f64,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub consecutive_errors: u32,
    pub total_errors: u64,
    pub heartbeat_age_secs: f64,
    pub status: DeviceStatus,
    pub session_id: Option<String>,
    pub recording: bool,
    pub quality: QualityTier,
    pub link: LinkSummary,
    pub error_rate: f64,
    pub queue_depth: usize,
    pub queue_capacity: usize,
}

pub struct Device {
    id: DeviceId,
    connection_id: Uuid,
    address: SocketAddr,
    device_name: Option<String>,
    capabilities: Vec<String>,
    connected_at: f64,

    state: Mutex<DeviceConnectionState>,
    queue: OutboundQueue,

    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    consecutive_errors: AtomicU32,
    total_errors: AtomicU64,

    last_heartbeat: Mutex<Instant>,
    status: Mutex<DeviceStatus>,
    session_id: Mutex<Option<String>>,
    quality: Mutex<QualityTier>,
    link: Mutex<LinkStats>,
    last_preview: Mutex<Option<std::time::Instant>>,

    closed: watch::Sender<bool>,
    disconnect_reported: AtomicBool,
}

impl Device {
    pub fn new(
        id: impl Into<DeviceId>,
        address: SocketAddr,
        device_name: Option<String>,
        capabilities: Vec<String>,
        queue_capacity: usize,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        Self {
            id: id.into(),
            connection_id: Uuid::new_v4(),
            address,
            device_name,
            capabilities,
            connected_at: now_secs(),
            state: Mutex::new(DeviceConnectionState::Connecting),
            queue: OutboundQueue::new(queue_capacity),
            messages_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            consecutive_errors: AtomicU32::new(0),
            total_errors: AtomicU64::new(0),
            last_heartbeat: Mutex::new(Instant::now()),
            status: Mutex::new(DeviceStatus::default()),
            session_id: Mutex::new(None),
            quality: Mutex::new(QualityTier::High),
            link: Mutex::new(LinkStats::new()),
            last_preview: Mutex::new(None),
            closed,
            disconnect_reported: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn address(&self) -> SocketAddr {
        self.address
    }

    pub fn capabilities(&self) -> &[String] {
        &self.capabilities
    }

    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.iter().any(|c| c == capability)
    }

    pub fn state(&self) -> DeviceConnectionState {
        *lock(&self.state)
    }

    /// Moves to `next` if the state machine allows it.
    pub fn transition(&self, next: DeviceConnectionState) -> bool {
        let mut state = lock(&self.state);
        if state.can_transition_to(next) {
            debug!("device {}: {} -> {next}", self.id, *state);
            *state = next;
            true
        } else {
            false
        }
    }

    // ── Outbound ──────────────────────────────────────────────────────────────

    pub fn enqueue(&self, message: Message, priority: MessagePriority) -> Result<(), EnqueueError> {
        self.queue.push(message, priority)
    }

    /// Next message for the send loop; `None` once the device is closed.
    pub async fn next_outbound(&self) -> Option<Message> {
        self.queue.pop().await
    }

    pub fn queue_depth(&self) -> QueueDepth {
        QueueDepth::new(
            format!("outbound:{}", self.id),
            self.queue.len(),
            self.queue.capacity(),
        )
    }

    // ── Counters ──────────────────────────────────────────────────────────────

    /// Accounts for one inbound message.  Any inbound traffic proves the
    /// device is alive, so this resets the heartbeat clock and the
    /// consecutive-error count.
    pub fn record_received(&self, bytes: usize, sent_at: f64) {
        self.messages_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
        self.consecutive_errors.store(0, Ordering::Relaxed);
        *lock(&self.last_heartbeat) = Instant::now();
        if sent_at > 0.0 {
            lock(&self.link).record((now_secs() - sent_at) * 1000.0);
        }
    }

    pub fn record_sent(&self, bytes: usize) {
        self.messages_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// Counts one send/receive failure; returns the consecutive count.
    pub fn record_error(&self) -> u32 {
        self.total_errors.fetch_add(1, Ordering::Relaxed);
        self.consecutive_errors.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn heartbeat_age(&self) -> Duration {
        lock(&self.last_heartbeat).elapsed()
    }

    /// Failures as a fraction of all traffic on this connection.
    pub fn error_rate(&self) -> f64 {
        let errors = self.total_errors.load(Ordering::Relaxed);
        let traffic = self.messages_sent.load(Ordering::Relaxed)
            + self.messages_received.load(Ordering::Relaxed)
            + errors;
        if traffic == 0 {
            0.0
        } else {
            errors as f64 / traffic as f64
        }
    }

    pub fn link_summary(&self) -> LinkSummary {
        lock(&self.link).summary()
    }

    /// Tier this link can sustain, ignoring host load.
    pub fn link_tier(&self) -> QualityTier {
        recommend_tier(self.error_rate(), self.link_summary().avg_ms)
    }

    // ── Advisory fields ───────────────────────────────────────────────────────

    pub fn quality(&self) -> QualityTier {
        *lock(&self.quality)
    }

    /// Returns `true` if the tier changed.
    pub fn set_quality(&self, tier: QualityTier) -> bool {
        let mut quality = lock(&self.quality);
        let changed = *quality != tier;
        *quality = tier;
        changed
    }

    pub fn session_id(&self) -> Option<String> {
        lock(&self.session_id).clone()
    }

    pub fn is_recording(&self) -> bool {
        lock(&self.session_id).is_some()
    }

    pub fn set_session(&self, session_id: Option<String>) {
        *lock(&self.session_id) = session_id;
    }

    pub fn status(&self) -> DeviceStatus {
        lock(&self.status).clone()
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Stops both loops: the send loop sees a closed queue, the receive loop
    /// sees the closed signal.  Idempotent.
    pub fn close(&self) {
        self.queue.close();
        self.closed.send_replace(true);
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn closed_signal(&self) -> watch::Receiver<bool> {
        self.closed.subscribe()
    }

    /// Returns `true` exactly once, for whoever reports the disconnect first.
    pub(crate) fn claim_disconnect(&self) -> bool {
        !self.disconnect_reported.swap(true, Ordering::AcqRel)
    }

    pub fn snapshot(&self) -> DeviceSnapshot {
        DeviceSnapshot {
            device_id: self.id.clone(),
            connection_id: self.connection_id,
            address: self.address,
            device_name: self.device_name.clone(),
            capabilities: self.capabilities.clone(),
            state: self.state(),
            connected_at: self.connected_at,
            messages_sent: self.messages_sent.load(Ordering::Relaxed),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            consecutive_errors: self.consecutive_errors.load(Ordering::Relaxed),
            total_errors: self.total_errors.load(Ordering::Relaxed),
            heartbeat_age_secs: self.heartbeat_age().as_secs_f64(),
            status: self.status(),
            session_id: self.session_id(),
            recording: self.is_recording(),
            quality: self.quality(),
            link: self.link_summary(),
            error_rate: self.error_rate(),
            queue_depth: self.queue.len(),
            queue_capacity: self.queue.capacity(),
        }
    }
}

impl DeviceContext for Device {
    fn device_id(&self) -> &str {
        &self.id
    }

    fn apply_status(&self, report: &DeviceStatus) -> DeviceStatus {
        let mut status = lock(&self.status);
        status.merge(report);
        status.clone()
    }

    /// Spaces preview frames at least `1 / target_fps` apart for the
    /// current quality tier.
    fn admit_preview(&self, now: std::time::Instant) -> bool {
        let fps = self.quality().target_fps().max(1);
        let min_gap = Duration::from_secs_f64(1.0 / f64::from(fps));
        let mut last = lock(&self.last_preview);
        match *last {
            Some(previous) if now.saturating_duration_since(previous) < min_gap => false,
            _ => {
                *last = Some(now);
                true
            }
        }
    }
}

impl std::fmt::Debug for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Device")
            .field("id", &self.id)
            .field("connection_id", &self.connection_id)
            .field("address", &self.address)
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::Map;

    fn device() -> Device {
        Device::new(
            "cam-1",
            "127.0.0.1:5000".parse().unwrap(),
            None,
            vec!["rgb".to_string()],
            8,
        )
    }

    #[test]
    fn test_new_device_starts_connecting() {
        let d = device();
        assert_eq!(d.state(), DeviceConnectionState::Connecting);
        assert!(d.has_capability("rgb"));
        assert!(!d.has_capability("thermal"));
    }

    #[test]
    fn test_illegal_transition_is_refused() {
        // Arrange
        let d = device();

        // Act / Assert
        assert!(!d.transition(DeviceConnectionState::Reconnecting));
        assert!(d.transition(DeviceConnectionState::Connected));
        assert!(d.transition(DeviceConnectionState::Disconnected));
        assert!(!d.transition(DeviceConnectionState::Connected));
    }

    #[test]
    fn test_inbound_traffic_resets_consecutive_errors() {
        let d = device();
        d.record_error();
        assert_eq!(d.record_error(), 2);

        d.record_received(40, 0.0);

        let snap = d.snapshot();
        assert_eq!(snap.consecutive_errors, 0);
        assert_eq!(snap.total_errors, 2);
        assert_eq!(snap.bytes_received, 40);
    }

    #[test]
    fn test_error_rate_counts_errors_against_traffic() {
        let d = device();
        for _ in 0..3 {
            d.record_sent(10);
        }
        d.record_error();
        assert_eq!(d.error_rate(), 0.25);
        assert_eq!(d.link_tier(), QualityTier::Low);
    }

    #[test]
    fn test_session_stamp_marks_recording() {
        let d = device();
        d.set_session(Some("s1".to_string()));
        assert!(d.snapshot().recording);
        d.set_session(None);
        assert!(!d.is_recording());
    }

    #[test]
    fn test_apply_status_merges_fields() {
        let d = device();
        d.apply_status(&DeviceStatus {
            battery: Some(50.0),
            ..DeviceStatus::default()
        });
        let merged = d.apply_status(&DeviceStatus {
            temperature: Some(31.0),
            ..DeviceStatus::default()
        });
        assert_eq!(merged.battery, Some(50.0));
        assert_eq!(merged.temperature, Some(31.0));
    }

    #[test]
    fn test_close_is_idempotent_and_refuses_new_messages() {
        let d = device();
        d.close();
        d.close();
        assert!(d.is_closed());
        assert_eq!(
            d.enqueue(Message::new("heartbeat", Map::new()), MessagePriority::High),
            Err(EnqueueError::Closed)
        );
    }

    #[test]
    fn test_disconnect_is_claimed_once() {
        let d = device();
        assert!(d.claim_disconnect());
        assert!(!d.claim_disconnect());
    }

    fn admitted_in_one_second(d: &Device) -> usize {
        // 30 frames, one every 33.334 ms
        let start = std::time::Instant::now();
        (0..30u32)
            .filter(|k| d.admit_preview(start + Duration::from_micros(33_334) * *k))
            .count()
    }

    #[test]
    fn test_low_tier_device_is_limited_to_five_previews_per_second() {
        // Arrange
        let d = device();
        d.set_quality(QualityTier::Low);

        // Act
        let admitted = admitted_in_one_second(&d);

        // Assert
        assert_eq!(admitted, 5);
    }

    #[test]
    fn test_high_tier_device_admits_a_thirty_fps_stream() {
        let d = device();
        assert_eq!(admitted_in_one_second(&d), 30);
    }
}
