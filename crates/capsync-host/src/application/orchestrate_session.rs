//! SessionOrchestrator: recording sessions, sync signals, and inbound dispatch.
//!
//! # How a session runs (for beginners)
//!
//! 1. The operator calls [`SessionOrchestrator::start_session`].  The
//!    orchestrator enqueues a `start_record` command for every connected
//!    device.  Devices whose queue accepted the command become the session's
//!    participants.  If nobody accepted it, no session is created.
//! 2. While the session runs, every `sensor_data` message is turned into a
//!    [`SensorSample`], counted against the session, and published.  Files
//!    streamed back by devices are reassembled, verified, and recorded under
//!    the session.
//! 3. [`SessionOrchestrator::stop_session`] enqueues `stop_record`, stamps the
//!    end time, and moves the session into the bounded history.
//!
//! The orchestrator never touches sockets.  It talks to devices through the
//! [`DeviceDirectory`] trait (implemented by the connection registry) and
//! receives their messages through [`InboundHandler`], which
//! [`SessionState`] implements.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use capsync_core::protocol::messages::{
    now_secs, BeepSync, FileEnd, FlashSync, StartRecord, StopRecord,
};
use capsync_core::{
    DeviceId, DeviceMessage, DeviceStatus, Message, MessagePriority, RecordingOptions,
    SensorSample, Session, SessionHistory,
};
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::application::events::{EventBus, HostEvent};
use crate::application::file_transfer::FileReassembler;
use crate::sync::{lock, read, write};

// ── Error type ────────────────────────────────────────────────────────────────

/// Session-logic failures returned to the caller.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {0:?} is already active")]
    AlreadyActive(String),

    #[error("no session is active")]
    NoActiveSession,

    #[error("no connected device accepted start_record")]
    NoReachableDevices,

    #[error("invalid session id {0:?}")]
    InvalidSessionId(String),
}

// ── Seams ─────────────────────────────────────────────────────────────────────

/// The orchestrator's view of the connection registry.
///
/// All methods only enqueue; none waits for the network.
#[async_trait]
pub trait DeviceDirectory: Send + Sync {
    /// IDs of devices currently in the `Connected` state.
    async fn connected_devices(&self) -> Vec<DeviceId>;

    /// Enqueues `message` for one device.  `false` if the device is unknown
    /// or its queue refused the message.
    async fn send(&self, device_id: &str, message: Message, priority: MessagePriority) -> bool;

    /// Enqueues `message` for every connected device.  Returns how many accepted it.
    async fn broadcast(&self, message: Message, priority: MessagePriority) -> usize;

    /// Stamps (or clears) a device's session ID and recording flag.
    async fn set_session(&self, device_id: &str, session_id: Option<String>);
}

/// The parts of a live device the inbound dispatcher may touch.
pub trait DeviceContext: Send + Sync {
    fn device_id(&self) -> &str;

    /// Merges a `status` report and returns the resulting health fields.
    fn apply_status(&self, report: &DeviceStatus) -> DeviceStatus;

    /// Per-device preview rate limit.  `true` if a frame arriving at `now`
    /// fits the device's current frame budget.
    fn admit_preview(&self, now: Instant) -> bool;
}

/// Receiver of every message that arrives on a connected device.
#[async_trait]
pub trait InboundHandler: Send + Sync {
    /// `sent_at` is the sender's `timestamp` field.
    async fn handle_inbound(&self, device: &dyn DeviceContext, message: DeviceMessage, sent_at: f64);

    /// Called exactly once after a device leaves the registry.
    async fn device_disconnected(&self, device_id: &str);
}

/// Hash check applied to every reassembled file that declared a hash.
pub trait FileVerifier: Send + Sync {
    fn verify(&self, data: &[u8], declared_hash: &str) -> bool;
}

/// Decides whether the next preview frame is forwarded.
pub trait FrameGate: Send + Sync {
    fn admit_preview_frame(&self) -> bool;
}

// ── Shared state ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SessionConfig {
    pub history_capacity: usize,
    /// Silence after which a device's sensor stream is flagged stale.
    pub stale_after: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            history_capacity: 100,
            stale_after: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct SensorClock {
    last_sample: Instant,
    stale: bool,
}

/// Active session slot, history, open file transfers, and sensor clocks.
///
/// Shared between the orchestrator (operator-facing calls) and the
/// connection registry (inbound dispatch).
pub struct SessionState {
    active: tokio::sync::Mutex<Option<Session>>,
    history: Mutex<SessionHistory>,
    transfers: Mutex<FileReassembler>,
    sensor_clocks: Mutex<HashMap<DeviceId, SensorClock>>,
    events: Arc<EventBus>,
    verifier: Arc<dyn FileVerifier>,
    frame_gate: RwLock<Option<Arc<dyn FrameGate>>>,
    stale_after: Duration,
}

impl SessionState {
    pub fn new(config: SessionConfig, events: Arc<EventBus>, verifier: Arc<dyn FileVerifier>) -> Self {
        Self {
            active: tokio::sync::Mutex::new(None),
            history: Mutex::new(SessionHistory::new(config.history_capacity)),
            transfers: Mutex::new(FileReassembler::new()),
            sensor_clocks: Mutex::new(HashMap::new()),
            events,
            verifier,
            frame_gate: RwLock::new(None),
            stale_after: config.stale_after,
        }
    }

    /// Installs the gate consulted before forwarding preview frames.
    pub fn set_frame_gate(&self, gate: Arc<dyn FrameGate>) {
        *write(&self.frame_gate) = Some(gate);
    }

    pub async fn active_session(&self) -> Option<Session> {
        self.active.lock().await.clone()
    }

    /// Closed sessions, oldest first.
    pub fn session_history(&self) -> Vec<Session> {
        lock(&self.history).to_vec()
    }

    /// Flags devices whose last sensor sample is older than the staleness
    /// window.  Each quiet period is reported once; the next sample clears it.
    pub fn sweep_stale(&self, now: Instant) -> Vec<DeviceId> {
        let newly_stale: Vec<(DeviceId, Duration)> = {
            let mut clocks = lock(&self.sensor_clocks);
            clocks
                .iter_mut()
                .filter_map(|(id, clock)| {
                    let silent_for = now.saturating_duration_since(clock.last_sample);
                    if !clock.stale && silent_for > self.stale_after {
                        clock.stale = true;
                        Some((id.clone(), silent_for))
                    } else {
                        None
                    }
                })
                .collect()
        };

        let mut flagged = Vec::with_capacity(newly_stale.len());
        for (device_id, silent_for) in newly_stale {
            warn!(
                "device {device_id}: no sensor data for {:.1}s",
                silent_for.as_secs_f64()
            );
            self.events.publish(HostEvent::DataStale {
                device_id: device_id.clone(),
                silent_for,
            });
            flagged.push(device_id);
        }
        flagged
    }

    fn mark_sensor_activity(&self, device_id: &str) {
        let mut clocks = lock(&self.sensor_clocks);
        let clock = clocks.entry(device_id.to_string()).or_insert(SensorClock {
            last_sample: Instant::now(),
            stale: false,
        });
        if clock.stale {
            info!("device {device_id}: sensor stream resumed");
        }
        clock.last_sample = Instant::now();
        clock.stale = false;
    }

    async fn finish_transfer(&self, device_id: &str, end: &FileEnd) {
        let result = lock(&self.transfers).finish(device_id, end);
        let file = match result {
            Ok(file) => file,
            Err(e) => {
                let name = end.name.clone().unwrap_or_default();
                warn!("device {device_id}: discarding file {name:?}: {e}");
                self.events.publish(HostEvent::FileRejected {
                    device_id: device_id.to_string(),
                    name,
                    reason: e.to_string(),
                });
                return;
            }
        };

        if let Some(hash) = file.declared_hash.as_deref() {
            if !self.verifier.verify(&file.data, hash) {
                warn!("device {device_id}: file {} failed integrity check", file.name);
                self.events.publish(HostEvent::FileRejected {
                    device_id: device_id.to_string(),
                    name: file.name,
                    reason: "hash mismatch".to_string(),
                });
                return;
            }
        }

        let session_id = {
            let mut active = self.active.lock().await;
            active.as_mut().map(|session| {
                session.record_file(device_id, file.name.clone());
                session.id.clone()
            })
        };
        info!(
            "device {device_id}: received file {} ({} bytes)",
            file.name,
            file.data.len()
        );
        self.events.publish(HostEvent::FileReceived {
            device_id: device_id.to_string(),
            name: file.name,
            session_id,
            data: Arc::new(file.data),
        });
    }
}

#[async_trait]
impl InboundHandler for SessionState {
    async fn handle_inbound(&self, device: &dyn DeviceContext, message: DeviceMessage, sent_at: f64) {
        let device_id = device.device_id().to_string();

        match message {
            DeviceMessage::Status(report) => {
                let status = device.apply_status(&report);
                self.events
                    .publish(HostEvent::StatusUpdated { device_id, status });
            }

            DeviceMessage::SensorData(reading) => {
                self.mark_sensor_activity(&device_id);
                let session_id = {
                    let mut active = self.active.lock().await;
                    active.as_mut().map(|session| {
                        session.record_sample();
                        session.id.clone()
                    })
                };
                // Devices that omit `timestamp` are stamped on arrival.
                let timestamp = if sent_at > 0.0 { sent_at } else { now_secs() };
                self.events.publish(HostEvent::Sample(SensorSample {
                    device_id,
                    session_id,
                    timestamp,
                    values: reading.values,
                }));
            }

            DeviceMessage::PreviewFrame(frame) => {
                if !device.admit_preview(Instant::now()) {
                    debug!("device {device_id}: preview frame over its tier rate");
                    return;
                }
                let gate = read(&self.frame_gate).clone();
                let admitted = gate.map_or(true, |g| g.admit_preview_frame());
                if admitted {
                    self.events
                        .publish(HostEvent::PreviewFrame { device_id, frame });
                } else {
                    debug!("device {device_id}: preview frame dropped under load");
                }
            }

            DeviceMessage::FileInfo(info) => {
                let result = lock(&self.transfers).open(&device_id, &info);
                if let Err(e) = result {
                    warn!("device {device_id}: refusing file {:?}: {e}", info.name);
                    self.events.publish(HostEvent::FileRejected {
                        device_id,
                        name: info.name,
                        reason: e.to_string(),
                    });
                }
            }

            DeviceMessage::FileChunk(chunk) => {
                let result = lock(&self.transfers).add_chunk(&device_id, &chunk);
                if let Err(e) = result {
                    warn!("device {device_id}: rejected file chunk {}: {e}", chunk.seq);
                }
            }

            DeviceMessage::FileEnd(end) => {
                self.finish_transfer(&device_id, &end).await;
            }

            DeviceMessage::Ack(ack) => {
                if ack.is_error() {
                    warn!(
                        "device {device_id}: command {} failed: {}",
                        ack.cmd,
                        ack.message.as_deref().unwrap_or("no detail")
                    );
                } else {
                    debug!("device {device_id}: command {} acknowledged", ack.cmd);
                }
                self.events.publish(HostEvent::CommandAck { device_id, ack });
            }

            DeviceMessage::Heartbeat | DeviceMessage::HeartbeatResponse => {}

            DeviceMessage::Unrecognized(message) => {
                debug!("device {device_id}: forwarding unrecognized `{}`", message.kind);
                self.events.publish(HostEvent::Unrouted { device_id, message });
            }

            // The registry decodes with `decode_inbound`, which leaves these
            // raw; only direct callers reach this arm with a typed command.
            other => {
                debug!("device {device_id}: unexpected `{}` from device", other.kind());
                let message = other.to_message().with_timestamp(sent_at);
                self.events.publish(HostEvent::Unrouted { device_id, message });
            }
        }
    }

    async fn device_disconnected(&self, device_id: &str) {
        let dropped = lock(&self.transfers).discard_device(device_id);
        if dropped > 0 {
            warn!("device {device_id}: discarded {dropped} incomplete file transfer(s)");
        }
        lock(&self.sensor_clocks).remove(device_id);
    }
}

// ── Use case ──────────────────────────────────────────────────────────────────

/// A shared timing marker broadcast to every device.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SyncSignal {
    Flash { duration_ms: u32 },
    Beep {
        frequency_hz: u32,
        duration_ms: u32,
        volume: f64,
    },
}

impl SyncSignal {
    fn into_message(self, sync_id: String) -> DeviceMessage {
        match self {
            Self::Flash { duration_ms } => DeviceMessage::FlashSync(FlashSync {
                duration_ms,
                sync_id: Some(sync_id),
            }),
            Self::Beep {
                frequency_hz,
                duration_ms,
                volume,
            } => DeviceMessage::BeepSync(BeepSync {
                frequency_hz,
                duration_ms,
                volume: volume.clamp(0.0, 1.0),
                sync_id: Some(sync_id),
            }),
        }
    }
}

/// Result of a sync broadcast.  Delivery is not confirmed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReceipt {
    pub sync_id: String,
    pub devices: usize,
}

/// Operator-facing session operations.
pub struct SessionOrchestrator {
    state: Arc<SessionState>,
    directory: Arc<dyn DeviceDirectory>,
}

impl SessionOrchestrator {
    pub fn new(state: Arc<SessionState>, directory: Arc<dyn DeviceDirectory>) -> Self {
        Self { state, directory }
    }

    pub fn state(&self) -> &Arc<SessionState> {
        &self.state
    }

    /// Starts a recording on every reachable device.
    ///
    /// # Errors
    ///
    /// - [`SessionError::InvalidSessionId`] for an empty or non-printable ID.
    /// - [`SessionError::AlreadyActive`] if a session is running.
    /// - [`SessionError::NoReachableDevices`] if no device accepted `start_record`.
    pub async fn start_session(
        &self,
        session_id: &str,
        options: RecordingOptions,
    ) -> Result<Session, SessionError> {
        validate_session_id(session_id)?;

        // Held for the whole start so two concurrent starts cannot both win.
        let mut active = self.state.active.lock().await;
        if let Some(current) = active.as_ref() {
            return Err(SessionError::AlreadyActive(current.id.clone()));
        }

        let command = DeviceMessage::StartRecord(StartRecord {
            session_id: session_id.to_string(),
            options,
        })
        .to_message();

        let mut reached = BTreeSet::new();
        for device_id in self.directory.connected_devices().await {
            if self
                .directory
                .send(&device_id, command.clone(), MessagePriority::Critical)
                .await
            {
                reached.insert(device_id);
            } else {
                warn!("session {session_id}: device {device_id} did not accept start_record");
            }
        }
        if reached.is_empty() {
            warn!("session {session_id}: no reachable devices, not starting");
            return Err(SessionError::NoReachableDevices);
        }

        for device_id in &reached {
            self.directory
                .set_session(device_id, Some(session_id.to_string()))
                .await;
        }

        let session = Session::new(session_id, options, reached, now_secs());
        *active = Some(session.clone());
        drop(active);

        info!(
            "session {session_id} started with {} device(s)",
            session.devices.len()
        );
        self.state
            .events
            .publish(HostEvent::SessionStarted(session.clone()));
        Ok(session)
    }

    /// Stops the active session and returns it, closed.
    pub async fn stop_session(&self) -> Result<Session, SessionError> {
        let mut session = self
            .state
            .active
            .lock()
            .await
            .take()
            .ok_or(SessionError::NoActiveSession)?;

        let command = DeviceMessage::StopRecord(StopRecord {
            session_id: Some(session.id.clone()),
        })
        .to_message();
        let notified = self
            .directory
            .broadcast(command, MessagePriority::Critical)
            .await;

        session.close(now_secs());
        for device_id in self.directory.connected_devices().await {
            self.directory.set_session(&device_id, None).await;
        }
        lock(&self.state.history).push(session.clone());

        info!(
            "session {} stopped after {:.1}s ({} samples, {} files, {notified} device(s) notified)",
            session.id,
            session.duration_secs(now_secs()),
            session.sample_count,
            session.file_count()
        );
        self.state
            .events
            .publish(HostEvent::SessionStopped(session.clone()));
        Ok(session)
    }

    /// Broadcasts a sync marker.  Fire-and-forget: returns as soon as the
    /// message is queued for every device.
    pub async fn send_sync(&self, signal: SyncSignal) -> SyncReceipt {
        let sync_id = Uuid::new_v4().to_string();
        let message = signal.into_message(sync_id.clone());
        let kind = message.kind().to_string();
        let devices = self
            .directory
            .broadcast(message.to_message(), MessagePriority::Critical)
            .await;

        debug!("{kind} {sync_id} queued for {devices} device(s)");
        self.state.events.publish(HostEvent::SyncBroadcast {
            kind,
            sync_id: sync_id.clone(),
            devices,
        });
        SyncReceipt { sync_id, devices }
    }

    pub async fn active_session(&self) -> Option<Session> {
        self.state.active_session().await
    }

    pub fn session_history(&self) -> Vec<Session> {
        self.state.session_history()
    }

    pub fn sweep_stale(&self, now: Instant) -> Vec<DeviceId> {
        self.state.sweep_stale(now)
    }
}

fn validate_session_id(session_id: &str) -> Result<(), SessionError> {
    let valid = !session_id.trim().is_empty()
        && session_id.len() <= 128
        && session_id.chars().all(|c| !c.is_control());
    if valid {
        Ok(())
    } else {
        Err(SessionError::InvalidSessionId(session_id.to_string()))
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
