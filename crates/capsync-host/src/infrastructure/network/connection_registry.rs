//! ConnectionRegistry: the authoritative device-ID → Device map.
//!
//! # Connection lifecycle (for beginners)
//!
//! 1. The accept loop ([`ConnectionRegistry::serve`]) accepts a TCP socket,
//!    asks the [`SecureChannel`] to wrap it, and hands it to
//!    [`ConnectionRegistry::register`].
//! 2. `register` waits (bounded by the handshake timeout) for a `hello` or
//!    `handshake` message.  A bad or missing handshake drops the connection
//!    and no [`Device`] is ever created.
//! 3. A good handshake creates a `Device`, queues `handshake_ack` at critical
//!    priority, inserts the device into the map, and spawns two loops:
//!    - the **receive loop** reads frames (1 s timeout per read so it notices
//!      when the device is closed) and dispatches them;
//!    - the **send loop** drains the device's priority queue onto the socket.
//! 4. Whatever ends the connection (peer close, protocol violation, too many
//!    errors, heartbeat timeout, supersession, shutdown) goes through
//!    `remove_connection`, which publishes `DeviceDisconnected` exactly once.
//!
//! The map lock is only held for single insert/remove/lookup steps.  Every
//! network write happens in the device's own send loop, so a slow device
//! never blocks registry operations for the others.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use capsync_core::protocol::messages::{kinds, Handshake, HandshakeAck, PROTOCOL_VERSION};
use capsync_core::{DeviceConnectionState, DeviceId, DeviceMessage, Message, MessagePriority, QualityTier};
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{ReadHalf, WriteHalf};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, warn};

use super::channel::{split, BoxedStream, ChannelError, FrameReader, FrameWriter, ReadOutcome};
use super::device::{Device, DeviceSnapshot};
use super::outbound_queue::EnqueueError;
use super::security::{SecureChannel, TokenValidator};
use crate::application::adaptive_load::{QualityAdvisor, QueueDepth, QueueSource};
use crate::application::events::{DisconnectReason, EventBus, HostEvent};
use crate::application::orchestrate_session::{DeviceDirectory, InboundHandler};
use crate::infrastructure::shutdown::ShutdownSignal;
use crate::sync::lock;

type Reader = FrameReader<ReadHalf<BoxedStream>>;
type Writer = FrameWriter<WriteHalf<BoxedStream>>;

/// Upper bound on writing a rejection ack or shutting a writer down.
const FAREWELL_TIMEOUT: Duration = Duration::from_millis(500);

// ── Configuration ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq)]
pub struct RegistryConfig {
    pub max_connections: usize,
    pub handshake_timeout: Duration,
    /// Per-read timeout in the receive loop.
    pub receive_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub heartbeat_timeout: Duration,
    /// Consecutive send/receive failures that force a disconnect.
    pub error_threshold: u32,
    pub queue_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            handshake_timeout: Duration::from_secs(10),
            receive_timeout: Duration::from_secs(1),
            heartbeat_interval: Duration::from_secs(5),
            heartbeat_timeout: Duration::from_secs(15),
            error_threshold: 5,
            queue_capacity: 1000,
        }
    }
}

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    #[error("outbound queue for {0:?} is full")]
    QueueFull(String),

    #[error("connection limit of {max} devices reached")]
    CapacityReached { max: usize },

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

/// Why a connection never became a Device.
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("no handshake within {0:?}")]
    Timeout(Duration),

    #[error("connection closed before handshake")]
    Closed,

    #[error("expected hello/handshake, got {0:?}")]
    UnexpectedKind(String),

    #[error("handshake has no device_id")]
    MissingDeviceId,

    #[error("handshake capabilities must be an array of strings")]
    InvalidCapabilities,

    #[error("handshake fields are malformed")]
    Malformed,

    #[error("handshake token rejected")]
    Unauthorized,

    #[error("connection limit of {max} devices reached")]
    CapacityReached { max: usize },

    #[error("host is shutting down")]
    ShuttingDown,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}

impl HandshakeError {
    /// Whether the peer is still there to be told why it was refused.
    fn peer_listening(&self) -> bool {
        !matches!(self, Self::Timeout(_) | Self::Closed | Self::Channel(_))
    }
}

/// Aggregate traffic figures across all live devices.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct NetworkStats {
    pub devices: usize,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    /// Mean of the per-device average latencies, over devices with samples.
    pub mean_latency_ms: f64,
}

// ── Registry ──────────────────────────────────────────────────────────────────

pub struct ConnectionRegistry {
    config: RegistryConfig,
    devices: RwLock<HashMap<DeviceId, Arc<Device>>>,
    events: Arc<EventBus>,
    inbound: Arc<dyn InboundHandler>,
    tokens: Option<Arc<dyn TokenValidator>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closing: AtomicBool,
}

impl ConnectionRegistry {
    pub fn new(
        config: RegistryConfig,
        events: Arc<EventBus>,
        inbound: Arc<dyn InboundHandler>,
        tokens: Option<Arc<dyn TokenValidator>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            config,
            devices: RwLock::new(HashMap::new()),
            events,
            inbound,
            tokens,
            tasks: Mutex::new(Vec::new()),
            closing: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub async fn device_count(&self) -> usize {
        self.devices.read().await.len()
    }

    pub async fn get(&self, device_id: &str) -> Option<Arc<Device>> {
        self.devices.read().await.get(device_id).cloned()
    }

    async fn live_devices(&self) -> Vec<Arc<Device>> {
        self.devices.read().await.values().cloned().collect()
    }

    fn track(&self, handle: JoinHandle<()>) {
        let mut tasks = lock(&self.tasks);
        tasks.retain(|h| !h.is_finished());
        tasks.push(handle);
    }

    // ── Accept loop ───────────────────────────────────────────────────────────

    /// Accepts connections until `shutdown` fires, then drops the listener.
    pub async fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        secure: Arc<dyn SecureChannel>,
        shutdown: ShutdownSignal,
    ) {
        info!(
            "accepting device connections on {} (encrypted: {})",
            listener
                .local_addr()
                .map(|a| a.to_string())
                .unwrap_or_else(|_| "?".to_string()),
            secure.is_encrypted()
        );

        loop {
            let accepted = tokio::select! {
                _ = shutdown.wait() => break,
                accepted = listener.accept() => accepted,
            };

            let (tcp, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!("accept failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
            };

            let live = self.device_count().await;
            if live >= self.config.max_connections {
                warn!(
                    "refusing {peer}: {live} devices connected (limit {})",
                    self.config.max_connections
                );
                drop(tcp);
                continue;
            }
            if let Err(e) = tcp.set_nodelay(true) {
                debug!("{peer}: could not set TCP_NODELAY: {e}");
            }

            let registry = Arc::clone(self);
            let secure = Arc::clone(&secure);
            self.track(tokio::spawn(async move {
                let stream = match secure.wrap(tcp).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!("{peer}: secure channel setup failed: {e}");
                        return;
                    }
                };
                if let Err(e) = registry.register(stream, peer).await {
                    warn!("{peer}: handshake failed: {e}");
                }
            }));
        }

        info!("accept loop stopped");
    }

    // ── Registration ──────────────────────────────────────────────────────────

    /// Runs the handshake on `stream` and, on success, registers a Device and
    /// starts its loops.
    ///
    /// # Errors
    ///
    /// Any [`HandshakeError`].  The connection is closed and no Device exists.
    pub async fn register(
        self: &Arc<Self>,
        stream: BoxedStream,
        peer: SocketAddr,
    ) -> Result<Arc<Device>, HandshakeError> {
        let (mut reader, mut writer) = split(stream);

        let handshake = match self.read_handshake(&mut reader).await {
            Ok(handshake) => handshake,
            Err(e) => {
                self.refuse(&mut writer, &e).await;
                return Err(e);
            }
        };

        let device = Arc::new(Device::new(
            handshake.device_id.clone(),
            peer,
            handshake.device_name.clone(),
            handshake.capabilities.clone(),
            self.config.queue_capacity,
        ));
        let ack = DeviceMessage::HandshakeAck(HandshakeAck {
            protocol_version: PROTOCOL_VERSION,
            compatible: true,
            message: None,
        })
        .to_message();
        if let Err(e) = device.enqueue(ack, MessagePriority::Critical) {
            error!("device {}: could not queue handshake_ack: {e}", device.id());
        }

        let superseded = match self.insert(&device).await {
            Ok(previous) => previous,
            Err(e) => {
                self.refuse(&mut writer, &e).await;
                return Err(e);
            }
        };
        if let Some(old) = superseded {
            info!(
                "device {}: new connection from {peer} supersedes {}",
                old.id(),
                old.address()
            );
            self.remove_connection(&old, DisconnectReason::Superseded).await;
        }

        let receive = tokio::spawn(Arc::clone(self).receive_loop(Arc::clone(&device), reader));
        let send = tokio::spawn(Arc::clone(self).send_loop(Arc::clone(&device), writer));
        self.track(receive);
        self.track(send);

        info!(
            "device {} connected from {peer} (capabilities: {:?})",
            device.id(),
            device.capabilities()
        );
        self.events.publish(HostEvent::DeviceConnected {
            device_id: device.id().to_string(),
            capabilities: device.capabilities().to_vec(),
        });
        Ok(device)
    }

    async fn read_handshake(&self, reader: &mut Reader) -> Result<Handshake, HandshakeError> {
        let wait = self.config.handshake_timeout;
        match reader.read(wait).await? {
            ReadOutcome::Timeout => Err(HandshakeError::Timeout(wait)),
            ReadOutcome::Closed => Err(HandshakeError::Closed),
            ReadOutcome::Message(message, _) => self.validate_handshake(message),
        }
    }

    fn validate_handshake(&self, message: Message) -> Result<Handshake, HandshakeError> {
        let is_hello = message.kind == kinds::HELLO || message.kind == kinds::HANDSHAKE;
        let bad_capabilities = message
            .payload
            .get("capabilities")
            .is_some_and(|v| !is_string_array(v));

        let handshake = match DeviceMessage::decode(message) {
            DeviceMessage::Handshake(handshake) => handshake,
            _ if is_hello && bad_capabilities => return Err(HandshakeError::InvalidCapabilities),
            _ if is_hello => return Err(HandshakeError::Malformed),
            other => return Err(HandshakeError::UnexpectedKind(other.kind().to_string())),
        };

        if handshake.device_id.trim().is_empty() {
            return Err(HandshakeError::MissingDeviceId);
        }
        if let Some(validator) = &self.tokens {
            match handshake.token.as_deref() {
                Some(token) if validator.validate(token) => {}
                _ => return Err(HandshakeError::Unauthorized),
            }
        }
        Ok(handshake)
    }

    /// Best-effort `handshake_ack {compatible: false}` before closing.
    async fn refuse(&self, writer: &mut Writer, reason: &HandshakeError) {
        if reason.peer_listening() {
            let nack = DeviceMessage::HandshakeAck(HandshakeAck {
                protocol_version: PROTOCOL_VERSION,
                compatible: false,
                message: Some(reason.to_string()),
            })
            .to_message();
            let _ = timeout(FAREWELL_TIMEOUT, writer.write(&nack)).await;
        }
        let _ = timeout(FAREWELL_TIMEOUT, writer.shutdown()).await;
    }

    /// Inserts `device`, returning the live device it replaces, if any.
    async fn insert(&self, device: &Arc<Device>) -> Result<Option<Arc<Device>>, HandshakeError> {
        let mut devices = self.devices.write().await;
        if self.closing.load(Ordering::Acquire) {
            return Err(HandshakeError::ShuttingDown);
        }
        let max = self.config.max_connections;
        if !devices.contains_key(device.id()) && devices.len() >= max {
            return Err(HandshakeError::CapacityReached { max });
        }
        device.transition(DeviceConnectionState::Connected);
        let previous = devices.insert(device.id().to_string(), Arc::clone(device));
        if let Some(old) = &previous {
            old.transition(DeviceConnectionState::Reconnecting);
        }
        Ok(previous)
    }

    // ── Removal ───────────────────────────────────────────────────────────────

    /// Removes `device` (only if the map still holds this exact connection),
    /// closes it, and reports the disconnect.
    ///
    /// Returns `false` if another path already reported this device.
    async fn remove_connection(&self, device: &Arc<Device>, reason: DisconnectReason) -> bool {
        {
            let mut devices = self.devices.write().await;
            let same_connection = devices
                .get(device.id())
                .is_some_and(|live| live.connection_id() == device.connection_id());
            if same_connection {
                devices.remove(device.id());
            }
        }
        device.close();

        if !device.claim_disconnect() {
            return false;
        }

        let terminal = match reason {
            DisconnectReason::Superseded => DeviceConnectionState::Reconnecting,
            DisconnectReason::ErrorThreshold | DisconnectReason::ProtocolViolation(_) => {
                DeviceConnectionState::Error
            }
            _ => DeviceConnectionState::Disconnected,
        };
        device.transition(terminal);

        info!("device {} disconnected: {reason}", device.id());
        self.inbound.device_disconnected(device.id()).await;
        self.events.publish(HostEvent::DeviceDisconnected {
            device_id: device.id().to_string(),
            reason,
        });
        true
    }

    /// Force-disconnects one device.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownDevice`] if the ID is not live.
    pub async fn disconnect(&self, device_id: &str, reason: DisconnectReason) -> Result<(), RegistryError> {
        let device = self
            .get(device_id)
            .await
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        self.remove_connection(&device, reason).await;
        Ok(())
    }

    // ── Per-device loops ──────────────────────────────────────────────────────

    async fn receive_loop(self: Arc<Self>, device: Arc<Device>, mut reader: Reader) {
        let mut closed = device.closed_signal();
        let threshold = self.config.error_threshold;

        let reason = loop {
            if *closed.borrow_and_update() {
                break None;
            }
            let outcome = tokio::select! {
                _ = closed.changed() => continue,
                outcome = reader.read(self.config.receive_timeout) => outcome,
            };

            match outcome {
                Ok(ReadOutcome::Message(message, bytes)) => {
                    device.record_received(bytes, message.timestamp);
                    self.dispatch(&device, message).await;
                }
                Ok(ReadOutcome::Timeout) => {}
                Ok(ReadOutcome::Closed) => break Some(DisconnectReason::Closed),
                Err(e) if e.is_protocol_violation() => {
                    warn!("device {}: {e}", device.id());
                    break Some(DisconnectReason::ProtocolViolation(e.to_string()));
                }
                Err(e) => {
                    let errors = device.record_error();
                    warn!("device {}: receive error ({errors}/{threshold}): {e}", device.id());
                    if errors >= threshold {
                        break Some(DisconnectReason::ErrorThreshold);
                    }
                }
            }
        };

        if let Some(reason) = reason {
            self.remove_connection(&device, reason).await;
        }
        debug!("device {}: receive loop finished", device.id());
    }

    async fn dispatch(&self, device: &Arc<Device>, message: Message) {
        let sent_at = message.timestamp;
        match DeviceMessage::decode_inbound(message) {
            DeviceMessage::Heartbeat => {
                let reply = DeviceMessage::HeartbeatResponse.to_message();
                if let Err(e) = device.enqueue(reply, MessagePriority::High) {
                    debug!("device {}: heartbeat_response not queued: {e}", device.id());
                }
            }
            DeviceMessage::HeartbeatResponse => {}
            other => self.inbound.handle_inbound(&**device, other, sent_at).await,
        }
    }

    async fn send_loop(self: Arc<Self>, device: Arc<Device>, mut writer: Writer) {
        let mut closed = device.closed_signal();
        let threshold = self.config.error_threshold;

        while let Some(message) = device.next_outbound().await {
            let written = tokio::select! {
                _ = closed.changed() => break,
                written = writer.write(&message) => written,
            };
            match written {
                Ok(bytes) => device.record_sent(bytes),
                Err(ChannelError::Protocol(e)) => {
                    warn!("device {}: dropping unencodable {}: {e}", device.id(), message.kind);
                }
                Err(e) => {
                    let errors = device.record_error();
                    warn!("device {}: send error ({errors}/{threshold}): {e}", device.id());
                    if errors >= threshold {
                        self.remove_connection(&device, DisconnectReason::ErrorThreshold)
                            .await;
                        break;
                    }
                }
            }
        }

        let _ = timeout(FAREWELL_TIMEOUT, writer.shutdown()).await;
        debug!("device {}: send loop finished", device.id());
    }

    // ── Outbound API ──────────────────────────────────────────────────────────

    /// Enqueues `message` for one device.
    ///
    /// # Errors
    ///
    /// [`RegistryError::UnknownDevice`] if the device is not live,
    /// [`RegistryError::QueueFull`] if its queue refused the message.
    pub async fn send(
        &self,
        device_id: &str,
        message: Message,
        priority: MessagePriority,
    ) -> Result<(), RegistryError> {
        let device = self
            .get(device_id)
            .await
            .ok_or_else(|| RegistryError::UnknownDevice(device_id.to_string()))?;
        device.enqueue(message, priority).map_err(|e| match e {
            EnqueueError::Full => RegistryError::QueueFull(device_id.to_string()),
            EnqueueError::Closed => RegistryError::UnknownDevice(device_id.to_string()),
        })
    }

    /// Enqueues `message` for every connected device; returns how many accepted it.
    pub async fn broadcast(&self, message: Message, priority: MessagePriority) -> usize {
        let mut accepted = 0;
        for device in self.live_devices().await {
            if device.state() != DeviceConnectionState::Connected {
                continue;
            }
            match device.enqueue(message.clone(), priority) {
                Ok(()) => accepted += 1,
                Err(e) => warn!("device {}: broadcast of {} refused: {e}", device.id(), message.kind),
            }
        }
        accepted
    }

    // ── Sweeps and reports ────────────────────────────────────────────────────

    /// Disconnects devices silent for longer than the heartbeat timeout and
    /// sends a host heartbeat to the rest.  Returns the expired IDs.
    pub async fn sweep_heartbeats(&self) -> Vec<DeviceId> {
        let limit = self.config.heartbeat_timeout;
        let mut expired = Vec::new();

        for device in self.live_devices().await {
            let age = device.heartbeat_age();
            if age > limit {
                warn!("device {}: no traffic for {age:?} (limit {limit:?})", device.id());
                if self.remove_connection(&device, DisconnectReason::HeartbeatTimeout).await {
                    expired.push(device.id().to_string());
                }
            } else if let Err(e) = device.enqueue(DeviceMessage::Heartbeat.to_message(), MessagePriority::High) {
                debug!("device {}: heartbeat not queued: {e}", device.id());
            }
        }
        expired
    }

    /// Read-only copies of every live device, sorted by ID.
    pub async fn snapshot(&self) -> Vec<DeviceSnapshot> {
        let mut snapshots: Vec<_> = self.live_devices().await.iter().map(|d| d.snapshot()).collect();
        snapshots.sort_by(|a, b| a.device_id.cmp(&b.device_id));
        snapshots
    }

    pub async fn network_stats(&self) -> NetworkStats {
        let snapshots = self.snapshot().await;
        let mut stats = NetworkStats {
            devices: snapshots.len(),
            ..NetworkStats::default()
        };
        let mut latency_sum = 0.0;
        let mut latency_devices = 0;
        for s in &snapshots {
            stats.messages_sent += s.messages_sent;
            stats.messages_received += s.messages_received;
            stats.bytes_sent += s.bytes_sent;
            stats.bytes_received += s.bytes_received;
            if s.link.samples > 0 {
                latency_sum += s.link.avg_ms;
                latency_devices += 1;
            }
        }
        if latency_devices > 0 {
            stats.mean_latency_ms = latency_sum / latency_devices as f64;
        }
        stats
    }

    // ── Shutdown ──────────────────────────────────────────────────────────────

    /// Disconnects every device and joins all loops, waiting at most `wait`.
    ///
    /// Safe to call more than once, including concurrently.
    pub async fn shutdown(&self, wait: Duration) {
        if self.closing.swap(true, Ordering::AcqRel) {
            debug!("registry shutdown already in progress");
        }

        for device in self.live_devices().await {
            self.remove_connection(&device, DisconnectReason::Shutdown).await;
        }

        let handles = std::mem::take(&mut *lock(&self.tasks));
        let deadline = Instant::now() + wait;
        for mut handle in handles {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if timeout(remaining, &mut handle).await.is_err() {
                warn!("connection task did not stop within {wait:?}; aborting it");
                handle.abort();
            }
        }
    }
}

fn is_string_array(value: &Value) -> bool {
    value
        .as_array()
        .is_some_and(|items| items.iter().all(Value::is_string))
}

// ── Collaborator seams ────────────────────────────────────────────────────────

#[async_trait]
impl DeviceDirectory for ConnectionRegistry {
    async fn connected_devices(&self) -> Vec<DeviceId> {
        let mut ids: Vec<_> = self
            .live_devices()
            .await
            .iter()
            .filter(|d| d.state() == DeviceConnectionState::Connected)
            .map(|d| d.id().to_string())
            .collect();
        ids.sort();
        ids
    }

    async fn send(&self, device_id: &str, message: Message, priority: MessagePriority) -> bool {
        match ConnectionRegistry::send(self, device_id, message, priority).await {
            Ok(()) => true,
            Err(e) => {
                warn!("send to {device_id} failed: {e}");
                false
            }
        }
    }

    async fn broadcast(&self, message: Message, priority: MessagePriority) -> usize {
        ConnectionRegistry::broadcast(self, message, priority).await
    }

    async fn set_session(&self, device_id: &str, session_id: Option<String>) {
        if let Some(device) = self.get(device_id).await {
            device.set_session(session_id);
        }
    }
}

#[async_trait]
impl QueueSource for ConnectionRegistry {
    async fn queue_depths(&self) -> Vec<QueueDepth> {
        self.live_devices().await.iter().map(|d| d.queue_depth()).collect()
    }
}

#[async_trait]
impl QualityAdvisor for ConnectionRegistry {
    async fn apply_quality(&self, host_tier: QualityTier) {
        for device in self.live_devices().await {
            let tier = host_tier.min(device.link_tier());
            if device.set_quality(tier) {
                debug!("device {}: streaming quality now {tier}", device.id());
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::orchestrate_session::DeviceContext;
    use crate::infrastructure::network::security::TokenStore;
    use capsync_core::encode_frame;
    use capsync_core::protocol::messages::now_secs;
    use serde_json::json;
    use std::io;
    use std::pin::Pin;
    use std::task::{ready, Context, Poll};
    use tokio::io::{duplex, AsyncRead, AsyncWrite, AsyncWriteExt, ReadBuf};
    use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};

    #[derive(Default)]
    struct RecordingInbound {
        kinds: Mutex<Vec<(String, String)>>,
        disconnected: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl InboundHandler for RecordingInbound {
        async fn handle_inbound(&self, device: &dyn DeviceContext, message: DeviceMessage, _sent_at: f64) {
            self.kinds
                .lock()
                .unwrap()
                .push((device.device_id().to_string(), message.kind().to_string()));
        }

        async fn device_disconnected(&self, device_id: &str) {
            self.disconnected.lock().unwrap().push(device_id.to_string());
        }
    }

    struct Harness {
        registry: Arc<ConnectionRegistry>,
        inbound: Arc<RecordingInbound>,
        events: UnboundedReceiver<HostEvent>,
    }

    fn harness(config: RegistryConfig, tokens: Option<Arc<dyn TokenValidator>>) -> Harness {
        let bus = Arc::new(EventBus::new());
        let (tx, events) = unbounded_channel();
        bus.subscribe(move |e: &HostEvent| {
            let _ = tx.send(e.clone());
            Ok(())
        });
        let inbound = Arc::new(RecordingInbound::default());
        let registry = ConnectionRegistry::new(config, bus, inbound.clone(), tokens);
        Harness {
            registry,
            inbound,
            events,
        }
    }

    fn peer() -> SocketAddr {
        "127.0.0.1:40000".parse().unwrap()
    }

    fn message(kind: &str, payload: Value) -> Message {
        Message::new(kind, payload.as_object().cloned().unwrap_or_default())
    }

    /// Writes `first` from the device side, then registers the host side.
    async fn connect_with(
        registry: &Arc<ConnectionRegistry>,
        first: Message,
    ) -> (Result<Arc<Device>, HandshakeError>, Reader, Writer) {
        let (device_side, host_side) = duplex(64 * 1024);
        let (reader, mut writer) = split(Box::new(device_side));
        writer.write(&first).await.unwrap();
        let result = registry.register(Box::new(host_side), peer()).await;
        (result, reader, writer)
    }

    async fn connect(registry: &Arc<ConnectionRegistry>, id: &str) -> (Arc<Device>, Reader, Writer) {
        let hello = message("hello", json!({"device_id": id, "capabilities": ["rgb"]}));
        let (result, mut reader, writer) = connect_with(registry, hello).await;
        let device = result.unwrap();
        let ack = next_message(&mut reader).await;
        assert_eq!(ack.kind, "handshake_ack");
        (device, reader, writer)
    }

    async fn next_message<R: AsyncRead + Unpin>(reader: &mut FrameReader<R>) -> Message {
        match reader.read(Duration::from_secs(2)).await.unwrap() {
            ReadOutcome::Message(m, _) => m,
            other => panic!("expected a message, got {other:?}"),
        }
    }

    /// Host-side stream whose reads are scripted chunk by chunk, including
    /// I/O failures.  Writes are accepted and discarded.
    struct ScriptedStream {
        reads: UnboundedReceiver<io::Result<Vec<u8>>>,
        pending: Vec<u8>,
    }

    impl AsyncRead for ScriptedStream {
        fn poll_read(
            mut self: Pin<&mut Self>,
            cx: &mut Context<'_>,
            buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            if self.pending.is_empty() {
                match ready!(self.reads.poll_recv(cx)) {
                    Some(Ok(bytes)) => self.pending = bytes,
                    Some(Err(e)) => return Poll::Ready(Err(e)),
                    None => return Poll::Ready(Ok(())),
                }
            }
            let n = self.pending.len().min(buf.remaining());
            buf.put_slice(&self.pending[..n]);
            self.pending.drain(..n);
            Poll::Ready(Ok(()))
        }
    }

    impl AsyncWrite for ScriptedStream {
        fn poll_write(self: Pin<&mut Self>, _cx: &mut Context<'_>, buf: &[u8]) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    async fn connect_scripted(
        registry: &Arc<ConnectionRegistry>,
        id: &str,
    ) -> (Arc<Device>, UnboundedSender<io::Result<Vec<u8>>>) {
        let (tx, reads) = unbounded_channel();
        let hello = message("hello", json!({"device_id": id}));
        tx.send(Ok(encode_frame(&hello).unwrap())).unwrap();
        let stream = ScriptedStream {
            reads,
            pending: Vec::new(),
        };
        let device = registry.register(Box::new(stream), peer()).await.unwrap();
        (device, tx)
    }

    fn reset() -> io::Result<Vec<u8>> {
        Err(io::Error::new(io::ErrorKind::ConnectionReset, "connection reset"))
    }

    async fn wait_for_inbound(inbound: &RecordingInbound, count: usize) {
        timeout(Duration::from_secs(2), async {
            while inbound.kinds.lock().unwrap().len() < count {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("inbound messages never arrived");
    }

    async fn next_disconnect(events: &mut UnboundedReceiver<HostEvent>) -> (String, DisconnectReason) {
        loop {
            let event = timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("timed out waiting for disconnect")
                .expect("event bus closed");
            if let HostEvent::DeviceDisconnected { device_id, reason } = event {
                return (device_id, reason);
            }
        }
    }

    fn disconnects_so_far(events: &mut UnboundedReceiver<HostEvent>) -> usize {
        let mut n = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HostEvent::DeviceDisconnected { .. }) {
                n += 1;
            }
        }
        n
    }

    #[tokio::test]
    async fn test_valid_handshake_registers_device_and_acks_first() {
        // Arrange
        let mut h = harness(RegistryConfig::default(), None);

        // Act
        let (device, mut reader, _writer) = connect(&h.registry, "cam-1").await;

        // Assert
        assert_eq!(device.state(), DeviceConnectionState::Connected);
        assert_eq!(h.registry.device_count().await, 1);
        assert!(matches!(
            h.events.try_recv(),
            Ok(HostEvent::DeviceConnected { device_id, .. }) if device_id == "cam-1"
        ));
        // Nothing else was queued ahead of the ack.
        assert_eq!(
            reader.read(Duration::from_millis(50)).await.unwrap(),
            ReadOutcome::Timeout
        );
    }

    #[tokio::test]
    async fn test_missing_device_id_is_refused_with_nack() {
        // Arrange
        let h = harness(RegistryConfig::default(), None);
        let hello = message("hello", json!({"capabilities": []}));

        // Act
        let (result, mut reader, _writer) = connect_with(&h.registry, hello).await;

        // Assert
        assert!(matches!(result, Err(HandshakeError::MissingDeviceId)));
        let nack = next_message(&mut reader).await;
        assert_eq!(nack.kind, "handshake_ack");
        assert_eq!(nack.payload.get("compatible"), Some(&json!(false)));
        assert_eq!(h.registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_non_array_capabilities_are_rejected() {
        let h = harness(RegistryConfig::default(), None);
        let hello = message("handshake", json!({"device_id": "cam-1", "capabilities": "rgb"}));

        let (result, _reader, _writer) = connect_with(&h.registry, hello).await;

        assert!(matches!(result, Err(HandshakeError::InvalidCapabilities)));
    }

    #[tokio::test]
    async fn test_absent_capabilities_are_treated_as_empty() {
        let h = harness(RegistryConfig::default(), None);
        let hello = message("hello", json!({"device_id": "cam-1"}));

        let (result, _reader, _writer) = connect_with(&h.registry, hello).await;

        assert!(result.unwrap().capabilities().is_empty());
    }

    #[tokio::test]
    async fn test_first_message_must_be_a_handshake() {
        let h = harness(RegistryConfig::default(), None);

        let (result, _reader, _writer) = connect_with(&h.registry, message("status", json!({}))).await;

        assert!(matches!(result, Err(HandshakeError::UnexpectedKind(k)) if k == "status"));
    }

    #[tokio::test]
    async fn test_silent_connection_times_out() {
        // Arrange
        let config = RegistryConfig {
            handshake_timeout: Duration::from_millis(50),
            ..RegistryConfig::default()
        };
        let h = harness(config, None);
        let (_device_side, host_side) = duplex(1024);

        // Act
        let result = h.registry.register(Box::new(host_side), peer()).await;

        // Assert
        assert!(matches!(result, Err(HandshakeError::Timeout(_))));
        assert_eq!(h.registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_token_is_required_when_validator_present() {
        // Arrange
        let store = Arc::new(TokenStore::new(Duration::from_secs(60)));
        let token = store.issue(Some("cam-1"));
        let h = harness(RegistryConfig::default(), Some(store));

        // Act
        let (without, _r1, _w1) =
            connect_with(&h.registry, message("hello", json!({"device_id": "cam-1"}))).await;
        let (with, _r2, _w2) = connect_with(
            &h.registry,
            message("hello", json!({"device_id": "cam-1", "token": token})),
        )
        .await;

        // Assert
        assert!(matches!(without, Err(HandshakeError::Unauthorized)));
        assert!(with.is_ok());
    }

    #[tokio::test]
    async fn test_capacity_refuses_new_device_but_allows_reconnect() {
        // Arrange
        let config = RegistryConfig {
            max_connections: 1,
            ..RegistryConfig::default()
        };
        let h = harness(config, None);
        let _first = connect(&h.registry, "cam-1").await;

        // Act
        let (other, _r, _w) =
            connect_with(&h.registry, message("hello", json!({"device_id": "cam-2"}))).await;
        let (again, _r2, _w2) =
            connect_with(&h.registry, message("hello", json!({"device_id": "cam-1"}))).await;

        // Assert
        assert!(matches!(other, Err(HandshakeError::CapacityReached { max: 1 })));
        assert!(again.is_ok());
    }

    #[tokio::test]
    async fn test_heartbeat_is_answered() {
        // Arrange
        let h = harness(RegistryConfig::default(), None);
        let (_device, mut reader, mut writer) = connect(&h.registry, "cam-1").await;

        // Act
        writer.write(&message("heartbeat", json!({}))).await.unwrap();

        // Assert
        assert_eq!(next_message(&mut reader).await.kind, "heartbeat_response");
    }

    #[tokio::test]
    async fn test_inbound_messages_reach_handler_in_order() {
        // Arrange
        let h = harness(RegistryConfig::default(), None);
        let (_device, _reader, mut writer) = connect(&h.registry, "cam-1").await;

        // Act
        writer.write(&message("status", json!({"battery": 80.0}))).await.unwrap();
        writer.write(&message("sensor_data", json!({"values": {"gsr": 1.0}}))).await.unwrap();
        writer.write(&message("custom_kind", json!({}))).await.unwrap();
        for _ in 0..100 {
            if h.inbound.kinds.lock().unwrap().len() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        // Assert
        let kinds: Vec<_> = h.inbound.kinds.lock().unwrap().iter().map(|(_, k)| k.clone()).collect();
        assert_eq!(kinds, ["status", "sensor_data", "custom_kind"]);
    }

    #[tokio::test]
    async fn test_reconnect_supersedes_old_device_once() {
        // Arrange
        let mut h = harness(RegistryConfig::default(), None);
        let (old, _r1, _w1) = connect(&h.registry, "cam-1").await;

        // Act
        let (new, _r2, _w2) = connect(&h.registry, "cam-1").await;

        // Assert
        let (id, reason) = next_disconnect(&mut h.events).await;
        assert_eq!(id, "cam-1");
        assert_eq!(reason, DisconnectReason::Superseded);
        assert_eq!(old.state(), DeviceConnectionState::Reconnecting);
        let live = h.registry.get("cam-1").await.unwrap();
        assert_eq!(live.connection_id(), new.connection_id());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(disconnects_so_far(&mut h.events), 0);
        assert_eq!(h.registry.device_count().await, 1);
    }

    #[tokio::test]
    async fn test_heartbeat_sweep_disconnects_silent_device_once() {
        // Arrange
        let config = RegistryConfig {
            heartbeat_timeout: Duration::from_millis(20),
            ..RegistryConfig::default()
        };
        let mut h = harness(config, None);
        let _conn = connect(&h.registry, "cam-1").await;
        tokio::time::sleep(Duration::from_millis(40)).await;

        // Act
        let expired = h.registry.sweep_heartbeats().await;
        let again = h.registry.sweep_heartbeats().await;

        // Assert
        assert_eq!(expired, ["cam-1"]);
        assert!(again.is_empty());
        let (_, reason) = next_disconnect(&mut h.events).await;
        assert_eq!(reason, DisconnectReason::HeartbeatTimeout);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(disconnects_so_far(&mut h.events), 0);
        assert_eq!(*h.inbound.disconnected.lock().unwrap(), ["cam-1"]);
    }

    #[tokio::test]
    async fn test_consecutive_read_errors_force_disconnect_at_threshold() {
        // Arrange
        let mut h = harness(RegistryConfig::default(), None);
        let (device, reads) = connect_scripted(&h.registry, "cam-1").await;
        let status = message("status", json!({"battery": 50}));

        // Act: four failures, a good frame, four more failures
        for _ in 0..4 {
            reads.send(reset()).unwrap();
        }
        reads.send(Ok(encode_frame(&status).unwrap())).unwrap();
        for _ in 0..4 {
            reads.send(reset()).unwrap();
        }
        wait_for_inbound(&h.inbound, 1).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Assert: the good frame reset the count, so nothing fired yet
        assert_eq!(disconnects_so_far(&mut h.events), 0);
        assert_eq!(h.registry.device_count().await, 1);
        assert_eq!(device.snapshot().consecutive_errors, 4);

        // Act: the fifth consecutive failure
        reads.send(reset()).unwrap();

        // Assert
        let (id, reason) = next_disconnect(&mut h.events).await;
        assert_eq!(id, "cam-1");
        assert_eq!(reason, DisconnectReason::ErrorThreshold);
        assert_eq!(device.state(), DeviceConnectionState::Error);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(disconnects_so_far(&mut h.events), 0);
        assert_eq!(*h.inbound.disconnected.lock().unwrap(), ["cam-1"]);
    }

    #[tokio::test]
    async fn test_network_stats_aggregate_every_device() {
        // Arrange
        let h = harness(RegistryConfig::default(), None);
        let (_a, _ra, mut wa) = connect(&h.registry, "cam-1").await;
        let (_b, _rb, mut wb) = connect(&h.registry, "cam-2").await;
        let late = message("status", json!({"battery": 90})).with_timestamp(now_secs() - 0.1);
        let unstamped = message("status", json!({"battery": 40})).with_timestamp(0.0);

        // Act
        let mut expected_bytes = 0;
        for _ in 0..2 {
            expected_bytes += wa.write(&late).await.unwrap();
        }
        expected_bytes += wb.write(&unstamped).await.unwrap();
        wait_for_inbound(&h.inbound, 3).await;
        let stats = h.registry.network_stats().await;

        // Assert
        assert_eq!(stats.devices, 2);
        assert_eq!(stats.messages_received, 3);
        assert_eq!(stats.bytes_received, expected_bytes as u64);
        assert_eq!(stats.messages_sent, 2, "one handshake_ack per device");
        // Only cam-1 carried a timestamp, so the mean is its ~100 ms.
        assert!(stats.mean_latency_ms >= 100.0, "{}", stats.mean_latency_ms);
        assert!(stats.mean_latency_ms < 2_000.0, "{}", stats.mean_latency_ms);
    }

    #[tokio::test]
    async fn test_zero_length_frame_closes_connection() {
        // Arrange
        let mut h = harness(RegistryConfig::default(), None);
        let (device_side, host_side) = duplex(64 * 1024);
        let (device_read, mut device_write) = tokio::io::split(device_side);
        let mut reader = FrameReader::new(device_read);
        let hello = message("hello", json!({"device_id": "cam-1"}));
        device_write.write_all(&encode_frame(&hello).unwrap()).await.unwrap();
        let device = h.registry.register(Box::new(host_side), peer()).await.unwrap();
        next_message(&mut reader).await;

        // Act
        device_write.write_all(&[0, 0, 0, 0]).await.unwrap();

        // Assert
        let (_, reason) = next_disconnect(&mut h.events).await;
        assert!(matches!(reason, DisconnectReason::ProtocolViolation(_)));
        assert_eq!(device.state(), DeviceConnectionState::Error);
        assert_eq!(h.registry.device_count().await, 0);
    }

    #[tokio::test]
    async fn test_send_to_unknown_device_fails() {
        let h = harness(RegistryConfig::default(), None);

        let result = h
            .registry
            .send("ghost", message("ping", json!({})), MessagePriority::Normal)
            .await;

        assert!(matches!(result, Err(RegistryError::UnknownDevice(id)) if id == "ghost"));
    }

    #[tokio::test]
    async fn test_broadcast_counts_connected_devices() {
        // Arrange
        let h = harness(RegistryConfig::default(), None);
        let (_a, mut ra, _wa) = connect(&h.registry, "cam-1").await;
        let (_b, mut rb, _wb) = connect(&h.registry, "cam-2").await;

        // Act
        let n = h
            .registry
            .broadcast(message("flash_sync", json!({"duration_ms": 100})), MessagePriority::Critical)
            .await;

        // Assert
        assert_eq!(n, 2);
        assert_eq!(next_message(&mut ra).await.kind, "flash_sync");
        assert_eq!(next_message(&mut rb).await.kind, "flash_sync");
        assert_eq!(
            DeviceDirectory::connected_devices(&*h.registry).await,
            ["cam-1", "cam-2"]
        );
    }

    #[tokio::test]
    async fn test_quality_is_capped_by_host_tier() {
        let h = harness(RegistryConfig::default(), None);
        let (device, _r, _w) = connect(&h.registry, "cam-1").await;

        h.registry.apply_quality(QualityTier::Medium).await;

        assert_eq!(device.quality(), QualityTier::Medium);
        assert_eq!(h.registry.queue_depths().await[0].name, "outbound:cam-1");
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everyone_and_is_idempotent() {
        // Arrange
        let mut h = harness(RegistryConfig::default(), None);
        let _a = connect(&h.registry, "cam-1").await;
        let _b = connect(&h.registry, "cam-2").await;

        // Act
        h.registry.shutdown(Duration::from_secs(2)).await;
        h.registry.shutdown(Duration::from_secs(2)).await;

        // Assert
        assert_eq!(h.registry.device_count().await, 0);
        let mut reasons = Vec::new();
        while let Ok(event) = h.events.try_recv() {
            if let HostEvent::DeviceDisconnected { reason, .. } = event {
                reasons.push(reason);
            }
        }
        assert_eq!(reasons, [DisconnectReason::Shutdown, DisconnectReason::Shutdown]);

        let (late, _r, _w) =
            connect_with(&h.registry, message("hello", json!({"device_id": "cam-3"}))).await;
        assert!(matches!(late, Err(HandshakeError::ShuttingDown)));
    }
}
