//! Network infrastructure for the capture host.
//!
//! # Sub-modules
//!
//! - **`channel`** – Length-prefixed JSON frames over any async byte stream,
//!   with partial-frame buffering across read timeouts.
//!
//! - **`outbound_queue`** – Bounded four-tier priority queue feeding each
//!   device's send loop.
//!
//! - **`device`** – One live connection: counters, health fields, latency
//!   window, and its outbound queue.
//!
//! - **`connection_registry`** – Accept loop, handshake, per-device receive
//!   and send loops, heartbeat sweep, and the device map itself.
//!
//! - **`security`** – Secure-channel wrapping and bearer-token validation.
//!
//! - **`discovery`** – Answers UDP `discover` datagrams so devices can find
//!   the host without manual IP configuration.

pub mod channel;
pub mod connection_registry;
pub mod device;
pub mod discovery;
pub mod outbound_queue;
pub mod security;

pub use connection_registry::{
    ConnectionRegistry, HandshakeError, NetworkStats, RegistryConfig, RegistryError,
};
pub use device::{Device, DeviceSnapshot};
pub use discovery::{DiscoveryError, ServiceAdvertiser, UdpDiscoveryAdvertiser};
pub use security::{PlainChannel, SecureChannel, TokenStore, TokenValidator};
