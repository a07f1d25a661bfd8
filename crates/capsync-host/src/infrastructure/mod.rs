//! Infrastructure layer for the capture host.
//!
//! Contains OS-facing adapters: TCP and UDP sockets, host resource sampling,
//! file-integrity hashing, configuration files, and the runtime that wires
//! them to the application layer.
//!
//! **Dependency rule**: this layer may depend on `application` and
//! `capsync_core`, but MUST NOT be imported by the `application` or domain
//! layers.

pub mod host;
pub mod integrity;
pub mod metrics;
pub mod network;
pub mod shutdown;
pub mod storage;
