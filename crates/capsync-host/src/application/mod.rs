//! Application layer use cases for the capture host.
//!
//! # What is the "application" layer? (for beginners)
//!
//! In Clean Architecture the *application* layer sits between the domain
//! (pure business rules in `capsync-core`) and the infrastructure (sockets,
//! OS metrics, files).
//!
//! Use cases in this layer:
//!
//! - **Orchestrate** domain objects to fulfil a goal (e.g., "start a
//!   recording on every connected device, but only if at least one can be
//!   reached").
//! - **Depend on abstractions** (traits such as `DeviceDirectory` or
//!   `MetricsSource`) rather than concrete implementations, so the
//!   infrastructure can be swapped or faked in tests.
//! - **Contain no socket I/O and no OS calls**.
//!
//! # Sub-modules
//!
//! - **`events`** – Publish/subscribe bus carrying every user-visible
//!   outcome (device connected, sample received, session stopped, ...).
//!
//! - **`file_transfer`** – Reassembles chunked files streamed back by
//!   devices, reordering chunks by sequence number.
//!
//! - **`orchestrate_session`** – Start/stop recording sessions, broadcast
//!   sync signals, and dispatch inbound device messages by kind.
//!
//! - **`adaptive_load`** – Classifies host health from resource metrics and
//!   queue depths, and turns that into frame-drop and quality decisions.

pub mod adaptive_load;
pub mod events;
pub mod file_transfer;
pub mod orchestrate_session;
