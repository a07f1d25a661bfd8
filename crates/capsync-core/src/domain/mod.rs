//! Domain entities for CapSync.
//!
//! This module contains pure business types with no infrastructure
//! dependencies: no sockets, no clocks other than caller-supplied values, no
//! async runtime.
//!
//! # What is "domain" in Clean Architecture? (for beginners)
//!
//! The innermost layer of a Clean Architecture codebase is the **domain**.
//! It holds the vocabulary of the problem (a recording *session*, a *device*
//! and its connection state, a host *performance level*) together with the
//! rules that are true regardless of how the program talks to the outside
//! world.  Outer layers depend on the domain; the domain never depends on
//! them, which keeps it trivially unit-testable.

/// Device identity, connection states, and reported health.
pub mod device;

/// Link-quality statistics and streaming-tier recommendation.
pub mod link;

/// Host-wide performance levels and per-device quality tiers.
pub mod performance;

/// Recording sessions, bounded session history, and sensor samples.
pub mod session;
