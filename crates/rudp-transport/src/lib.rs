//! # rudp-transport
//!
//! Reliable, ordered, flow-controlled byte streams over an unreliable
//! datagram transport.
//!
//! Three-way handshake, cumulative acknowledgements with RTT-adaptive
//! retransmission, AIMD window adaptation, receive-side reordering, and
//! keepalive liveness detection. Everything is driven by a periodic tick.
//!
//! ## Crate structure
//!
//! - [`wire`] — Seven-message codec and serial-number arithmetic
//! - [`sender`] — Send segmentation buffer
//! - [`arq`] — Timeout / retransmission queue
//! - [`rtt`] — RTT sample ring
//! - [`congestion`] — AIMD window controller
//! - [`receiver`] — Receive reorder buffer
//! - [`session`] — Connection states, handshake timer, liveness
//! - [`connection`] — Per-peer state machine
//! - [`endpoint`] — Connection table and datagram dispatch
//! - [`scheduler`] — Task queue and tick driver
//! - [`event`] — Event subscriptions
//! - [`net`] — UDP and in-memory datagram transports
//! - [`config`] — Tunables and TOML loading
//! - [`stats`] — Per-connection counters

pub mod arq;
pub mod config;
pub mod congestion;
pub mod connection;
pub mod endpoint;
pub mod error;
pub mod event;
pub mod net;
pub mod receiver;
pub mod rtt;
pub mod scheduler;
pub mod sender;
pub mod session;
pub mod stats;
pub mod wire;

pub use config::TransportConfig;
pub use connection::{Connection, Role};
pub use endpoint::{Endpoint, WeakEndpoint};
pub use error::TransportError;
pub use event::{ConnectionEvent, EventKind, SubscriptionId};
pub use scheduler::Scheduler;
pub use session::ConnectionState;
pub use stats::ConnectionStats;
