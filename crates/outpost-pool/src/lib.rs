//! Partitioned Nostr relay pool with outbox routing.
//!
//! This crate manages persistent websocket connections to relays and decides
//! which relays each outgoing message goes to.
//!
//! # Modules
//!
//! - [`pool`] - The [`RelayPool`] handle and the actor that owns all state
//! - [`connection`] - Per-relay connection state machine and backoff
//! - [`router`] - NIP-65 outbox planning (find and reach)
//! - [`dispatcher`] - Message routing rules
//! - [`penalty`] - Failure accounting and the penalty box
//! - [`supervisor`] - Keepalive ticks
//! - [`transport`] - Websocket transport seam
//!
//! # Architecture
//!
//! ```text
//!   RelayPool (Clone)          socket tasks / timers
//!        │ commands                  │ events
//!        ▼                           ▼
//! ┌─────────────────────────────────────────────┐
//! │                 pool actor                  │
//! │  registry: primary | outbox | ephemeral |   │
//! │            service                          │
//! │  router + penalty box + stats + supervisor  │
//! └─────────────────────────────────────────────┘
//!        │ status (watch)            │ raw frames
//!        ▼                           ▼
//!    UI readers                InboundHandler
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod penalty;
pub mod pool;
mod registry;
pub mod router;
mod scheduler;
pub mod supervisor;
pub mod transport;

pub use config::PoolConfig;
pub use connection::{Backoff, ConnectionCategory, ConnectionKey, Partition, SocketState};
pub use dispatcher::{DispatchReport, SendOptions};
pub use error::{Error, Result, TransportError};
pub use penalty::{PenaltyBox, PenaltyPolicy, RelayConnectionStats};
pub use pool::{ConnectionInfo, InboundHandler, PoolSnapshot, PoolStatus, RelayPool, ServiceKind};
pub use router::{FindGroup, FindPlan, OutboxRouter, PreferredRelays, ReachGroup, ReachPlan};
pub use supervisor::TickReport;
pub use transport::{Transport, WebSocketTransport, WireFrame};
