//! # ssafab-core: the distribution engine
//!
//! A root core service, co-located with the subnet manager, extracts
//! the subnet's routing state into an immutable SMDB and replicates it
//! down a dynamically built tree of distribution, access, and consumer
//! nodes over reliable stream sockets; access nodes derive per-consumer
//! PRDBs. This crate is the engine: tree membership and placement, the
//! per-link replication state machine, the per-service pipelines, and
//! the reconnection/backoff/cancellation semantics.
//!
//! ## Architecture
//!
//! The engine is multi-threaded with per-subsystem message passing and
//! no async runtime. Each pipeline owns a `mio` poll loop; cross-thread
//! communication goes through bounded channels paired with a poll waker
//! ([`mailbox`]). A thread blocks only on its poll (or, for the access
//! worker pool, a completion condvar), and no lock is held across a
//! poll.
//!
//! ```text
//!           ┌────────┐  MAD dispatch  ┌──────────┐
//!           │  ctrl  │ ─────────────▶ │ upstream │──▶ parent link
//!           └────────┘                └──────────┘
//!               │ port events              │ update ready / prepare
//!               ▼                          ▼
//!  ┌─────────┐  extract   ┌────────────┐ serve  ┌────────────┐
//!  │ extract │ ─────────▶ │ downstream │ ─────▶ │  children  │
//!  └─────────┘  updates   └────────────┘        └────────────┘
//!        │                      │ conn done/gone
//!        ▼                      ▼
//!  ┌────────┐  per-consumer ┌────────┐      ┌───────┐
//!  │ access │ ────────────▶ │ admin  │      │rclose │
//!  └────────┘  PRDB queue   └────────┘      └───────┘
//! ```

pub mod access;
pub mod admin;
pub mod connection;
pub mod counters;
pub mod downstream;
pub mod extract;
pub mod mailbox;
pub mod msg;
pub mod puller;
pub mod rclose;
pub mod server;
pub mod service;
pub mod supervisor;
pub mod transport;
pub mod tree;
pub mod upstream;

pub use supervisor::{Node, NodeHandle, PortDesc, SubnetProvider};

use thiserror::Error;

/// Version string reported in admin node-info responses.
pub const FABRIC_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Result type for engine operations.
pub type CoreResult<T> = Result<T, CoreError>;

/// Errors raised by the engine.
#[derive(Debug, Error)]
pub enum CoreError {
    /// Wire protocol violation on a replication or admin link.
    #[error("wire protocol error: {0}")]
    Wire(#[from] ssafab_wire::WireError),

    /// Database structure failure.
    #[error("database error: {0}")]
    Db(#[from] ssafab_db::DbError),

    /// MAD transport failure.
    #[error("MAD error: {0}")]
    Mad(#[from] ssafab_mad::MadError),

    /// I/O failure.
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// Peer closed the connection.
    #[error("connection closed by peer")]
    ConnectionClosed,

    /// Replication-sequence violation (phase skip, correlation-id
    /// mismatch). The offending connection is closed.
    #[error("replication protocol violation: {0}")]
    Protocol(String),

    /// A cross-thread channel was disconnected during shutdown.
    #[error("pipeline channel closed")]
    ChannelClosed,

    /// Fatal startup failure.
    #[error("initialization failed: {0}")]
    Init(String),
}
