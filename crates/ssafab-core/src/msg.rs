//! Typed messages carried on the cross-thread mailboxes.
//!
//! One enum per receiving pipeline; every variant corresponds to one of
//! the unidirectional links in the §5 fabric. Database payloads travel
//! as `Arc<SsaDb>`; the Arc clone is the refcount that keeps a
//! snapshot alive while any pipeline or connection still serves it.

use std::sync::Arc;

use crossbeam_channel::Sender;
use ssafab_db::SsaDb;
use ssafab_mad::Mad;
use ssafab_types::{Epoch, Gid, Lid, NodeType};

use crate::connection::{ConnRole, DbKind};

/// Port state changes fanned out by the control thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortEvent {
    PortActive,
    PortError,
    /// Subnet-manager change (including failover/handover).
    SmChange,
}

/// Identity of a remote peer on a replication link.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerId {
    pub gid: Gid,
    pub lid: Lid,
}

/// Which pipeline originated an update-prepare / update handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateSource {
    Extract,
    Upstream,
}

/// A database hand-off between pipelines.
#[derive(Clone)]
pub struct DbUpdateMsg {
    pub db: Arc<SsaDb>,
    pub epoch: Epoch,
    /// Whether the content changed relative to the previous generation.
    /// Downstream notification is skipped for unchanged extractor
    /// updates.
    pub changed: bool,
    /// Target consumer for per-consumer PRDB updates; `None` for the
    /// shared SMDB.
    pub target: Option<PeerId>,
}

impl std::fmt::Debug for DbUpdateMsg {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DbUpdateMsg")
            .field("epoch", &self.epoch)
            .field("changed", &self.changed)
            .field("target", &self.target)
            .finish_non_exhaustive()
    }
}

/// Connection lifecycle notification for the admin table and the
/// access map.
#[derive(Debug, Clone, Copy)]
pub struct ConnEvent {
    pub service: usize,
    pub role: ConnRole,
    pub db_kind: DbKind,
    pub remote_gid: Gid,
    pub remote_lid: Lid,
    pub remote_node_type: NodeType,
    /// Wall-clock seconds at connection establishment.
    pub connected_at: u64,
}

/// Reply to a consumer-local database freshness query.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbQueryStatus {
    EpochChanged,
    EpochNotChanged,
    NoUpstreamConnection,
}

/// Messages handled by an upstream pipeline.
pub enum UpstreamMsg {
    /// A MAD dispatched by the control thread.
    Mad(Mad),
    PortEvent(PortEvent),
    /// Initiate (or re-initiate) the upstream data connection.
    Connect,
    /// A neighbor pipeline finished quiescing for a pending update.
    UpdateReady,
    /// Consumer-local freshness query; the reply goes back on the
    /// embedded channel.
    DbQuery(Sender<DbQueryStatus>),
    Exit,
}

/// Messages handled by a downstream pipeline.
pub enum DownstreamMsg {
    /// Start (or restart) the listeners.
    Listen,
    PortEvent(PortEvent),
    UpdatePrepare(UpdateSource),
    /// New shared SMDB generation.
    SmdbUpdate(DbUpdateMsg),
    /// New PRDB for one consumer (target set).
    PrdbUpdate(DbUpdateMsg),
    /// Operator-requested disconnect of one peer.
    Disconnect(Gid),
    Exit,
}

/// Messages handled by the extractor.
pub enum ExtractMsg {
    StartExtract,
    /// Lightweight forwarding-table change notification.
    RouteChange,
    UpdateReady,
    Exit,
}

/// Messages handled by the access pipeline.
pub enum AccessMsg {
    UpdatePrepare {
        source: UpdateSource,
        service: usize,
    },
    SmdbUpdate {
        update: DbUpdateMsg,
        /// Restrict recomputation to one service's consumers, or all
        /// when the update came from the extractor.
        service: Option<usize>,
    },
    ConnDone(ConnEvent),
    ConnGone(ConnEvent),
    Exit,
}

/// Messages handled by the admin pipeline.
pub enum AdminMsg {
    ConnDone(ConnEvent),
    ConnGone(ConnEvent),
    Exit,
}

/// Messages handled by the control thread.
pub enum CtrlMsg {
    /// An upstream pipeline asks to have its data connection initiated.
    ConnRequest(usize),
    Exit,
}
