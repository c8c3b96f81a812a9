//! Per-service context shared by the upstream and downstream pipelines.
//!
//! A service is one replication instance per (port, database id); the
//! supervisor creates one per active port. The context is immutable
//! after bring-up and shared by reference across the service's threads.

use std::sync::Arc;

use ssafab_config::FabricConfig;
use ssafab_types::{DbId, Gid, Lid, NodeType};

use crate::counters::Counters;

/// Immutable identity and configuration of one service.
pub struct ServiceCtx {
    /// Index of this service within the node; also encoded into MAD
    /// transaction ids for response dispatch.
    pub index: usize,
    /// Operator-facing name, `port:db`.
    pub name: String,
    pub node_type: NodeType,
    pub db_id: DbId,
    pub gid: Gid,
    pub lid: Lid,
    pub sm_lid: Lid,
    pub sm_sl: u8,
    pub config: Arc<FabricConfig>,
    pub counters: Arc<Counters>,
}

impl ServiceCtx {
    pub fn new(
        index: usize,
        node_type: NodeType,
        db_id: DbId,
        gid: Gid,
        lid: Lid,
        sm_lid: Lid,
        sm_sl: u8,
        config: Arc<FabricConfig>,
        counters: Arc<Counters>,
    ) -> Arc<Self> {
        Arc::new(Self {
            index,
            name: format!("{lid}:{db_id}"),
            node_type,
            db_id,
            gid,
            lid,
            sm_lid,
            sm_sl,
            config,
            counters,
        })
    }
}
