//! Downstream (serving) side of the replication protocol.
//!
//! A `Downstream` connection receives query frames and serves them from
//! a locally held database reference. Phase progression is monotone:
//! a request belonging to phase N is honored only when the connection
//! sits at exactly N-1 (or at N for a continuation); anything else is
//! logged and ignored. The reference held across a transfer pins the
//! snapshot; the pipeline may swap its database only while every
//! connection is back at phase `Idle`.

use std::sync::Arc;

use bytes::Bytes;
use ssafab_db::{SsaDb, codec};
use ssafab_types::Epoch;
use ssafab_wire::{Frame, FrameClass, FrameFlags, FrameHeader, ReplOp};
use tracing::{debug, warn};

use crate::CoreResult;
use crate::connection::{Conn, DbKind, Phase};

/// What the pipeline must do after a served frame.
#[derive(Debug, PartialEq, Eq)]
pub enum ServeAction {
    None,
    /// An SMDB transfer just finished (connection back to `Idle`).
    TransferDone,
    /// The peer published its epoch buffer; the access pipeline should
    /// be told the consumer is ready.
    EpochPublished,
}

/// Serves one request frame on a downstream connection.
///
/// `shared_smdb` is the pipeline's current SMDB; PRDB connections serve
/// their per-connection database installed by the access pipeline.
/// Errors are transport failures; the caller closes the connection.
pub fn serve_frame(
    conn: &mut Conn,
    frame: &Frame,
    shared_smdb: Option<&Arc<SsaDb>>,
) -> CoreResult<ServeAction> {
    let op = frame.header.repl_op()?;
    if frame.header.flags.contains(FrameFlags::RESP) {
        warn!(
            ?op,
            phase = ?conn.phase,
            "ignoring response-flagged frame on serving connection"
        );
        return Ok(ServeAction::None);
    }

    match op {
        ReplOp::QueryDef => serve_query_def(conn, frame, shared_smdb),
        ReplOp::QueryTblDef => serve_query_tbl_def(conn, frame),
        ReplOp::QueryTblDefDataset => serve_query_tbl_def_dataset(conn, frame),
        ReplOp::QueryFieldDefDataset => serve_query_field_defs(conn, frame),
        ReplOp::QueryDataDataset => serve_query_data(conn, frame),
        ReplOp::PublishEpochBuf => serve_epoch_publish(conn, frame),
        ReplOp::Update => {
            warn!("ignoring Update frame on serving connection");
            Ok(ServeAction::None)
        }
    }
}

fn reply(conn: &mut Conn, op: ReplOp, flags: FrameFlags, payload: Bytes) -> CoreResult<()> {
    let header = FrameHeader::new(
        FrameClass::Db,
        op.to_u16(),
        flags | FrameFlags::RESP,
        conn.rid,
    );
    conn.send_frame(&Frame::new(header, payload))
}

fn serve_query_def(
    conn: &mut Conn,
    frame: &Frame,
    shared_smdb: Option<&Arc<SsaDb>>,
) -> CoreResult<ServeAction> {
    // Bind the snapshot for the whole transfer. PRDB connections have
    // theirs installed by the access pipeline; SMDB connections take a
    // reference to the shared snapshot here.
    if conn.db.is_none() && conn.db_kind == DbKind::Smdb {
        conn.db = shared_smdb.cloned();
    }

    let Some(db) = conn.db.clone() else {
        debug!("no database loaded yet; answering empty");
        conn.rid = frame.header.id;
        reply(conn, ReplOp::QueryDef, FrameFlags::END, Bytes::new())?;
        return Ok(ServeAction::None);
    };

    if conn.phase != Phase::Idle {
        warn!(phase = ?conn.phase, "QueryDef outside Idle phase ignored");
        return Ok(ServeAction::None);
    }

    conn.phase = Phase::Defs;
    conn.rid = frame.header.id;
    let payload = db
        .def
        .as_ref()
        .map(codec::encode_db_def)
        .unwrap_or_default();
    reply(conn, ReplOp::QueryDef, FrameFlags::NONE, payload)?;
    Ok(ServeAction::None)
}

fn serve_query_tbl_def(conn: &mut Conn, frame: &Frame) -> CoreResult<ServeAction> {
    let Some(db) = conn.db.clone() else {
        warn!("QueryTblDef without a bound database ignored");
        return Ok(ServeAction::None);
    };
    if conn.phase != Phase::Defs {
        warn!(phase = ?conn.phase, "QueryTblDef outside Defs phase ignored");
        return Ok(ServeAction::None);
    }
    conn.rid = frame.header.id;
    let payload = db
        .table_def_meta
        .as_ref()
        .map(codec::encode_dataset_def)
        .unwrap_or_default();
    reply(conn, ReplOp::QueryTblDef, FrameFlags::NONE, payload)?;
    Ok(ServeAction::None)
}

fn serve_query_tbl_def_dataset(conn: &mut Conn, frame: &Frame) -> CoreResult<ServeAction> {
    let Some(db) = conn.db.clone() else {
        warn!("QueryTblDefDataset without a bound database ignored");
        return Ok(ServeAction::None);
    };
    if conn.phase != Phase::Defs {
        warn!(phase = ?conn.phase, "QueryTblDefDataset outside Defs phase ignored");
        return Ok(ServeAction::None);
    }
    conn.phase = Phase::TblDefs;
    conn.rid = frame.header.id;
    reply(
        conn,
        ReplOp::QueryTblDefDataset,
        FrameFlags::NONE,
        db.table_defs.clone(),
    )?;
    Ok(ServeAction::None)
}

fn serve_query_field_defs(conn: &mut Conn, frame: &Frame) -> CoreResult<ServeAction> {
    let Some(db) = conn.db.clone() else {
        warn!("QueryFieldDefDataset without a bound database ignored");
        return Ok(ServeAction::None);
    };
    match conn.phase {
        Phase::TblDefs => {
            conn.phase = Phase::FieldDefs;
            conn.rid = frame.header.id;
            conn.sindex = 0;
            reply(
                conn,
                ReplOp::QueryFieldDefDataset,
                FrameFlags::NONE,
                codec::encode_dataset_defs(&db.field_def_meta),
            )?;
        }
        Phase::FieldDefs => {
            conn.rid = frame.header.id;
            if conn.sindex < db.table_count() {
                let payload = db.field_defs[conn.sindex].clone();
                conn.sindex += 1;
                reply(conn, ReplOp::QueryFieldDefDataset, FrameFlags::NONE, payload)?;
            } else {
                reply(
                    conn,
                    ReplOp::QueryFieldDefDataset,
                    FrameFlags::END,
                    Bytes::new(),
                )?;
            }
        }
        other => {
            warn!(phase = ?other, "QueryFieldDefDataset out of sequence ignored");
        }
    }
    Ok(ServeAction::None)
}

fn serve_query_data(conn: &mut Conn, frame: &Frame) -> CoreResult<ServeAction> {
    let Some(db) = conn.db.clone() else {
        warn!("QueryDataDataset without a bound database ignored");
        return Ok(ServeAction::None);
    };
    match conn.phase {
        Phase::FieldDefs => {
            conn.phase = Phase::Data;
            conn.rid = frame.header.id;
            conn.sindex = 0;
            reply(
                conn,
                ReplOp::QueryDataDataset,
                FrameFlags::NONE,
                codec::encode_dataset_defs(&db.data_meta),
            )?;
            Ok(ServeAction::None)
        }
        Phase::Data => {
            conn.rid = frame.header.id;
            if conn.sindex < db.table_count() {
                let payload = db.data[conn.sindex].clone();
                conn.sindex += 1;
                reply(conn, ReplOp::QueryDataDataset, FrameFlags::NONE, payload)?;
                Ok(ServeAction::None)
            } else {
                // Final terminator: the transfer is complete and the
                // snapshot reference is released. Only now may the
                // pipeline swap in a newer generation.
                conn.phase = Phase::Idle;
                let released_smdb = conn.db_kind == DbKind::Smdb;
                if released_smdb {
                    conn.db = None;
                }
                reply(conn, ReplOp::QueryDataDataset, FrameFlags::END, Bytes::new())?;
                Ok(if released_smdb {
                    ServeAction::TransferDone
                } else {
                    ServeAction::None
                })
            }
        }
        other => {
            warn!(phase = ?other, "QueryDataDataset out of sequence ignored");
            Ok(ServeAction::None)
        }
    }
}

fn serve_epoch_publish(conn: &mut Conn, frame: &Frame) -> CoreResult<ServeAction> {
    conn.epoch_len = frame.header.rdma_len;
    if conn.epoch_len != 8 {
        warn!(
            len = conn.epoch_len,
            "published epoch buffer has unexpected length"
        );
    }
    conn.epoch_published = true;

    // Re-publish the current epoch right away so a restarted consumer
    // resynchronizes without waiting for the next update.
    if conn.epoch_len == 8 {
        if let Some(epoch) = conn.db.as_ref().map(|db| db.epoch()) {
            if epoch.is_valid() {
                publish_epoch(conn, epoch)?;
            }
        }
    }
    Ok(ServeAction::EpochPublished)
}

/// Pushes a new epoch to the peer.
///
/// On rsockets this is a one-sided RDMA write into the buffer the peer
/// published; the TCP transport carries it as an epoch-bearing `Update`
/// frame which the peer's connection stores into its epoch word.
pub fn publish_epoch(conn: &mut Conn, epoch: Epoch) -> CoreResult<()> {
    let mut header = FrameHeader::new(FrameClass::Db, ReplOp::Update.to_u16(), FrameFlags::END, 0);
    header.rdma_addr = epoch.as_u64();
    conn.send_frame(&Frame::control(header))
}

/// Sends an update notification carrying the new database epoch.
/// Identical on the wire to an epoch publication.
pub fn notify_update(conn: &mut Conn, epoch: Epoch) -> CoreResult<()> {
    publish_epoch(conn, epoch)
}
