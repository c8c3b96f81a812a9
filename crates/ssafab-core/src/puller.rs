//! Upstream (pulling) side of the replication protocol.
//!
//! Walks the fixed phase sequence per snapshot pull:
//!
//! ```text
//! Idle → QueryDef → QueryTblDef → QueryTblDefDataset
//!      → QueryFieldDefDataset* (End) → QueryDataDataset* (End) → Idle
//! ```
//!
//! Every response must echo the outstanding request's correlation id
//! and belong to the current phase; a mismatch closes the connection.
//! The first response of each dataset phase carries the per-table
//! descriptor array, subsequent responses carry one table's rows, and
//! an empty `End`-flagged response terminates the stream.

use ssafab_db::{SsaDb, codec};
use ssafab_types::Epoch;
use ssafab_wire::{Frame, FrameFlags, ReplOp};
use tracing::{debug, warn};

use crate::connection::{Conn, Phase};
use crate::{CoreError, CoreResult};

/// Outcome of one received frame on a pulling connection.
#[derive(Debug)]
pub enum PullEvent {
    None,
    /// The pull sequence completed; the reconstructed snapshot is
    /// returned and the connection is back at `Idle`.
    Complete(SsaDb),
    /// The server announced a new epoch (update notification or
    /// emulated one-sided epoch write).
    UpdateNotice(Epoch),
}

/// Starts a fresh pull: allocates the reconstruction target and sends
/// the opening `QueryDef`.
pub fn start_pull(conn: &mut Conn) -> CoreResult<()> {
    conn.build = Some(SsaDb::empty());
    conn.phase = Phase::Defs;
    conn.rindex = 0;
    conn.expect_meta = false;
    let frame = conn.next_query(ReplOp::QueryDef);
    conn.send_frame(&frame)
}

/// Handles one frame received on an `Upstream` connection.
pub fn handle_frame(conn: &mut Conn, frame: &Frame) -> CoreResult<PullEvent> {
    let op = frame.header.repl_op()?;

    if op == ReplOp::Update {
        if frame.header.flags.contains(FrameFlags::RESP) {
            warn!("ignoring response-flagged Update notification");
            return Ok(PullEvent::None);
        }
        return Ok(PullEvent::UpdateNotice(Epoch::new(frame.header.rdma_addr)));
    }

    if !frame.header.flags.contains(FrameFlags::RESP) {
        warn!(?op, "ignoring unflagged frame on pulling connection");
        return Ok(PullEvent::None);
    }
    if op == ReplOp::PublishEpochBuf {
        warn!("ignoring PublishEpochBuf response");
        return Ok(PullEvent::None);
    }
    if frame.header.id != conn.sid {
        return Err(CoreError::Protocol(format!(
            "response id 0x{:x} does not match outstanding request 0x{:x}",
            frame.header.id, conn.sid
        )));
    }

    match (op, conn.phase) {
        (ReplOp::QueryDef, Phase::Defs) => {
            let build = build_mut(conn)?;
            build.def = Some(codec::decode_db_def(&frame.payload)?);
            let next = conn.next_query(ReplOp::QueryTblDef);
            conn.send_frame(&next)?;
            Ok(PullEvent::None)
        }
        (ReplOp::QueryTblDef, Phase::Defs) => {
            let build = build_mut(conn)?;
            build.table_def_meta = Some(codec::decode_dataset_def(&frame.payload)?);
            conn.phase = Phase::TblDefs;
            let next = conn.next_query(ReplOp::QueryTblDefDataset);
            conn.send_frame(&next)?;
            Ok(PullEvent::None)
        }
        (ReplOp::QueryTblDefDataset, Phase::TblDefs) => {
            let build = build_mut(conn)?;
            build.table_defs = frame.payload.clone();
            conn.phase = Phase::FieldDefs;
            conn.expect_meta = true;
            conn.rindex = 0;
            let next = conn.next_query(ReplOp::QueryFieldDefDataset);
            conn.send_frame(&next)?;
            Ok(PullEvent::None)
        }
        (ReplOp::QueryFieldDefDataset, Phase::FieldDefs) => {
            if frame.header.flags.contains(FrameFlags::END) && frame.payload.is_empty() {
                let build = build_mut(conn)?;
                let expected = build.field_def_meta.len();
                if conn.rindex != expected {
                    return Err(CoreError::Protocol(format!(
                        "field-def stream ended after {} of {expected} tables",
                        conn.rindex
                    )));
                }
                conn.phase = Phase::Data;
                conn.expect_meta = true;
                conn.rindex = 0;
                let next = conn.next_query(ReplOp::QueryDataDataset);
                conn.send_frame(&next)?;
            } else if conn.expect_meta {
                let build = build_mut(conn)?;
                build.field_def_meta = codec::decode_dataset_defs(&frame.payload)?;
                conn.expect_meta = false;
                conn.rindex = 0;
                let next = conn.next_query(ReplOp::QueryFieldDefDataset);
                conn.send_frame(&next)?;
            } else {
                let index = conn.rindex;
                let build = build_mut(conn)?;
                if index >= build.field_def_meta.len() {
                    return Err(CoreError::Protocol(format!(
                        "field-def table {index} beyond declared count {}",
                        build.field_def_meta.len()
                    )));
                }
                build.field_defs.push(frame.payload.clone());
                conn.rindex += 1;
                let next = conn.next_query(ReplOp::QueryFieldDefDataset);
                conn.send_frame(&next)?;
            }
            Ok(PullEvent::None)
        }
        (ReplOp::QueryDataDataset, Phase::Data) => {
            if frame.header.flags.contains(FrameFlags::END) && frame.payload.is_empty() {
                let build = build_mut(conn)?;
                let expected = build.data_meta.len();
                if conn.rindex != expected {
                    return Err(CoreError::Protocol(format!(
                        "data stream ended after {} of {expected} tables",
                        conn.rindex
                    )));
                }
                conn.phase = Phase::Idle;
                let db = conn.build.take().ok_or_else(missing_build)?;
                db.validate()?;
                debug!(
                    epoch = %db.epoch(),
                    tables = db.table_count(),
                    "database pull complete"
                );
                Ok(PullEvent::Complete(db))
            } else if conn.expect_meta {
                let build = build_mut(conn)?;
                build.data_meta = codec::decode_dataset_defs(&frame.payload)?;
                conn.expect_meta = false;
                conn.rindex = 0;
                let next = conn.next_query(ReplOp::QueryDataDataset);
                conn.send_frame(&next)?;
                Ok(PullEvent::None)
            } else {
                let index = conn.rindex;
                let build = build_mut(conn)?;
                if index >= build.data_meta.len() {
                    return Err(CoreError::Protocol(format!(
                        "data table {index} beyond declared count {}",
                        build.data_meta.len()
                    )));
                }
                build.data.push(frame.payload.clone());
                conn.rindex += 1;
                let next = conn.next_query(ReplOp::QueryDataDataset);
                conn.send_frame(&next)?;
                Ok(PullEvent::None)
            }
        }
        (op, phase) => Err(CoreError::Protocol(format!(
            "{op:?} response in phase {phase:?}"
        ))),
    }
}

fn build_mut(conn: &mut Conn) -> CoreResult<&mut SsaDb> {
    conn.build.as_mut().ok_or_else(missing_build)
}

fn missing_build() -> CoreError {
    CoreError::Protocol("response received with no pull in progress".into())
}

#[cfg(test)]
mod tests {
    //! Drives the puller against the serving side back-to-back through
    //! in-memory connections, covering the §4.3/§4.4 sequence without
    //! any pipeline machinery.

    use super::*;
    use crate::connection::{Conn, ConnRole, ConnState, DbKind};
    use crate::server::{self, ServeAction};
    use crate::transport;
    use ssafab_db::testutil::sample_db;
    use ssafab_db::{SsaDb, stamp_epochs};
    use ssafab_types::{DbId, Gid, Lid, NodeType};
    use std::io;
    use std::net::Ipv4Addr;
    use std::sync::Arc;
    use std::time::Duration;

    fn gid(host: u8) -> Gid {
        Gid::from_ipv6(Ipv4Addr::new(127, 0, 0, host).to_ipv6_mapped())
    }

    fn conn_pair(db_kind: DbKind) -> (Conn, Conn) {
        let listener = transport::listen(gid(1), 0).unwrap();
        let port = listener.local_addr().unwrap().port();
        let client_stream = transport::connect(gid(1), port, 0).unwrap();
        let (server_stream, _) = loop {
            match listener.accept() {
                Ok(pair) => break pair,
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::sleep(Duration::from_millis(2));
                }
                Err(e) => panic!("accept failed: {e}"),
            }
        };
        let mut client = Conn::new(
            client_stream,
            mio::Token(1),
            ConnRole::Upstream,
            db_kind,
        );
        client.state = ConnState::Connected;
        let mut serv = Conn::new(
            server_stream,
            mio::Token(2),
            ConnRole::Downstream,
            db_kind,
        );
        serv.state = ConnState::Connected;
        client.queue_preamble(gid(9), Lid::new(9), NodeType::DISTRIBUTION);
        client.flush().unwrap();
        (client, serv)
    }

    fn stamped_db(tables: usize) -> Arc<SsaDb> {
        let mut db = sample_db(DbId::PATH_DATA, tables, &[Gid::new(5), Gid::new(6)]);
        stamp_epochs(&mut db, None);
        Arc::new(db)
    }

    /// Shuttles frames between the two sides until the puller reports
    /// completion or an iteration budget is exhausted.
    fn pump_pull(client: &mut Conn, serv: &mut Conn, smdb: &Arc<SsaDb>) -> SsaDb {
        let mut transfers_done = 0;
        for _ in 0..500 {
            match serv.recv_frames() {
                Ok(frames) => {
                    for frame in &frames {
                        let action = server::serve_frame(serv, frame, Some(smdb)).unwrap();
                        if action == ServeAction::TransferDone {
                            transfers_done += 1;
                        }
                    }
                }
                Err(crate::CoreError::ConnectionClosed) => {}
                Err(e) => panic!("server recv failed: {e}"),
            }
            serv.flush().unwrap();

            match client.recv_frames() {
                Ok(frames) => {
                    for frame in &frames {
                        match handle_frame(client, frame).unwrap() {
                            PullEvent::Complete(db) => {
                                assert_eq!(transfers_done, 1);
                                return db;
                            }
                            PullEvent::UpdateNotice(_) | PullEvent::None => {}
                        }
                    }
                }
                Err(crate::CoreError::ConnectionClosed) => {}
                Err(e) => panic!("client recv failed: {e}"),
            }
            client.flush().unwrap();
            std::thread::sleep(Duration::from_millis(1));
        }
        panic!("pull did not complete");
    }

    #[test]
    fn full_pull_reproduces_the_database() {
        let smdb = stamped_db(3);
        let (mut client, mut serv) = conn_pair(DbKind::Smdb);

        start_pull(&mut client).unwrap();
        let pulled = pump_pull(&mut client, &mut serv, &smdb);

        assert_eq!(&pulled, smdb.as_ref());
        assert_eq!(pulled.epoch(), smdb.epoch());
        assert_eq!(client.phase, Phase::Idle);
        assert_eq!(serv.phase, Phase::Idle);
        assert!(serv.db.is_none(), "server must release its reference");
    }

    #[test]
    fn re_serving_a_pulled_database_is_lossless() {
        // Round-trip law: pull a database, then serve the pulled copy
        // to a third peer and compare byte-for-byte.
        let smdb = stamped_db(2);
        let (mut client, mut serv) = conn_pair(DbKind::Smdb);
        start_pull(&mut client).unwrap();
        let first = Arc::new(pump_pull(&mut client, &mut serv, &smdb));

        let (mut client2, mut serv2) = conn_pair(DbKind::Smdb);
        start_pull(&mut client2).unwrap();
        let second = pump_pull(&mut client2, &mut serv2, &first);

        assert_eq!(&second, smdb.as_ref());
    }

    #[test]
    fn zero_table_database_pulls_cleanly() {
        let smdb = stamped_db(0);
        let (mut client, mut serv) = conn_pair(DbKind::Smdb);
        start_pull(&mut client).unwrap();
        let pulled = pump_pull(&mut client, &mut serv, &smdb);
        assert_eq!(pulled.table_count(), 0);
    }

    #[test]
    fn update_notice_carries_epoch() {
        let (mut client, mut serv) = conn_pair(DbKind::Smdb);
        server::notify_update(&mut serv, Epoch::new(41)).unwrap();
        serv.flush().unwrap();

        for _ in 0..200 {
            match client.recv_frames() {
                Ok(frames) if !frames.is_empty() => {
                    match handle_frame(&mut client, &frames[0]).unwrap() {
                        PullEvent::UpdateNotice(epoch) => {
                            assert_eq!(epoch, Epoch::new(41));
                            return;
                        }
                        other => panic!("unexpected event {other:?}"),
                    }
                }
                Ok(_) => std::thread::sleep(Duration::from_millis(2)),
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        panic!("notice never arrived");
    }

    #[test]
    fn mismatched_correlation_id_is_fatal() {
        let (mut client, _serv) = conn_pair(DbKind::Smdb);
        start_pull(&mut client).unwrap();

        let mut bogus = Frame::control(ssafab_wire::FrameHeader::new(
            ssafab_wire::FrameClass::Db,
            ReplOp::QueryDef.to_u16(),
            FrameFlags::RESP,
            client.sid + 7,
        ));
        bogus.header.status = 0;
        assert!(matches!(
            handle_frame(&mut client, &bogus),
            Err(CoreError::Protocol(_))
        ));
    }

    #[test]
    fn phase_skip_is_fatal() {
        let (mut client, _serv) = conn_pair(DbKind::Smdb);
        start_pull(&mut client).unwrap();

        // A data-dataset response while still in Defs is a skip.
        let bogus = Frame::control(ssafab_wire::FrameHeader::new(
            ssafab_wire::FrameClass::Db,
            ReplOp::QueryDataDataset.to_u16(),
            FrameFlags::RESP,
            client.sid,
        ));
        assert!(matches!(
            handle_frame(&mut client, &bogus),
            Err(CoreError::Protocol(_))
        ));
    }

    #[test]
    fn server_ignores_out_of_sequence_requests() {
        let smdb = stamped_db(1);
        let (mut client, mut serv) = conn_pair(DbKind::Smdb);

        // Jump straight to a data query without the def phases.
        let frame = client.next_query(ReplOp::QueryDataDataset);
        client.send_frame(&frame).unwrap();

        for _ in 0..200 {
            match serv.recv_frames() {
                Ok(frames) if !frames.is_empty() => {
                    let action = server::serve_frame(&mut serv, &frames[0], Some(&smdb)).unwrap();
                    assert_eq!(action, ServeAction::None);
                    assert_eq!(serv.phase, Phase::Idle);
                    return;
                }
                Ok(_) => std::thread::sleep(Duration::from_millis(2)),
                Err(e) => panic!("recv failed: {e}"),
            }
        }
        panic!("request never arrived");
    }
}
