//! Admin opcode space and structured payload codecs.
//!
//! Admin frames reuse the replication header with the `Admin` class
//! tag. `Ping` round-trips the header; the other operations carry the
//! payloads encoded here, all big-endian.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use ssafab_types::{Epoch, Gid, Lid, NodeType};

use crate::{FrameClass, WireError, WireResult};

/// Admin opcodes (class `Admin`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdminOp {
    Ping,
    Counter,
    NodeInfo,
    Disconnect,
}

impl AdminOp {
    pub fn to_u16(self) -> u16 {
        match self {
            AdminOp::Ping => 1,
            AdminOp::Counter => 2,
            AdminOp::NodeInfo => 3,
            AdminOp::Disconnect => 4,
        }
    }

    pub fn from_u16(value: u16) -> WireResult<Self> {
        match value {
            1 => Ok(AdminOp::Ping),
            2 => Ok(AdminOp::Counter),
            3 => Ok(AdminOp::NodeInfo),
            4 => Ok(AdminOp::Disconnect),
            op => Err(WireError::BadOp {
                class: FrameClass::Admin,
                op,
            }),
        }
    }
}

/// Snapshot of the runtime counter table, stamped with the database
/// epoch current at snapshot time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CounterSnapshot {
    pub epoch: Epoch,
    /// Values indexed by counter id.
    pub values: Vec<u64>,
}

pub fn encode_counters(snapshot: &CounterSnapshot) -> Bytes {
    let mut buf = BytesMut::with_capacity(10 + snapshot.values.len() * 8);
    buf.put_u64(snapshot.epoch.as_u64());
    buf.put_u16(snapshot.values.len() as u16);
    for value in &snapshot.values {
        buf.put_u64(*value);
    }
    buf.freeze()
}

pub fn decode_counters(mut payload: &[u8]) -> WireResult<CounterSnapshot> {
    if payload.len() < 10 {
        return Err(WireError::BadPayload("counter"));
    }
    let epoch = Epoch::new(payload.get_u64());
    let count = payload.get_u16() as usize;
    if payload.len() != count * 8 {
        return Err(WireError::BadPayload("counter"));
    }
    let values = (0..count).map(|_| payload.get_u64()).collect();
    Ok(CounterSnapshot { epoch, values })
}

/// One entry of the node-info connection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnInfo {
    /// Connection role: 0 upstream, 1 downstream, 2 listen.
    pub conn_type: u8,
    /// Database kind: 0 none, 1 SMDB, 2 PRDB.
    pub db_kind: u8,
    pub remote_node_type: NodeType,
    pub remote_lid: Lid,
    pub remote_gid: Gid,
    /// Seconds since the Unix epoch at which the connection was made.
    pub connected_at: u64,
}

/// Node-info response payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeInfo {
    pub node_type: NodeType,
    pub version: String,
    pub db_epoch: Epoch,
    pub connections: Vec<ConnInfo>,
}

pub fn encode_node_info(info: &NodeInfo) -> Bytes {
    let version = info.version.as_bytes();
    let mut buf = BytesMut::with_capacity(16 + version.len() + info.connections.len() * 40);
    buf.put_u8(info.node_type.bits());
    buf.put_u8(version.len() as u8);
    buf.put_slice(version);
    buf.put_u64(info.db_epoch.as_u64());
    buf.put_u16(info.connections.len() as u16);
    for conn in &info.connections {
        buf.put_u8(conn.conn_type);
        buf.put_u8(conn.db_kind);
        buf.put_u8(conn.remote_node_type.bits());
        buf.put_u8(0); // reserved
        buf.put_u16(conn.remote_lid.as_u16());
        buf.put_slice(&conn.remote_gid.to_bytes());
        buf.put_u64(conn.connected_at);
    }
    buf.freeze()
}

pub fn decode_node_info(mut payload: &[u8]) -> WireResult<NodeInfo> {
    if payload.len() < 2 {
        return Err(WireError::BadPayload("nodeinfo"));
    }
    let node_type = NodeType::from_bits(payload.get_u8());
    let version_len = payload.get_u8() as usize;
    if payload.len() < version_len + 10 {
        return Err(WireError::BadPayload("nodeinfo"));
    }
    let version = String::from_utf8(payload[..version_len].to_vec())
        .map_err(|_| WireError::BadPayload("nodeinfo"))?;
    payload.advance(version_len);
    let db_epoch = Epoch::new(payload.get_u64());
    let count = payload.get_u16() as usize;
    if payload.len() != count * 30 {
        return Err(WireError::BadPayload("nodeinfo"));
    }
    let mut connections = Vec::with_capacity(count);
    for _ in 0..count {
        let conn_type = payload.get_u8();
        let db_kind = payload.get_u8();
        let remote_node_type = NodeType::from_bits(payload.get_u8());
        let _reserved = payload.get_u8();
        let remote_lid = Lid::new(payload.get_u16());
        let mut gid = [0u8; 16];
        payload.copy_to_slice(&mut gid);
        let connected_at = payload.get_u64();
        connections.push(ConnInfo {
            conn_type,
            db_kind,
            remote_node_type,
            remote_lid,
            remote_gid: Gid::from_bytes(gid),
            connected_at,
        });
    }
    Ok(NodeInfo {
        node_type,
        version,
        db_epoch,
        connections,
    })
}

/// Disconnect request payload: the GID whose connection should be
/// dropped.
pub fn encode_disconnect(gid: Gid) -> Bytes {
    Bytes::copy_from_slice(&gid.to_bytes())
}

pub fn decode_disconnect(payload: &[u8]) -> WireResult<Gid> {
    let raw: [u8; 16] = payload
        .try_into()
        .map_err(|_| WireError::BadPayload("disconnect"))?;
    Ok(Gid::from_bytes(raw))
}
