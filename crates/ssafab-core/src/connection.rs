//! Per-socket connection state machine.
//!
//! One [`Conn`] per replication or admin socket: staged non-blocking
//! send and receive buffers, the replication phase cursor, the epoch
//! word, and the peer identity. The replication logic itself lives in
//! [`crate::server`] (downstream side) and [`crate::puller`] (upstream
//! side); this module owns the byte plumbing they share.
//!
//! ## Identification preamble
//!
//! rsockets carry the connector's GID in the address family; TCP does
//! not. Every initiated connection therefore starts with a fixed
//! 24-byte preamble (magic, GID, LID, node type) written by the
//! connector before its first frame. The accepting side parses it
//! before entering frame exchange. An rdmacm-backed transport would
//! take these from the peer address and skip the preamble.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::{Buf, BufMut, BytesMut};
use mio::net::TcpStream;
use mio::{Interest, Token};
use ssafab_db::SsaDb;
use ssafab_types::{Epoch, Gid, Lid, NodeType};
use ssafab_wire::{Frame, FrameFlags, FrameHeader};
use tracing::warn;

use crate::msg::ConnEvent;
use crate::{CoreError, CoreResult};

/// Size of the connection identification preamble.
pub const PREAMBLE_SIZE: usize = 24;

const PREAMBLE_MAGIC: u32 = 0x5353_4146; // "SSAF"

/// Connection role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnRole {
    Upstream,
    Downstream,
    Listen,
}

impl ConnRole {
    pub fn as_u8(self) -> u8 {
        match self {
            ConnRole::Upstream => 0,
            ConnRole::Downstream => 1,
            ConnRole::Listen => 2,
        }
    }
}

/// Database kind bound to a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DbKind {
    None,
    Smdb,
    Prdb,
}

impl DbKind {
    pub fn as_u8(self) -> u8 {
        match self {
            DbKind::None => 0,
            DbKind::Smdb => 1,
            DbKind::Prdb => 2,
        }
    }
}

/// Connection establishment state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Listening,
    Connecting,
    Connected,
}

/// Position within the fixed database-pull frame sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Defs,
    TblDefs,
    FieldDefs,
    Data,
}

/// One replication/admin connection.
pub struct Conn {
    pub stream: TcpStream,
    pub token: Token,
    pub role: ConnRole,
    pub db_kind: DbKind,
    pub state: ConnState,
    pub phase: Phase,

    rbuf: BytesMut,
    sbuf: BytesMut,

    /// Correlation id of the outstanding request (puller side).
    pub sid: u32,
    /// Correlation id of the request currently being served.
    pub rid: u32,
    /// Dataset cursor while pulling.
    pub rindex: usize,
    /// Dataset cursor while serving.
    pub sindex: usize,
    /// Puller: the next dataset response is a descriptor array.
    pub expect_meta: bool,

    /// Server side: the snapshot this connection serves. Held (and so
    /// kept alive) for the whole transfer; swapped only at phase Idle.
    pub db: Option<Arc<SsaDb>>,
    /// Puller side: the snapshot under reconstruction.
    pub build: Option<SsaDb>,

    /// Last epoch this side acted on.
    pub local_epoch: Epoch,
    /// Mirror of the peer-published epoch word.
    pub epoch_word: Epoch,
    /// Server side: peer has mapped its epoch buffer.
    pub epoch_published: bool,
    /// Length the peer declared for its epoch buffer.
    pub epoch_len: u32,

    pub reconnect_count: u32,

    /// Accepting side: identification preamble still outstanding.
    awaiting_preamble: bool,

    pub remote_gid: Gid,
    pub remote_lid: Lid,
    pub remote_node_type: NodeType,
    pub connected_at: SystemTime,
}

impl Conn {
    pub fn new(stream: TcpStream, token: Token, role: ConnRole, db_kind: DbKind) -> Self {
        Self {
            stream,
            token,
            role,
            db_kind,
            state: ConnState::Idle,
            phase: Phase::Idle,
            rbuf: BytesMut::with_capacity(4096),
            sbuf: BytesMut::with_capacity(4096),
            sid: 0,
            rid: 0,
            rindex: 0,
            sindex: 0,
            expect_meta: false,
            db: None,
            build: None,
            local_epoch: Epoch::INVALID,
            epoch_word: Epoch::INVALID,
            epoch_published: false,
            epoch_len: 0,
            reconnect_count: 0,
            awaiting_preamble: role == ConnRole::Downstream,
            remote_gid: Gid::ZERO,
            remote_lid: Lid::default(),
            remote_node_type: NodeType::NONE,
            connected_at: SystemTime::now(),
        }
    }

    /// Queues the connector-side identification preamble.
    pub fn queue_preamble(&mut self, gid: Gid, lid: Lid, node_type: NodeType) {
        self.sbuf.reserve(PREAMBLE_SIZE);
        self.sbuf.put_u32(PREAMBLE_MAGIC);
        self.sbuf.put_slice(&gid.to_bytes());
        self.sbuf.put_u16(lid.as_u16());
        self.sbuf.put_u8(node_type.bits());
        self.sbuf.put_u8(0); // reserved
    }

    /// Whether the accepting side is still waiting for the preamble.
    pub fn awaiting_preamble(&self) -> bool {
        self.awaiting_preamble
    }

    /// Disables preamble parsing for links that don't carry one
    /// (admin clients).
    pub fn skip_preamble(&mut self) {
        self.awaiting_preamble = false;
    }

    /// Queues a frame for sending and pushes as much as the socket
    /// accepts right away.
    pub fn send_frame(&mut self, frame: &Frame) -> CoreResult<()> {
        frame.encode(&mut self.sbuf);
        self.flush()
    }

    /// Writes staged bytes until drained or the socket would block.
    pub fn flush(&mut self) -> CoreResult<()> {
        while !self.sbuf.is_empty() {
            match self.stream.write(&self.sbuf) {
                Ok(0) => {
                    return Err(CoreError::Io(io::Error::new(
                        io::ErrorKind::WriteZero,
                        "zero-length write",
                    )));
                }
                Ok(n) => {
                    self.sbuf.advance(n);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(CoreError::Io(e)),
            }
        }
        Ok(())
    }

    /// Reads whatever the socket has, consuming the preamble when one
    /// is still outstanding, and returns the complete frames received.
    ///
    /// `Err(ConnectionClosed)` reports an orderly peer close; other
    /// errors are protocol violations or transport failures. In every
    /// error case the caller closes the connection.
    pub fn recv_frames(&mut self) -> CoreResult<Vec<Frame>> {
        let mut tmp = [0u8; 4096];
        loop {
            match self.stream.read(&mut tmp) {
                Ok(0) => {
                    if self.rbuf.is_empty() {
                        return Err(CoreError::ConnectionClosed);
                    }
                    // Drain what arrived before the close; the next
                    // read reports the close again.
                    break;
                }
                Ok(n) => self.rbuf.extend_from_slice(&tmp[..n]),
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(ref e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(ref e) if e.kind() == io::ErrorKind::ConnectionReset => {
                    return Err(CoreError::ConnectionClosed);
                }
                Err(e) => return Err(CoreError::Io(e)),
            }
        }

        if self.awaiting_preamble {
            if self.rbuf.len() < PREAMBLE_SIZE {
                return Ok(Vec::new());
            }
            self.take_preamble()?;
        }

        let mut frames = Vec::new();
        while let Some(frame) = Frame::decode(&mut self.rbuf)? {
            frames.push(frame);
        }
        Ok(frames)
    }

    fn take_preamble(&mut self) -> CoreResult<()> {
        let magic = self.rbuf.get_u32();
        if magic != PREAMBLE_MAGIC {
            warn!(token = ?self.token, "bad connection preamble magic 0x{magic:x}");
            return Err(CoreError::ConnectionClosed);
        }
        let mut gid = [0u8; 16];
        self.rbuf.copy_to_slice(&mut gid);
        self.remote_gid = Gid::from_bytes(gid);
        self.remote_lid = Lid::new(self.rbuf.get_u16());
        self.remote_node_type = NodeType::from_bits(self.rbuf.get_u8());
        let _reserved = self.rbuf.get_u8();
        self.awaiting_preamble = false;
        Ok(())
    }

    /// Poll interest for the connection's current buffers.
    pub fn interest(&self) -> Interest {
        if self.sbuf.is_empty() && self.state != ConnState::Connecting {
            Interest::READABLE
        } else {
            Interest::READABLE | Interest::WRITABLE
        }
    }

    pub fn has_pending_send(&self) -> bool {
        !self.sbuf.is_empty()
    }

    /// Builds a header-only query frame with this connection's next
    /// correlation id, advancing the id counter.
    pub fn next_query(&mut self, op: ssafab_wire::ReplOp) -> Frame {
        self.sid = self.sid.wrapping_add(1);
        let mut header = FrameHeader::new(
            ssafab_wire::FrameClass::Db,
            op.to_u16(),
            FrameFlags::END,
            self.sid,
        );
        if op == ssafab_wire::ReplOp::PublishEpochBuf {
            header.rdma_len = 8;
        }
        Frame::control(header)
    }

    /// Connection event for the admin table and access map.
    pub fn event(&self, service: usize) -> ConnEvent {
        ConnEvent {
            service,
            role: self.role,
            db_kind: self.db_kind,
            remote_gid: self.remote_gid,
            remote_lid: self.remote_lid,
            remote_node_type: self.remote_node_type,
            connected_at: self
                .connected_at
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0),
        }
    }
}
