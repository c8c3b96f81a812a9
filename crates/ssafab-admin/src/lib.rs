//! # ssafab-admin: operator client for a running node
//!
//! Connects to a node's admin service id and speaks the admin opcode
//! space: `Ping` for liveness, `Counter` for the runtime statistics
//! table, `NodeInfo` for identity and the connection table, and
//! `Disconnect` to drop a misbehaving child. One request at a time over
//! a blocking stream; a node serves a single admin client and a new
//! connection preempts the old one.

use std::io::{Read, Write};
use std::net::{Ipv6Addr, SocketAddr, TcpStream};
use std::time::{Duration, Instant};

use bytes::BytesMut;
use ssafab_types::Gid;
use ssafab_wire::{
    AdminOp, CounterSnapshot, Frame, FrameClass, FrameFlags, FrameHeader, NodeInfo, WireError,
    decode_counters, decode_node_info, encode_disconnect,
};
use thiserror::Error;
use tracing::debug;

/// Result type for admin client operations.
pub type AdminResult<T> = Result<T, AdminError>;

/// Errors raised by the admin client.
#[derive(Debug, Error)]
pub enum AdminError {
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    #[error("wire protocol error: {0}")]
    Wire(#[from] WireError),

    #[error("server closed the connection")]
    Closed,

    #[error("response does not match request (op {op:#x}, id {id:#x})")]
    Mismatch { op: u16, id: u32 },
}

/// Default per-request timeout.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// A connected admin client.
pub struct AdminClient {
    stream: TcpStream,
    rbuf: BytesMut,
    next_id: u32,
}

impl AdminClient {
    /// Connects to the admin service of the node at `gid`.
    pub fn connect(gid: Gid, admin_port: u16) -> AdminResult<Self> {
        let ipv6 = gid.to_ipv6();
        let addr = match ipv6.to_ipv4_mapped() {
            Some(ipv4) => SocketAddr::new(ipv4.into(), admin_port),
            None => SocketAddr::new(Ipv6Addr::from(ipv6).into(), admin_port),
        };
        let stream = TcpStream::connect_timeout(&addr, REQUEST_TIMEOUT)?;
        stream.set_read_timeout(Some(REQUEST_TIMEOUT))?;
        stream.set_nodelay(true)?;
        debug!(%addr, "admin client connected");
        Ok(Self {
            stream,
            rbuf: BytesMut::with_capacity(4096),
            next_id: 1,
        })
    }

    /// Round-trips a header; returns the measured latency.
    pub fn ping(&mut self) -> AdminResult<Duration> {
        let started = Instant::now();
        let reply = self.request(AdminOp::Ping, bytes::Bytes::new())?;
        if !reply.header.flags.contains(FrameFlags::RESP) {
            return Err(AdminError::Mismatch {
                op: reply.header.op,
                id: reply.header.id,
            });
        }
        Ok(started.elapsed())
    }

    /// Fetches the runtime counter table.
    pub fn counters(&mut self) -> AdminResult<CounterSnapshot> {
        let reply = self.request(AdminOp::Counter, bytes::Bytes::new())?;
        Ok(decode_counters(&reply.payload)?)
    }

    /// Fetches node identity, version, epoch, and the connection table.
    pub fn node_info(&mut self) -> AdminResult<NodeInfo> {
        let reply = self.request(AdminOp::NodeInfo, bytes::Bytes::new())?;
        Ok(decode_node_info(&reply.payload)?)
    }

    /// Asks the node to drop every connection from `gid`.
    pub fn disconnect(&mut self, gid: Gid) -> AdminResult<()> {
        self.request(AdminOp::Disconnect, encode_disconnect(gid))?;
        Ok(())
    }

    fn request(&mut self, op: AdminOp, payload: bytes::Bytes) -> AdminResult<Frame> {
        self.next_id = self.next_id.wrapping_add(1);
        let id = self.next_id;
        let frame = Frame::new(
            FrameHeader::new(FrameClass::Admin, op.to_u16(), FrameFlags::END, id),
            payload,
        );
        let mut out = BytesMut::with_capacity(frame.wire_len());
        frame.encode(&mut out);
        self.stream.write_all(&out)?;

        loop {
            if let Some(reply) = Frame::decode(&mut self.rbuf)? {
                if reply.header.op != op.to_u16() || reply.header.id != id {
                    return Err(AdminError::Mismatch {
                        op: reply.header.op,
                        id: reply.header.id,
                    });
                }
                return Ok(reply);
            }
            let mut tmp = [0u8; 4096];
            let n = self.stream.read(&mut tmp)?;
            if n == 0 {
                return Err(AdminError::Closed);
            }
            self.rbuf.extend_from_slice(&tmp[..n]);
        }
    }
}
