//! # ssafab-mad: management-datagram surface
//!
//! The out-of-band control plane used for tree discovery: nodes join and
//! leave by sending `MemberRecord` datagrams to the core, the core
//! installs parents by sending `InfoRecord`s back, and path resolution
//! goes through SA-style path-record queries. The datagram transport
//! itself (umad) is outside this workspace; [`MadPort`] is the seam, and
//! [`LoopbackFabric`] provides the in-process implementation used by
//! tests and simulations.

mod loopback;
mod record;

pub use loopback::{LoopbackFabric, LoopbackPort};
pub use record::{InfoRecord, MemberRecord, PathRecord};

use ssafab_types::Lid;
use thiserror::Error;

/// SSA management class.
pub const MAD_CLASS_SSA: u8 = 0x2C;

/// SSA class version.
pub const MAD_CLASS_VERSION: u8 = 1;

/// Class-specific status: no parent available yet, retry later.
/// Class-specific statuses occupy the upper byte of the MAD status.
pub const MAD_STATUS_REQ_DENIED: u16 = 1 << 8;

/// Result type for MAD operations.
pub type MadResult<T> = Result<T, MadError>;

/// Errors raised by a MAD transport.
#[derive(Debug, Error)]
pub enum MadError {
    /// The port was shut down.
    #[error("MAD port closed")]
    PortClosed,
}

/// MAD methods used by the fabric.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MadMethod {
    Get,
    Set,
    GetResp,
    Delete,
    DeleteResp,
}

impl MadMethod {
    pub fn to_u8(self) -> u8 {
        match self {
            MadMethod::Get => 0x01,
            MadMethod::Set => 0x02,
            MadMethod::GetResp => 0x81,
            MadMethod::Delete => 0x15,
            MadMethod::DeleteResp => 0x95,
        }
    }

    /// Response methods have the response bit set.
    pub fn is_response(self) -> bool {
        matches!(self, MadMethod::GetResp | MadMethod::DeleteResp)
    }
}

/// Attribute payload of a datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MadAttr {
    /// 0x1000: join/leave membership record.
    Member(MemberRecord),
    /// 0x1001: parent installation record.
    Info(InfoRecord),
    /// SA path-record query/response used to resolve the child→parent
    /// path during attach.
    Path(PathRecord),
}

impl MadAttr {
    pub fn attr_id(&self) -> u16 {
        match self {
            MadAttr::Member(_) => 0x1000,
            MadAttr::Info(_) => 0x1001,
            MadAttr::Path(_) => 0x0035,
        }
    }
}

/// One management datagram.
///
/// `local_status` mirrors umad's transport-level status: nonzero means
/// the stack could not deliver a previous send (ack timeout) and this
/// datagram is the local failure echo, not a peer message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mad {
    pub from: Lid,
    pub to: Lid,
    pub method: MadMethod,
    /// MAD-level status; class-specific codes are shifted into the
    /// upper byte.
    pub status: u16,
    /// Transport-level status (0 = delivered).
    pub local_status: u16,
    /// Transaction id. The high 16 bits carry the sending service's
    /// index so the supervisor can dispatch responses.
    pub tid: u64,
    pub attr: MadAttr,
}

impl Mad {
    /// Builds a request datagram.
    pub fn request(from: Lid, to: Lid, method: MadMethod, tid: u64, attr: MadAttr) -> Self {
        Self {
            from,
            to,
            method,
            status: 0,
            local_status: 0,
            tid,
            attr,
        }
    }

    /// Builds the response to this datagram, echoing tid and attribute.
    pub fn response(&self, method: MadMethod, status: u16, attr: MadAttr) -> Self {
        Self {
            from: self.to,
            to: self.from,
            method,
            status,
            local_status: 0,
            tid: self.tid,
            attr,
        }
    }
}

/// Encodes a transaction id carrying the originating service index in
/// the high 16 bits.
pub fn encode_tid(service_index: u16, seq: u64) -> u64 {
    (u64::from(service_index) << 48) | (seq & 0xFFFF_FFFF_FFFF)
}

/// Extracts the service index from a transaction id.
pub fn tid_service_index(tid: u64) -> u16 {
    (tid >> 48) as u16
}

/// The datagram transport seam.
///
/// A real deployment backs this with the umad stack; tests and
/// simulations use [`LoopbackFabric`]. Delivery notification is by
/// callback so a poll-based owner can register its waker.
pub trait MadPort: Send {
    /// Queues a datagram for delivery. Delivery failure surfaces as a
    /// local failure echo on the sender's receive side, matching umad
    /// retry semantics.
    fn send(&self, mad: Mad) -> MadResult<()>;

    /// Takes the next received datagram, if any.
    fn try_recv(&self) -> Option<Mad>;

    /// Registers a callback invoked whenever a datagram is delivered to
    /// this port.
    fn set_notifier(&self, notify: Box<dyn Fn() + Send + Sync>);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tid_encoding_keeps_service_index() {
        let tid = encode_tid(7, 0x1234);
        assert_eq!(tid_service_index(tid), 7);
        assert_eq!(tid & 0xFFFF_FFFF_FFFF, 0x1234);
    }

    #[test]
    fn tid_sequence_wraps_without_touching_index() {
        let tid = encode_tid(0xFFFF, u64::MAX);
        assert_eq!(tid_service_index(tid), 0xFFFF);
    }

    #[test]
    fn response_swaps_addressing_and_echoes_tid() {
        let req = Mad::request(
            Lid::new(5),
            Lid::new(1),
            MadMethod::Set,
            encode_tid(0, 9),
            MadAttr::Member(MemberRecord::default()),
        );
        let resp = req.response(
            MadMethod::GetResp,
            MAD_STATUS_REQ_DENIED,
            req.attr.clone(),
        );
        assert_eq!(resp.from, Lid::new(1));
        assert_eq!(resp.to, Lid::new(5));
        assert_eq!(resp.tid, req.tid);
        assert_eq!(resp.status, MAD_STATUS_REQ_DENIED);
    }
}
