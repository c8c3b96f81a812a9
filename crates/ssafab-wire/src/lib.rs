//! # ssafab-wire: binary wire protocol
//!
//! Every frame on a replication or admin link starts with the same
//! fixed header; payload bytes follow immediately. All integer fields
//! are big-endian. Replication and admin use disjoint class tags with
//! independent opcode spaces.
//!
//! Decoding is incremental: [`Frame::decode`] consumes a complete frame
//! from a receive buffer or reports that more bytes are needed. A frame
//! with an unknown version, class, or opcode, or with an over-large
//! declared length, is a protocol violation and the connection carrying
//! it must be closed.

mod admin;
mod frame;

pub use admin::{
    AdminOp, ConnInfo, CounterSnapshot, NodeInfo, decode_counters, decode_disconnect,
    decode_node_info, encode_counters, encode_disconnect, encode_node_info,
};
pub use frame::{
    FRAME_HEADER_SIZE, Frame, FrameClass, FrameFlags, FrameHeader, MAX_PAYLOAD_SIZE, ReplOp,
    STATUS_REQ_DENIED, STATUS_SUCCESS,
};

use thiserror::Error;

/// Result type for wire operations.
pub type WireResult<T> = Result<T, WireError>;

/// Errors raised while encoding or decoding frames.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum WireError {
    /// Protocol version byte does not match ours.
    #[error("unsupported protocol version {0}")]
    BadVersion(u8),

    /// Class tag is not a known frame class.
    #[error("unknown frame class 0x{0:x}")]
    BadClass(u8),

    /// Opcode is not defined for the frame's class.
    #[error("unknown opcode 0x{op:x} for class {class:?}")]
    BadOp { class: FrameClass, op: u16 },

    /// Declared total length is shorter than the header or larger than
    /// the frame size cap.
    #[error("invalid declared frame length {0}")]
    BadLength(u32),

    /// A structured payload did not parse.
    #[error("malformed {0} payload")]
    BadPayload(&'static str),
}
