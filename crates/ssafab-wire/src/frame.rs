//! Frame header layout and incremental decoding.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{WireError, WireResult};

/// Size of the fixed frame header in bytes.
pub const FRAME_HEADER_SIZE: usize = 32;

/// Upper bound on a frame payload. A declared length beyond this is a
/// protocol violation, not an allocation request.
pub const MAX_PAYLOAD_SIZE: usize = 64 * 1024 * 1024;

/// Protocol version carried in every header.
pub const PROTOCOL_VERSION: u8 = 1;

/// Success status.
pub const STATUS_SUCCESS: u16 = 0;

/// Class-specific "no parent available, retry later" status, shifted
/// into the upper byte the way MAD class-specific statuses are.
pub const STATUS_REQ_DENIED: u16 = 1 << 8;

/// Frame class tag. Replication and admin links speak the same header
/// with disjoint opcode spaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Db,
    Admin,
}

impl FrameClass {
    fn to_u8(self) -> u8 {
        match self {
            FrameClass::Db => 0x0A,
            FrameClass::Admin => 0x0B,
        }
    }

    fn from_u8(value: u8) -> WireResult<Self> {
        match value {
            0x0A => Ok(FrameClass::Db),
            0x0B => Ok(FrameClass::Admin),
            other => Err(WireError::BadClass(other)),
        }
    }
}

/// Replication opcodes (class `Db`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplOp {
    QueryDef,
    QueryTblDef,
    QueryTblDefDataset,
    QueryFieldDefDataset,
    QueryDataDataset,
    PublishEpochBuf,
    Update,
}

impl ReplOp {
    pub fn to_u16(self) -> u16 {
        match self {
            ReplOp::QueryDef => 1,
            ReplOp::QueryTblDef => 2,
            ReplOp::QueryTblDefDataset => 3,
            ReplOp::QueryFieldDefDataset => 4,
            ReplOp::QueryDataDataset => 5,
            ReplOp::PublishEpochBuf => 6,
            ReplOp::Update => 7,
        }
    }

    pub fn from_u16(value: u16) -> WireResult<Self> {
        match value {
            1 => Ok(ReplOp::QueryDef),
            2 => Ok(ReplOp::QueryTblDef),
            3 => Ok(ReplOp::QueryTblDefDataset),
            4 => Ok(ReplOp::QueryFieldDefDataset),
            5 => Ok(ReplOp::QueryDataDataset),
            6 => Ok(ReplOp::PublishEpochBuf),
            7 => Ok(ReplOp::Update),
            op => Err(WireError::BadOp {
                class: FrameClass::Db,
                op,
            }),
        }
    }
}

/// Frame flag bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u16);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    /// Set iff the frame is a reply.
    pub const RESP: FrameFlags = FrameFlags(1 << 0);
    /// Terminator of a multi-frame dataset stream.
    pub const END: FrameFlags = FrameFlags(1 << 1);

    pub fn bits(self) -> u16 {
        self.0
    }

    pub fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    pub fn contains(self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for FrameFlags {
    type Output = FrameFlags;

    fn bitor(self, rhs: Self) -> Self::Output {
        FrameFlags(self.0 | rhs.0)
    }
}

/// The fixed header that begins every frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    pub class: FrameClass,
    pub op: u16,
    pub flags: FrameFlags,
    pub status: u16,
    /// Correlation id; a response echoes the request's id.
    pub id: u32,
    /// Length of the peer's mapped RDMA buffer for `PublishEpochBuf`.
    pub rdma_len: u32,
    /// RDMA address field; `Update` notifications carry the new epoch
    /// here.
    pub rdma_addr: u64,
}

impl FrameHeader {
    pub fn new(class: FrameClass, op: u16, flags: FrameFlags, id: u32) -> Self {
        Self {
            class,
            op,
            flags,
            status: STATUS_SUCCESS,
            id,
            rdma_len: 0,
            rdma_addr: 0,
        }
    }

    /// The replication opcode, when this is a `Db` frame.
    pub fn repl_op(&self) -> WireResult<ReplOp> {
        ReplOp::from_u16(self.op)
    }
}

/// A complete frame: header plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub header: FrameHeader,
    pub payload: Bytes,
}

impl Frame {
    pub fn new(header: FrameHeader, payload: Bytes) -> Self {
        Self { header, payload }
    }

    /// Header-only frame.
    pub fn control(header: FrameHeader) -> Self {
        Self {
            header,
            payload: Bytes::new(),
        }
    }

    /// Total length on the wire including the header.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.payload.len()
    }

    /// Appends the encoded frame to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        let h = &self.header;
        buf.reserve(self.wire_len());
        buf.put_u8(PROTOCOL_VERSION);
        buf.put_u8(h.class.to_u8());
        buf.put_u16(h.op);
        buf.put_u32(self.wire_len() as u32);
        buf.put_u16(h.flags.bits());
        buf.put_u16(h.status);
        buf.put_u32(h.id);
        buf.put_u32(0); // reserved
        buf.put_u32(h.rdma_len);
        buf.put_u64(h.rdma_addr);
        buf.put_slice(&self.payload);
    }

    /// Attempts to decode one complete frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` when the buffer does not yet hold a whole
    /// frame. On success the frame's bytes are consumed from `buf`.
    /// Errors indicate a protocol violation; the caller must close the
    /// connection and discard the buffer.
    pub fn decode(buf: &mut BytesMut) -> WireResult<Option<Frame>> {
        if buf.len() < FRAME_HEADER_SIZE {
            return Ok(None);
        }

        // Validate the fixed prefix before trusting the length field.
        let version = buf[0];
        if version != PROTOCOL_VERSION {
            return Err(WireError::BadVersion(version));
        }
        let class = FrameClass::from_u8(buf[1])?;
        let op = u16::from_be_bytes([buf[2], buf[3]]);
        match class {
            FrameClass::Db => {
                ReplOp::from_u16(op)?;
            }
            FrameClass::Admin => {
                crate::AdminOp::from_u16(op)?;
            }
        }

        let total_len = u32::from_be_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if (total_len as usize) < FRAME_HEADER_SIZE
            || (total_len as usize) > FRAME_HEADER_SIZE + MAX_PAYLOAD_SIZE
        {
            return Err(WireError::BadLength(total_len));
        }
        if buf.len() < total_len as usize {
            return Ok(None);
        }

        let mut header_bytes = buf.split_to(FRAME_HEADER_SIZE);
        header_bytes.advance(8); // version, class, op, len already read
        let flags = FrameFlags::from_bits(header_bytes.get_u16());
        let status = header_bytes.get_u16();
        let id = header_bytes.get_u32();
        let _reserved = header_bytes.get_u32();
        let rdma_len = header_bytes.get_u32();
        let rdma_addr = header_bytes.get_u64();

        let payload = buf.split_to(total_len as usize - FRAME_HEADER_SIZE).freeze();

        Ok(Some(Frame {
            header: FrameHeader {
                class,
                op,
                flags,
                status,
                id,
                rdma_len,
                rdma_addr,
            },
            payload,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        let decoded = Frame::decode(&mut buf).unwrap().unwrap();
        assert!(buf.is_empty());
        decoded
    }

    #[test]
    fn header_only_frame_roundtrips() {
        let frame = Frame::control(FrameHeader::new(
            FrameClass::Db,
            ReplOp::QueryDef.to_u16(),
            FrameFlags::END,
            42,
        ));
        assert_eq!(roundtrip(&frame), frame);
        assert_eq!(frame.wire_len(), FRAME_HEADER_SIZE);
    }

    #[test]
    fn update_frame_carries_epoch_in_rdma_addr() {
        let mut header = FrameHeader::new(
            FrameClass::Db,
            ReplOp::Update.to_u16(),
            FrameFlags::END,
            0,
        );
        header.rdma_addr = 0xdead_beef;
        let decoded = roundtrip(&Frame::control(header));
        assert_eq!(decoded.header.rdma_addr, 0xdead_beef);
    }

    #[test]
    fn decode_waits_for_full_frame() {
        let frame = Frame::new(
            FrameHeader::new(
                FrameClass::Db,
                ReplOp::QueryDataDataset.to_u16(),
                FrameFlags::RESP,
                7,
            ),
            Bytes::from(vec![9u8; 100]),
        );
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);

        let mut partial = BytesMut::from(&buf[..FRAME_HEADER_SIZE + 10]);
        assert_eq!(Frame::decode(&mut partial).unwrap(), None);

        partial.extend_from_slice(&buf[FRAME_HEADER_SIZE + 10..]);
        assert_eq!(Frame::decode(&mut partial).unwrap(), Some(frame));
    }

    #[test]
    fn decode_rejects_wrong_version() {
        let frame = Frame::control(FrameHeader::new(
            FrameClass::Db,
            ReplOp::QueryDef.to_u16(),
            FrameFlags::NONE,
            0,
        ));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf[0] = 99;
        assert_eq!(Frame::decode(&mut buf), Err(WireError::BadVersion(99)));
    }

    #[test]
    fn decode_rejects_unknown_opcode() {
        let frame = Frame::control(FrameHeader::new(FrameClass::Db, 1, FrameFlags::NONE, 0));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf[2] = 0xFF;
        buf[3] = 0xFF;
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(WireError::BadOp { .. })
        ));
    }

    #[test]
    fn decode_rejects_oversized_declared_length() {
        let frame = Frame::control(FrameHeader::new(
            FrameClass::Db,
            ReplOp::QueryDef.to_u16(),
            FrameFlags::NONE,
            0,
        ));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf[4..8].copy_from_slice(&u32::MAX.to_be_bytes());
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(WireError::BadLength(_))
        ));
    }

    #[test]
    fn decode_rejects_undersized_declared_length() {
        let frame = Frame::control(FrameHeader::new(
            FrameClass::Db,
            ReplOp::QueryDef.to_u16(),
            FrameFlags::NONE,
            0,
        ));
        let mut buf = BytesMut::new();
        frame.encode(&mut buf);
        buf[4..8].copy_from_slice(&4u32.to_be_bytes());
        assert!(matches!(
            Frame::decode(&mut buf),
            Err(WireError::BadLength(_))
        ));
    }

    #[test]
    fn back_to_back_frames_decode_in_order() {
        let mut buf = BytesMut::new();
        for id in 0..3u32 {
            Frame::new(
                FrameHeader::new(
                    FrameClass::Db,
                    ReplOp::QueryFieldDefDataset.to_u16(),
                    FrameFlags::RESP,
                    id,
                ),
                Bytes::from(vec![id as u8; 4]),
            )
            .encode(&mut buf);
        }
        for id in 0..3u32 {
            let frame = Frame::decode(&mut buf).unwrap().unwrap();
            assert_eq!(frame.header.id, id);
        }
        assert!(buf.is_empty());
    }

    proptest! {
        #[test]
        fn arbitrary_frames_roundtrip(
            op in 1u16..=7,
            flags in 0u16..4,
            status in proptest::arbitrary::any::<u16>(),
            id in proptest::arbitrary::any::<u32>(),
            rdma_len in proptest::arbitrary::any::<u32>(),
            rdma_addr in proptest::arbitrary::any::<u64>(),
            payload in proptest::collection::vec(proptest::arbitrary::any::<u8>(), 0..2048),
        ) {
            let frame = Frame::new(
                FrameHeader {
                    class: FrameClass::Db,
                    op,
                    flags: FrameFlags::from_bits(flags),
                    status,
                    id,
                    rdma_len,
                    rdma_addr,
                },
                Bytes::from(payload),
            );
            let mut buf = BytesMut::new();
            frame.encode(&mut buf);
            prop_assert_eq!(Frame::decode(&mut buf).unwrap(), Some(frame));
            prop_assert!(buf.is_empty());
        }
    }
}
