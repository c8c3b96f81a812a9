//! # ssafab-types: Core types for the `ssafab` distribution fabric
//!
//! This crate contains the shared scalar types used across the system:
//! - Port identifiers ([`Gid`], [`Lid`], [`Pkey`])
//! - Node roles ([`NodeType`] bitmask)
//! - Database versioning ([`Epoch`], [`DbId`])

use std::fmt::{self, Debug, Display};
use std::net::Ipv6Addr;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

// ============================================================================
// Port identity - All Copy (cheap fixed-size values)
// ============================================================================

/// 128-bit global port identifier.
///
/// The GID is the canonical node identity everywhere in the fabric. The
/// transport maps it 1:1 onto an IPv6 address for service addressing.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Gid(u128);

impl Gid {
    /// The all-zero GID, used as "no parent" in membership records.
    pub const ZERO: Gid = Gid(0);

    pub const fn new(value: u128) -> Self {
        Self(value)
    }

    /// Builds a GID from its 16-byte big-endian wire representation.
    pub fn from_bytes(raw: [u8; 16]) -> Self {
        Self(u128::from_be_bytes(raw))
    }

    /// Returns the 16-byte big-endian wire representation.
    pub fn to_bytes(self) -> [u8; 16] {
        self.0.to_be_bytes()
    }

    pub fn is_zero(self) -> bool {
        self.0 == 0
    }

    /// The IPv6 address this GID maps to for rsocket addressing.
    pub fn to_ipv6(self) -> Ipv6Addr {
        Ipv6Addr::from(self.0)
    }

    pub fn from_ipv6(addr: Ipv6Addr) -> Self {
        Self(u128::from(addr))
    }
}

impl Display for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Display::fmt(&self.to_ipv6(), f)
    }
}

impl Debug for Gid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Gid({})", self.to_ipv6())
    }
}

impl From<u128> for Gid {
    fn from(value: u128) -> Self {
        Self(value)
    }
}

impl From<Gid> for u128 {
    fn from(gid: Gid) -> Self {
        gid.0
    }
}

impl From<Ipv6Addr> for Gid {
    fn from(addr: Ipv6Addr) -> Self {
        Self::from_ipv6(addr)
    }
}

/// 16-bit local identifier. Routing metadata only; may change on subnet
/// reconfiguration while the GID stays fixed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Lid(u16);

impl Lid {
    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl Display for Lid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u16> for Lid {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl From<Lid> for u16 {
    fn from(lid: Lid) -> Self {
        lid.0
    }
}

/// 16-bit partition key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Pkey(u16);

impl Pkey {
    /// The default (full-membership) partition.
    pub const DEFAULT: Pkey = Pkey(0xFFFF);

    pub const fn new(value: u16) -> Self {
        Self(value)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }
}

impl Default for Pkey {
    fn default() -> Self {
        Self::DEFAULT
    }
}

impl Display for Pkey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

// ============================================================================
// Node roles
// ============================================================================

/// Node-role bitmask.
///
/// A node is one of the base roles or one of the two supported
/// combinations (`CORE | ACCESS`, `DISTRIBUTION | ACCESS`). The mask is
/// immutable for a member's lifetime.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub struct NodeType(u8);

impl NodeType {
    pub const NONE: NodeType = NodeType(0);
    pub const CORE: NodeType = NodeType(1 << 0);
    pub const DISTRIBUTION: NodeType = NodeType(1 << 1);
    pub const ACCESS: NodeType = NodeType(1 << 2);
    pub const CONSUMER: NodeType = NodeType(1 << 3);

    pub const fn from_bits(bits: u8) -> Self {
        Self(bits)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: NodeType) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: NodeType) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn union(self, other: NodeType) -> Self {
        Self(self.0 | other.0)
    }

    /// Human-readable role name, matching the operator-facing spelling.
    pub fn name(self) -> &'static str {
        match self.0 {
            x if x == Self::CORE.0 => "core",
            x if x == Self::DISTRIBUTION.0 => "distribution",
            x if x == Self::ACCESS.0 => "access",
            x if x == Self::CONSUMER.0 => "consumer",
            x if x == Self::CORE.0 | Self::ACCESS.0 => "core+access",
            x if x == Self::DISTRIBUTION.0 | Self::ACCESS.0 => "distribution+access",
            0 => "none",
            _ => "unknown",
        }
    }
}

impl std::ops::BitOr for NodeType {
    type Output = NodeType;

    fn bitor(self, rhs: Self) -> Self::Output {
        self.union(rhs)
    }
}

impl Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Debug for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeType({})", self.name())
    }
}

/// Error returned when parsing an operator-supplied node type string.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown node type {0:?} (expected \"core\" or \"combined\")")]
pub struct NodeTypeParseError(pub String);

impl FromStr for NodeType {
    type Err = NodeTypeParseError;

    /// Parses the `node_type` config value. Only the daemon-side roles are
    /// spelled in config; `combined` means core+access.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "core" => Ok(NodeType::CORE),
            "combined" => Ok(NodeType::CORE | NodeType::ACCESS),
            other => Err(NodeTypeParseError(other.to_string())),
        }
    }
}

// ============================================================================
// Database versioning
// ============================================================================

/// Monotonic 64-bit database version counter.
///
/// `0` is reserved as INVALID; increments wrap past it.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct Epoch(u64);

impl Epoch {
    /// The reserved "no epoch" value.
    pub const INVALID: Epoch = Epoch(0);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self.0 != 0
    }

    /// The successor epoch, skipping INVALID on wrap.
    pub fn next(self) -> Epoch {
        let mut v = self.0.wrapping_add(1);
        if v == 0 {
            v = 1;
        }
        Epoch(v)
    }
}

impl Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl From<u64> for Epoch {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<Epoch> for u64 {
    fn from(epoch: Epoch) -> Self {
        epoch.0
    }
}

/// Service/database identifier carried in membership records. One
/// replication service per (port, database id).
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct DbId(u64);

impl DbId {
    /// The path-record database every service in this fabric replicates.
    pub const PATH_DATA: DbId = DbId(2);

    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl Display for DbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl From<u64> for DbId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test]
    fn gid_roundtrips_through_bytes_and_ipv6() {
        let gid = Gid::new(0xfe80_0000_0000_0000_0002_c903_0001_2345);
        assert_eq!(Gid::from_bytes(gid.to_bytes()), gid);
        assert_eq!(Gid::from_ipv6(gid.to_ipv6()), gid);
    }

    #[test]
    fn zero_gid_means_no_parent() {
        assert!(Gid::ZERO.is_zero());
        assert!(!Gid::new(1).is_zero());
        assert_eq!(Gid::default(), Gid::ZERO);
    }

    #[test_case("core", NodeType::CORE; "plain core")]
    #[test_case("combined", NodeType::CORE | NodeType::ACCESS; "combined core access")]
    #[test_case("Core", NodeType::CORE; "case insensitive")]
    fn node_type_parses_config_values(input: &str, expected: NodeType) {
        assert_eq!(input.parse::<NodeType>().unwrap(), expected);
    }

    #[test]
    fn node_type_rejects_unknown_values() {
        assert!("consumer".parse::<NodeType>().is_err());
        assert!("".parse::<NodeType>().is_err());
    }

    #[test]
    fn node_type_mask_operations() {
        let combined = NodeType::DISTRIBUTION | NodeType::ACCESS;
        assert!(combined.contains(NodeType::ACCESS));
        assert!(combined.intersects(NodeType::DISTRIBUTION));
        assert!(!combined.contains(NodeType::CORE));
        assert_eq!(combined.name(), "distribution+access");
    }

    #[test]
    fn epoch_increment_skips_invalid() {
        assert_eq!(Epoch::new(1).next(), Epoch::new(2));
        assert_eq!(Epoch::new(u64::MAX).next(), Epoch::new(1));
        assert!(!Epoch::INVALID.is_valid());
        assert!(Epoch::INVALID.next().is_valid());
    }
}
