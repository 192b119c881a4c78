//! Core identifier types for the replication mesh.
//!
//! - [`NodeId`] - one-byte identity of a node in the cluster
//! - [`ChannelId`] - logical stream multiplexed over one connection

use std::fmt::Display;

use serde::{Deserialize, Serialize};

// ============================================================================
// Node Identifier - Copy (single byte)
// ============================================================================

/// Maximum number of addressable nodes.
///
/// Node identifiers occupy `[1, 127]`, so fixed-size per-node tables
/// (key stores, bitmaps) are sized to 128 slots and indexed by the raw byte.
pub const MAX_NODES: usize = 128;

/// Unique identifier for a node in the replication mesh.
///
/// Valid identifiers occupy `[1, 127]`. Zero and the high half of the byte
/// range are reserved so a single signed byte can carry an identifier on the
/// wire with room for an "unknown" sentinel on the far side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(u8);

impl NodeId {
    /// Smallest valid identifier.
    pub const MIN: u8 = 1;

    /// Largest valid identifier.
    pub const MAX: u8 = 127;

    /// Creates a new node identifier.
    ///
    /// # Panics
    ///
    /// Panics if `id` is outside `[1, 127]`. Identifiers come from static
    /// configuration, so an invalid one is a deployment error.
    pub fn new(id: u8) -> Self {
        assert!(
            (Self::MIN..=Self::MAX).contains(&id),
            "node identifier {id} outside [1, 127]"
        );
        Self(id)
    }

    /// Parses an identifier received from the wire.
    ///
    /// Returns `None` for out-of-range bytes instead of panicking; a remote
    /// peer advertising a bad identifier is a protocol error, not a bug here.
    pub fn from_wire(raw: u8) -> Option<Self> {
        if (Self::MIN..=Self::MAX).contains(&raw) {
            Some(Self(raw))
        } else {
            None
        }
    }

    /// Returns the identifier as a `u8`.
    pub fn as_u8(&self) -> u8 {
        self.0
    }

    /// Returns the identifier as a `usize` for indexing per-node tables.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }
}

impl Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl From<NodeId> for u8 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

// ============================================================================
// Channel Identifier - Copy (unsigned 16-bit)
// ============================================================================

/// Default number of channel slots a multiplexer carries.
pub const MAX_CHANNELS: usize = 128;

/// Identifier of a logical replication channel.
///
/// Channel 0 is reserved for in-band control messages; channels from 1 up
/// carry user data. The transport treats the value as opaque except when
/// multiplexing, where it is stop-bit encoded ahead of each entry.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct ChannelId(u16);

impl ChannelId {
    /// The reserved system channel carrying control messages.
    pub const SYSTEM: ChannelId = ChannelId(0);

    /// Creates a new channel identifier.
    pub fn new(id: u16) -> Self {
        Self(id)
    }

    /// Returns the channel identifier as a `u16`.
    pub fn as_u16(&self) -> u16 {
        self.0
    }

    /// Returns the channel identifier as a `usize` for indexing.
    pub fn as_usize(&self) -> usize {
        self.0 as usize
    }

    /// Returns true if this is the reserved system channel.
    pub fn is_system(&self) -> bool {
        self.0 == 0
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ch{}", self.0)
    }
}

impl From<u16> for ChannelId {
    fn from(id: u16) -> Self {
        Self(id)
    }
}

impl From<ChannelId> for u16 {
    fn from(id: ChannelId) -> Self {
        id.0
    }
}
