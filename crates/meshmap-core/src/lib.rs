//! # meshmap-core: shared types and interfaces
//!
//! This crate defines the vocabulary shared by replicated stores and the
//! transports that connect them:
//!
//! - [`NodeId`] / [`ChannelId`]: identities of nodes and logical streams
//! - [`Clock`]: replaceable wall-clock source
//! - [`Replica`], [`ModificationIterator`], [`EntryExternalizable`],
//!   [`ModificationNotifier`]: the seam between a store and a transport
//!
//! Convergence across the mesh is last-writer-wins: each entry carries a
//! wall-clock timestamp, ties broken by originating node identifier. The
//! transport never inspects entry bytes; it only moves them.

pub mod clock;
pub mod replica;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock};
pub use replica::{
    EntryCallback, EntryExternalizable, ModificationIterator, ModificationNotifier, NopNotifier,
    Replica,
};
pub use types::{ChannelId, NodeId, MAX_CHANNELS, MAX_NODES};
