//! Interfaces between replicated stores and the transport.
//!
//! The transport does not know what a map entry looks like. It drives these
//! interfaces instead:
//!
//! - [`Replica`] hands out per-peer [`ModificationIterator`]s and the
//!   last-modification timestamp used to prime them after a reconnect.
//! - [`ModificationIterator`] is a lazy cursor over locally modified entries
//!   not yet shipped to one particular peer.
//! - [`EntryExternalizable`] serializes one entry into an outbound buffer and
//!   applies one entry arriving from a peer.
//! - [`ModificationNotifier`] is how a store wakes the transport when new
//!   dirty entries appear.
//!
//! All of these are object-safe so a store, a channel multiplexer, or a test
//! double can stand behind the same `Arc<dyn ..>`.

use std::sync::Arc;

use bytes::{Bytes, BytesMut};

use crate::types::{ChannelId, NodeId};

// ============================================================================
// Notifier
// ============================================================================

/// Signal that new dirty work exists for a particular peer.
///
/// Implementations must be cheap and non-blocking; they are invoked from
/// whatever thread mutated the store.
pub trait ModificationNotifier: Send + Sync {
    /// Called whenever the associated iterator may have new entries.
    fn on_change(&self);
}

/// Notifier that does nothing.
///
/// Used where a caller must supply a notifier but has no event loop to wake,
/// e.g. when re-priming an iterator from a control message.
#[derive(Debug, Clone, Copy, Default)]
pub struct NopNotifier;

impl ModificationNotifier for NopNotifier {
    fn on_change(&self) {}
}

// ============================================================================
// Iterator
// ============================================================================

/// Receives one entry's raw bytes from a [`ModificationIterator`].
///
/// The transport supplies the callback; it frames the entry into the
/// session's outbound buffer via the configured [`EntryExternalizable`].
pub trait EntryCallback {
    /// Offers one entry for transmission.
    ///
    /// Returns `false` if the entry was declined (nothing was written), in
    /// which case the iterator should move on to its next candidate.
    fn on_entry(&mut self, entry: &[u8], channel: ChannelId) -> bool;
}

/// Per-peer cursor over locally modified entries.
pub trait ModificationIterator: Send + Sync {
    /// Returns true if at least one entry is waiting to be sent.
    fn has_next(&self) -> bool;

    /// Feeds the next dirty entry to `callback`.
    ///
    /// Returns `true` iff the callback was invoked exactly once with entry
    /// bytes it accepted. Declined entries are skipped, not retried.
    fn next_entry(&self, callback: &mut dyn EntryCallback, channel: ChannelId) -> bool;

    /// Re-primes the cursor from every entry modified at or after `since_ms`.
    ///
    /// Issued once per handshake with the peer's bootstrap timestamp, and
    /// again when a rebootstrap is forced.
    fn dirty_entries(&self, since_ms: u64);
}

// ============================================================================
// Externalizable
// ============================================================================

/// Writes and reads one entry's wire representation.
///
/// The transport brackets `write_external_entry` with a length prefix, so an
/// implementation that writes zero bytes declines the entry and nothing goes
/// on the wire. `read_external_entry` receives exactly one entry's payload
/// and must consume it fully.
pub trait EntryExternalizable: Send + Sync {
    /// Serializes `entry` into `dst` starting at its current end.
    fn write_external_entry(&self, entry: &[u8], dst: &mut BytesMut, channel: ChannelId);

    /// Applies one entry received from a peer.
    fn read_external_entry(&self, src: &mut Bytes);
}

// ============================================================================
// Replica
// ============================================================================

/// A locally held copy of a replicated store, as seen by the transport.
pub trait Replica: Send + Sync {
    /// This node's identifier.
    fn identifier(&self) -> NodeId;

    /// Returns the modification iterator tracking `remote`.
    ///
    /// Iterators are cached per remote; the notifier supplied on the most
    /// recent acquisition is the one changes are reported to.
    fn acquire_modification_iterator(
        &self,
        remote: NodeId,
        notifier: Arc<dyn ModificationNotifier>,
    ) -> Arc<dyn ModificationIterator>;

    /// The timestamp of the most recent modification observed from `remote`,
    /// in milliseconds. Echoed to the peer during the handshake so it can
    /// replay only strictly newer entries.
    fn last_modification_time(&self, remote: NodeId) -> u64;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nop_notifier_is_callable() {
        let notifier: Arc<dyn ModificationNotifier> = Arc::new(NopNotifier);
        notifier.on_change();
    }
}
