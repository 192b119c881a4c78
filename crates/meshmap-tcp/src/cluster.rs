//! Channel multiplexer: many logical stores over one transport.
//!
//! A [`ClusterReplicator`] stands between the transport and any number of
//! replicated stores. To the transport it looks like a single [`Replica`]
//! plus [`EntryExternalizable`]; internally it fans entry traffic out to the
//! store attached to each channel, tagging every entry with a stop-bit
//! encoded channel identifier.
//!
//! Channel 0 is a synthetic system queue carrying control messages. The only
//! message today is the bootstrap announcement `{0x42, node, channel,
//! timestamp}` emitted when a channel is attached after peers are already
//! connected; the receiving side replays that channel's entries from the
//! announced timestamp so the late store catches up.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock, Weak};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use crossbeam::queue::SegQueue;
use tracing::{debug, info, warn};

use meshmap_core::{
    ChannelId, Clock, EntryCallback, EntryExternalizable, ModificationIterator,
    ModificationNotifier, NodeId, Replica, SystemClock, MAX_CHANNELS,
};
use meshmap_wire::{get_stop_bit, put_stop_bit, stop_bit_len};

use crate::error::ChannelError;

/// Discriminator byte of a bootstrap announcement.
pub const BOOTSTRAP_MESSAGE: u8 = b'B';

// ============================================================================
// Cluster Replicator
// ============================================================================

/// Fan-in of many channels into one replication stream.
///
/// Cheap to clone; clones share the same channel table. Pass one clone to
/// the transport as the replica and another as the externalizable.
#[derive(Clone)]
pub struct ClusterReplicator {
    shared: Arc<ClusterShared>,
}

impl ClusterReplicator {
    /// Creates a multiplexer with the default channel capacity.
    pub fn new(local: NodeId) -> Self {
        Self::with_clock(local, MAX_CHANNELS, Arc::new(SystemClock))
    }

    /// Creates a multiplexer with an explicit capacity and clock.
    ///
    /// # Panics
    ///
    /// Panics if `max_channels` is zero or larger than [`MAX_CHANNELS`].
    pub fn with_clock(local: NodeId, max_channels: usize, clock: Arc<dyn Clock>) -> Self {
        assert!(
            (1..=MAX_CHANNELS).contains(&max_channels),
            "max_channels {max_channels} outside [1, {MAX_CHANNELS}]"
        );

        let shared = Arc::new_cyclic(|weak: &Weak<ClusterShared>| {
            let mut channels: Vec<Option<ChannelSlot>> = (0..max_channels).map(|_| None).collect();
            channels[ChannelId::SYSTEM.as_usize()] = Some(ChannelSlot {
                replica: Arc::new(SystemReplica {
                    local,
                    shared: Weak::clone(weak),
                }),
                externalizable: Arc::new(SystemExternalizable {
                    shared: Weak::clone(weak),
                }),
            });

            ClusterShared {
                local,
                clock,
                channels: RwLock::new(channels),
                composites: Mutex::new(HashMap::new()),
                system: SystemQueue::default(),
            }
        });

        Self { shared }
    }

    /// Attaches a store to `channel` and announces it to every known peer.
    pub fn attach_channel(
        &self,
        channel: ChannelId,
        replica: Arc<dyn Replica>,
        externalizable: Arc<dyn EntryExternalizable>,
    ) -> Result<(), ChannelError> {
        if channel.is_system() {
            return Err(ChannelError::Reserved);
        }
        {
            let mut channels = self.shared.channels.write().expect("lock poisoned");
            let max = channels.len();
            let Some(slot) = channels.get_mut(channel.as_usize()) else {
                return Err(ChannelError::OutOfRange { id: channel, max });
            };
            if slot.is_some() {
                return Err(ChannelError::InUse(channel));
            }
            *slot = Some(ChannelSlot {
                replica: Arc::clone(&replica),
                externalizable,
            });
        }

        // Peers connected before this channel existed need to know where to
        // resume from; tell each one over the system queue.
        for (peer, queue) in self.shared.system.known_peers() {
            let since_ms = replica.last_modification_time(peer);
            queue.push(bootstrap_message(self.shared.local, channel, since_ms));
        }
        debug!(node = %self.shared.local, %channel, "channel attached");
        Ok(())
    }

    /// Detaches the store on `channel`; later frames for it are skipped.
    pub fn detach_channel(&self, channel: ChannelId) -> Result<(), ChannelError> {
        if channel.is_system() {
            return Err(ChannelError::Reserved);
        }
        let mut channels = self.shared.channels.write().expect("lock poisoned");
        let max = channels.len();
        let Some(slot) = channels.get_mut(channel.as_usize()) else {
            return Err(ChannelError::OutOfRange { id: channel, max });
        };
        if slot.take().is_none() {
            return Err(ChannelError::NotAttached(channel));
        }
        debug!(node = %self.shared.local, %channel, "channel detached");
        Ok(())
    }
}

impl Replica for ClusterReplicator {
    fn identifier(&self) -> NodeId {
        self.shared.local
    }

    fn acquire_modification_iterator(
        &self,
        remote: NodeId,
        notifier: Arc<dyn ModificationNotifier>,
    ) -> Arc<dyn ModificationIterator> {
        let mut composites = self.shared.composites.lock().expect("lock poisoned");
        if let Some(existing) = composites.get(&remote) {
            *existing.notifier.lock().expect("lock poisoned") = notifier;
            return Arc::clone(existing) as Arc<dyn ModificationIterator>;
        }

        let composite = Arc::new(CompositeIterator {
            shared: Arc::downgrade(&self.shared),
            remote,
            notifier: Mutex::new(notifier),
        });
        composites.insert(remote, Arc::clone(&composite));
        composite
    }

    /// The earliest last-modification time across every attached channel, so
    /// a multi-channel bootstrap never skips a lagging store.
    fn last_modification_time(&self, remote: NodeId) -> u64 {
        let mut earliest = self.shared.clock.now_ms();
        for (channel, slot) in self.shared.occupied() {
            if channel.is_system() {
                continue;
            }
            earliest = earliest.min(slot.replica.last_modification_time(remote));
        }
        earliest
    }
}

impl EntryExternalizable for ClusterReplicator {
    fn write_external_entry(&self, entry: &[u8], dst: &mut BytesMut, channel: ChannelId) {
        let Some(slot) = self.shared.slot(channel) else {
            warn!(%channel, "dropping entry for unattached channel");
            return;
        };

        let start = dst.len();
        put_stop_bit(dst, u64::from(channel.as_u16()));
        slot.externalizable.write_external_entry(entry, dst, channel);

        // The store declined; rewind the prefix so nothing hits the wire.
        if dst.len() == start + stop_bit_len(u64::from(channel.as_u16())) {
            dst.truncate(start);
        }
    }

    fn read_external_entry(&self, src: &mut Bytes) {
        let Some(raw) = get_stop_bit(src) else {
            warn!("entry frame missing its channel prefix");
            return;
        };
        let channels = self.shared.channels.read().expect("lock poisoned");
        let max = channels.len();
        if raw >= max as u64 {
            info!(channel = raw, "skipped entry for out-of-range channel");
            return;
        }
        let slot = channels[raw as usize].clone();
        drop(channels);

        match slot {
            Some(slot) => slot
                .externalizable
                .read_external_entry(src),
            None => info!(channel = raw, "skipped entry for unattached channel"),
        }
    }
}

impl fmt::Debug for ClusterReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let attached = self.shared.occupied().len();
        f.debug_struct("ClusterReplicator")
            .field("local", &self.shared.local)
            .field("attached_channels", &attached)
            .finish()
    }
}

// ============================================================================
// Shared State
// ============================================================================

#[derive(Clone)]
struct ChannelSlot {
    replica: Arc<dyn Replica>,
    externalizable: Arc<dyn EntryExternalizable>,
}

struct ClusterShared {
    local: NodeId,
    clock: Arc<dyn Clock>,
    channels: RwLock<Vec<Option<ChannelSlot>>>,
    composites: Mutex<HashMap<NodeId, Arc<CompositeIterator>>>,
    system: SystemQueue,
}

impl ClusterShared {
    /// Snapshot of occupied slots in ascending channel order.
    ///
    /// Cloned out so no lock is held while store code runs.
    fn occupied(&self) -> Vec<(ChannelId, ChannelSlot)> {
        let channels = self.channels.read().expect("lock poisoned");
        channels
            .iter()
            .enumerate()
            .filter_map(|(i, slot)| {
                slot.as_ref()
                    .map(|slot| (ChannelId::new(i as u16), slot.clone()))
            })
            .collect()
    }

    fn slot(&self, channel: ChannelId) -> Option<ChannelSlot> {
        let channels = self.channels.read().expect("lock poisoned");
        channels.get(channel.as_usize()).and_then(Clone::clone)
    }

    /// Handles one frame arriving on the system channel.
    fn on_system_message(&self, src: &mut Bytes) {
        if !src.has_remaining() {
            warn!("empty system message");
            return;
        }
        let kind = src.get_u8();
        if kind == BOOTSTRAP_MESSAGE {
            self.on_bootstrap(src);
        } else {
            info!(kind, "ignored system message of unknown type");
        }
    }

    fn on_bootstrap(&self, src: &mut Bytes) {
        if src.remaining() < 1 + 2 + 8 {
            warn!(remaining = src.remaining(), "truncated bootstrap message");
            return;
        }
        let raw = src.get_u8();
        let channel = ChannelId::new(src.get_u16());
        let since_ms = src.get_u64();

        let Some(remote) = NodeId::from_wire(raw) else {
            warn!(raw, "bootstrap message with invalid node identifier");
            return;
        };

        // The slot may be empty if this node has not attached the channel
        // yet; its own attach will announce back and trigger the replay.
        match self.slot(channel) {
            Some(slot) => {
                debug!(%remote, %channel, since_ms, "bootstrap replay requested");
                slot.replica
                    .acquire_modification_iterator(remote, Arc::new(meshmap_core::NopNotifier))
                    .dirty_entries(since_ms);
            }
            None => debug!(%remote, %channel, "bootstrap for a channel not attached here"),
        }
    }
}

fn bootstrap_message(local: NodeId, channel: ChannelId, since_ms: u64) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + 1 + 2 + 8);
    buf.put_u8(BOOTSTRAP_MESSAGE);
    buf.put_u8(local.as_u8());
    buf.put_u16(channel.as_u16());
    buf.put_u64(since_ms);
    buf.freeze()
}

// ============================================================================
// Composite Iterator
// ============================================================================

/// Round-robin-free scan over every channel's iterator for one peer.
///
/// Channels are visited in ascending identifier order, which keeps the
/// system channel (0) ahead of user data so control messages are never
/// starved.
struct CompositeIterator {
    shared: Weak<ClusterShared>,
    remote: NodeId,
    notifier: Mutex<Arc<dyn ModificationNotifier>>,
}

impl CompositeIterator {
    fn notifier(&self) -> Arc<dyn ModificationNotifier> {
        Arc::clone(&self.notifier.lock().expect("lock poisoned"))
    }
}

impl ModificationIterator for CompositeIterator {
    fn has_next(&self) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let notifier = self.notifier();
        shared.occupied().into_iter().any(|(_, slot)| {
            slot.replica
                .acquire_modification_iterator(self.remote, Arc::clone(&notifier))
                .has_next()
        })
    }

    fn next_entry(&self, callback: &mut dyn EntryCallback, _channel: ChannelId) -> bool {
        let Some(shared) = self.shared.upgrade() else {
            return false;
        };
        let notifier = self.notifier();
        for (channel, slot) in shared.occupied() {
            let iterator = slot
                .replica
                .acquire_modification_iterator(self.remote, Arc::clone(&notifier));
            if iterator.next_entry(callback, channel) {
                return true;
            }
        }
        false
    }

    fn dirty_entries(&self, since_ms: u64) {
        let Some(shared) = self.shared.upgrade() else {
            return;
        };
        let notifier = self.notifier();
        for (_, slot) in shared.occupied() {
            slot.replica
                .acquire_modification_iterator(self.remote, Arc::clone(&notifier))
                .dirty_entries(since_ms);
            notifier.on_change();
        }
    }
}

// ============================================================================
// System Queue (channel 0)
// ============================================================================

/// Per-peer FIFOs of control payloads.
#[derive(Default)]
struct SystemQueue {
    peers: Mutex<HashMap<NodeId, Arc<SystemIterator>>>,
}

impl SystemQueue {
    fn iterator_for(
        &self,
        remote: NodeId,
        notifier: Arc<dyn ModificationNotifier>,
    ) -> Arc<SystemIterator> {
        let mut peers = self.peers.lock().expect("lock poisoned");
        match peers.get(&remote) {
            Some(existing) => {
                *existing.notifier.lock().expect("lock poisoned") = notifier;
                Arc::clone(existing)
            }
            None => {
                let iterator = Arc::new(SystemIterator {
                    payloads: SegQueue::new(),
                    notifier: Mutex::new(notifier),
                });
                peers.insert(remote, Arc::clone(&iterator));
                iterator
            }
        }
    }

    /// Every peer the transport has asked about so far.
    fn known_peers(&self) -> Vec<(NodeId, Arc<SystemIterator>)> {
        let peers = self.peers.lock().expect("lock poisoned");
        peers
            .iter()
            .map(|(id, iterator)| (*id, Arc::clone(iterator)))
            .collect()
    }
}

/// Modification iterator over queued control payloads.
struct SystemIterator {
    payloads: SegQueue<Bytes>,
    notifier: Mutex<Arc<dyn ModificationNotifier>>,
}

impl SystemIterator {
    fn push(&self, payload: Bytes) {
        if payload.is_empty() {
            return;
        }
        self.payloads.push(payload);
        self.notifier.lock().expect("lock poisoned").on_change();
    }
}

impl ModificationIterator for SystemIterator {
    fn has_next(&self) -> bool {
        !self.payloads.is_empty()
    }

    fn next_entry(&self, callback: &mut dyn EntryCallback, channel: ChannelId) -> bool {
        match self.payloads.pop() {
            Some(payload) => {
                callback.on_entry(&payload, channel);
                true
            }
            None => false,
        }
    }

    fn dirty_entries(&self, _since_ms: u64) {
        // Control payloads are transient; there is nothing to replay.
    }
}

/// Replica facade over the system queue, occupying channel slot 0.
struct SystemReplica {
    local: NodeId,
    shared: Weak<ClusterShared>,
}

impl Replica for SystemReplica {
    fn identifier(&self) -> NodeId {
        self.local
    }

    fn acquire_modification_iterator(
        &self,
        remote: NodeId,
        notifier: Arc<dyn ModificationNotifier>,
    ) -> Arc<dyn ModificationIterator> {
        match self.shared.upgrade() {
            Some(shared) => shared.system.iterator_for(remote, notifier),
            None => Arc::new(IdleIterator),
        }
    }

    fn last_modification_time(&self, _remote: NodeId) -> u64 {
        0
    }
}

/// Externalizable facade over the system queue: raw copy out, message
/// dispatch in.
struct SystemExternalizable {
    shared: Weak<ClusterShared>,
}

impl EntryExternalizable for SystemExternalizable {
    fn write_external_entry(&self, entry: &[u8], dst: &mut BytesMut, _channel: ChannelId) {
        dst.put_slice(entry);
    }

    fn read_external_entry(&self, src: &mut Bytes) {
        if let Some(shared) = self.shared.upgrade() {
            shared.on_system_message(src);
        }
    }
}

/// Stands in when the cluster behind a weak reference is gone.
struct IdleIterator;

impl ModificationIterator for IdleIterator {
    fn has_next(&self) -> bool {
        false
    }

    fn next_entry(&self, _callback: &mut dyn EntryCallback, _channel: ChannelId) -> bool {
        false
    }

    fn dirty_entries(&self, _since_ms: u64) {}
}

// ============================================================================
// Tests
// ============================================================================
