//! Multi-node scenarios over loopback sockets.
//!
//! `TestMap` is a minimal last-writer-wins map implementing the store-side
//! interfaces: puts enqueue the key on every peer's iterator, applies follow
//! timestamp-then-identifier ordering, and `dirty_entries` rebuilds a peer's
//! backlog from the store. Each test wires real replicators on ephemeral
//! ports and waits for convergence with a deadline.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;
use std::time::{Duration, Instant};

use bytes::{Buf, BufMut, Bytes, BytesMut};

use meshmap_core::{
    ChannelId, Clock, EntryCallback, EntryExternalizable, ModificationIterator,
    ModificationNotifier, NodeId, Replica, SystemClock,
};

use crate::cluster::ClusterReplicator;
use crate::config::ReplicationConfig;
use crate::replicator::TcpReplicator;

const HEARTBEAT: Duration = Duration::from_millis(500);
const CONVERGE: Duration = Duration::from_secs(10);

// ============================================================================
// In-memory LWW map
// ============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
struct Stored {
    value: String,
    timestamp_ms: u64,
    origin: NodeId,
}

struct MapState {
    id: NodeId,
    clock: Arc<dyn Clock>,
    entries: Mutex<HashMap<String, Stored>>,
    iterators: Mutex<HashMap<NodeId, Arc<MapIterator>>>,
    /// Last modification timestamp observed from each remote.
    observed: Mutex<HashMap<NodeId, u64>>,
    entry_reads: AtomicUsize,
}

/// Replicated map double: puts win by timestamp, then by origin identifier.
#[derive(Clone)]
struct TestMap {
    state: Arc<MapState>,
}

impl TestMap {
    fn new(id: u8) -> Self {
        Self {
            state: Arc::new(MapState {
                id: NodeId::new(id),
                clock: Arc::new(SystemClock),
                entries: Mutex::new(HashMap::new()),
                iterators: Mutex::new(HashMap::new()),
                observed: Mutex::new(HashMap::new()),
                entry_reads: AtomicUsize::new(0),
            }),
        }
    }

    fn put(&self, key: &str, value: &str) {
        let stored = Stored {
            value: value.to_string(),
            timestamp_ms: self.state.clock.now_ms(),
            origin: self.state.id,
        };
        self.state
            .entries
            .lock()
            .unwrap()
            .insert(key.to_string(), stored);

        let iterators: Vec<Arc<MapIterator>> = self
            .state
            .iterators
            .lock()
            .unwrap()
            .values()
            .cloned()
            .collect();
        for iterator in iterators {
            iterator.enqueue(key);
        }
    }

    fn get(&self, key: &str) -> Option<String> {
        self.state
            .entries
            .lock()
            .unwrap()
            .get(key)
            .map(|stored| stored.value.clone())
    }

    fn entry_reads(&self) -> usize {
        self.state.entry_reads.load(Ordering::Relaxed)
    }

    fn serialize(key: &str, stored: &Stored) -> Vec<u8> {
        let mut buf = BytesMut::new();
        buf.put_u16(key.len() as u16);
        buf.put_slice(key.as_bytes());
        buf.put_u16(stored.value.len() as u16);
        buf.put_slice(stored.value.as_bytes());
        buf.put_u64(stored.timestamp_ms);
        buf.put_u8(stored.origin.as_u8());
        buf.to_vec()
    }
}

struct MapIterator {
    state: Weak<MapState>,
    pending: Mutex<VecDeque<String>>,
    notifier: Mutex<Arc<dyn ModificationNotifier>>,
}

impl MapIterator {
    fn enqueue(&self, key: &str) {
        self.pending.lock().unwrap().push_back(key.to_string());
        self.notifier.lock().unwrap().on_change();
    }
}

impl ModificationIterator for MapIterator {
    fn has_next(&self) -> bool {
        !self.pending.lock().unwrap().is_empty()
    }

    fn next_entry(&self, callback: &mut dyn EntryCallback, channel: ChannelId) -> bool {
        let Some(state) = self.state.upgrade() else {
            return false;
        };
        loop {
            let Some(key) = self.pending.lock().unwrap().pop_front() else {
                return false;
            };
            let Some(stored) = state.entries.lock().unwrap().get(&key).cloned() else {
                continue;
            };
            let bytes = TestMap::serialize(&key, &stored);
            if callback.on_entry(&bytes, channel) {
                return true;
            }
        }
    }

    fn dirty_entries(&self, since_ms: u64) {
        let Some(state) = self.state.upgrade() else {
            return;
        };
        let entries = state.entries.lock().unwrap();
        let mut keys: Vec<&String> = entries
            .iter()
            .filter(|(_, stored)| stored.origin == state.id && stored.timestamp_ms >= since_ms)
            .map(|(key, _)| key)
            .collect();
        keys.sort();

        let mut pending = self.pending.lock().unwrap();
        pending.clear();
        pending.extend(keys.into_iter().cloned());
    }
}

impl Replica for TestMap {
    fn identifier(&self) -> NodeId {
        self.state.id
    }

    fn acquire_modification_iterator(
        &self,
        remote: NodeId,
        notifier: Arc<dyn ModificationNotifier>,
    ) -> Arc<dyn ModificationIterator> {
        let mut iterators = self.state.iterators.lock().unwrap();
        match iterators.get(&remote) {
            Some(existing) => {
                *existing.notifier.lock().unwrap() = notifier;
                Arc::clone(existing) as Arc<dyn ModificationIterator>
            }
            None => {
                let iterator = Arc::new(MapIterator {
                    state: Arc::downgrade(&self.state),
                    pending: Mutex::new(VecDeque::new()),
                    notifier: Mutex::new(notifier),
                });
                iterators.insert(remote, Arc::clone(&iterator));
                iterator
            }
        }
    }

    fn last_modification_time(&self, remote: NodeId) -> u64 {
        self.state
            .observed
            .lock()
            .unwrap()
            .get(&remote)
            .copied()
            .unwrap_or(0)
    }
}

impl EntryExternalizable for TestMap {
    fn write_external_entry(&self, entry: &[u8], dst: &mut BytesMut, _channel: ChannelId) {
        dst.put_slice(entry);
    }

    fn read_external_entry(&self, src: &mut Bytes) {
        if src.remaining() < 2 {
            return;
        }
        let key_len = src.get_u16() as usize;
        if src.remaining() < key_len + 2 {
            return;
        }
        let key = String::from_utf8_lossy(&src.copy_to_bytes(key_len)).into_owned();
        let value_len = src.get_u16() as usize;
        if src.remaining() < value_len + 8 + 1 {
            return;
        }
        let value = String::from_utf8_lossy(&src.copy_to_bytes(value_len)).into_owned();
        let timestamp_ms = src.get_u64();
        let Some(origin) = NodeId::from_wire(src.get_u8()) else {
            return;
        };

        self.state.entry_reads.fetch_add(1, Ordering::Relaxed);
        {
            let mut observed = self.state.observed.lock().unwrap();
            let seen = observed.entry(origin).or_insert(0);
            *seen = (*seen).max(timestamp_ms);
        }

        let mut entries = self.state.entries.lock().unwrap();
        let incoming = Stored {
            value,
            timestamp_ms,
            origin,
        };
        match entries.get(&key) {
            Some(current)
                if (current.timestamp_ms, current.origin.as_u8())
                    >= (timestamp_ms, origin.as_u8()) => {}
            _ => {
                entries.insert(key, incoming);
            }
        }
    }
}

// ============================================================================
// Harness
// ============================================================================

fn server_config() -> ReplicationConfig {
    ReplicationConfig::new()
        .with_listen("127.0.0.1:0".parse().unwrap())
        .with_heartbeat_interval(HEARTBEAT)
        .with_packet_size(8 * 1024)
        .with_max_entry_size(1024)
}

fn client_config(server: std::net::SocketAddr) -> ReplicationConfig {
    ReplicationConfig::new()
        .with_endpoint(server)
        .with_heartbeat_interval(HEARTBEAT)
        .with_packet_size(8 * 1024)
        .with_max_entry_size(1024)
}

fn wait_for(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + CONVERGE;
    while Instant::now() < deadline {
        if condition() {
            return;
        }
        thread::sleep(Duration::from_millis(10));
    }
    panic!("timed out waiting for {what}");
}

fn start_server(map: &TestMap) -> TcpReplicator {
    TcpReplicator::new(
        Arc::new(map.clone()),
        Arc::new(map.clone()),
        server_config(),
    )
    .expect("server replicator")
}

fn start_client(map: &TestMap, server: std::net::SocketAddr) -> TcpReplicator {
    TcpReplicator::new(
        Arc::new(map.clone()),
        Arc::new(map.clone()),
        client_config(server),
    )
    .expect("client replicator")
}

// ============================================================================
// Scenarios
// ============================================================================

#[test]
fn put_replicates_between_two_nodes() {
    let map_a = TestMap::new(1);
    let map_b = TestMap::new(2);

    let server = start_server(&map_a);
    let addr = server.local_addr().expect("bound address");
    let client = start_client(&map_b, addr);

    map_b.put("a", "1");
    wait_for("entry to reach the server", || {
        map_a.get("a") == Some("1".to_string())
    });

    // And the other direction over the same socket.
    map_a.put("b", "2");
    wait_for("entry to reach the client", || {
        map_b.get("b") == Some("2".to_string())
    });

    client.close();
    server.close();
}

#[test]
fn entries_put_before_connecting_replay_from_bootstrap() {
    let map_a = TestMap::new(1);
    let map_b = TestMap::new(2);

    map_b.put("early-1", "x");
    map_b.put("early-2", "y");

    let server = start_server(&map_a);
    let client = start_client(&map_b, server.local_addr().expect("bound address"));

    wait_for("pre-connect entries to replay", || {
        map_a.get("early-1") == Some("x".to_string())
            && map_a.get("early-2") == Some("y".to_string())
    });

    client.close();
    server.close();
}

#[test]
fn idle_connection_carries_no_entries_and_stays_alive() {
    let map_a = TestMap::new(1);
    let map_b = TestMap::new(2);

    let server = start_server(&map_a);
    let client = start_client(&map_b, server.local_addr().expect("bound address"));

    map_b.put("probe", "up");
    wait_for("initial entry", || map_a.get("probe") == Some("up".to_string()));

    // Nothing mutates for several heartbeat intervals; only zero-length
    // frames may cross the wire.
    let reads_before = map_a.entry_reads();
    thread::sleep(HEARTBEAT * 4);
    assert_eq!(map_a.entry_reads(), reads_before, "idle wire carried entries");

    // The connection survived the idle stretch.
    map_b.put("after-idle", "still-up");
    wait_for("entry after idle period", || {
        map_a.get("after-idle") == Some("still-up".to_string())
    });

    client.close();
    server.close();
}

#[test]
fn client_reconnects_and_replays_after_server_restart() {
    let map_a = TestMap::new(1);
    let map_b = TestMap::new(2);

    let server = start_server(&map_a);
    let addr = server.local_addr().expect("bound address");
    let client = start_client(&map_b, addr);

    map_b.put("before", "1");
    wait_for("entry before restart", || {
        map_a.get("before") == Some("1".to_string())
    });

    // Kill the server; the client sees the socket die and begins its
    // backoff-and-retry cycle.
    server.close();
    drop(server);

    map_b.put("while-down", "2");

    // A fresh server takes over the same address with an empty map. Its
    // bootstrap timestamp for the client is zero, so everything the client
    // originated is replayed.
    let map_a2 = TestMap::new(1);
    let server2 = TcpReplicator::new(
        Arc::new(map_a2.clone()),
        Arc::new(map_a2.clone()),
        server_config().with_listen(addr),
    )
    .expect("restarted server");

    wait_for("replay after reconnect", || {
        map_a2.get("before") == Some("1".to_string())
            && map_a2.get("while-down") == Some("2".to_string())
    });

    client.close();
    server2.close();
}

#[test]
fn identifier_collision_stops_replication() {
    let map_a = TestMap::new(5);
    let map_b = TestMap::new(5);

    let server = start_server(&map_a);
    let client = start_client(&map_b, server.local_addr().expect("bound address"));

    map_b.put("poison", "never");
    thread::sleep(HEARTBEAT * 3);

    assert_eq!(map_a.get("poison"), None, "collided peers exchanged entries");
    assert_eq!(map_a.entry_reads(), 0);
    assert_eq!(map_b.entry_reads(), 0);

    client.close();
    server.close();
}

#[test]
fn late_attached_channel_bootstraps_both_ways() {
    let cluster_a = ClusterReplicator::new(NodeId::new(1));
    let cluster_b = ClusterReplicator::new(NodeId::new(2));

    let map_a1 = TestMap::new(1);
    let map_b1 = TestMap::new(2);
    cluster_a
        .attach_channel(ChannelId::new(1), Arc::new(map_a1.clone()), Arc::new(map_a1.clone()))
        .expect("attach a1");
    cluster_b
        .attach_channel(ChannelId::new(1), Arc::new(map_b1.clone()), Arc::new(map_b1.clone()))
        .expect("attach b1");

    let server = TcpReplicator::new(
        Arc::new(cluster_a.clone()),
        Arc::new(cluster_a.clone()),
        server_config(),
    )
    .expect("server replicator");
    let client = TcpReplicator::new(
        Arc::new(cluster_b.clone()),
        Arc::new(cluster_b.clone()),
        client_config(server.local_addr().expect("bound address")),
    )
    .expect("client replicator");

    map_a1.put("k1", "v1");
    wait_for("channel 1 replication", || {
        map_b1.get("k1") == Some("v1".to_string())
    });

    // Channel 2 appears on node 1 only; its entries cannot go anywhere yet.
    let map_a2 = TestMap::new(1);
    cluster_a
        .attach_channel(ChannelId::new(2), Arc::new(map_a2.clone()), Arc::new(map_a2.clone()))
        .expect("attach a2");
    map_a2.put("k2", "v2");

    // Once node 2 attaches the channel too, its bootstrap announcement makes
    // node 1 replay the backlog.
    let map_b2 = TestMap::new(2);
    cluster_b
        .attach_channel(ChannelId::new(2), Arc::new(map_b2.clone()), Arc::new(map_b2.clone()))
        .expect("attach b2");

    wait_for("late channel bootstrap", || {
        map_b2.get("k2") == Some("v2".to_string())
    });

    // Traffic on channel 1 is unaffected throughout.
    map_b1.put("k3", "v3");
    wait_for("channel 1 still replicates", || {
        map_a1.get("k3") == Some("v3".to_string())
    });

    client.close();
    server.close();
}

#[test]
fn force_bootstrap_replays_dirty_entries() {
    let map_a = TestMap::new(1);
    let map_b = TestMap::new(2);

    let server = start_server(&map_a);
    let client = start_client(&map_b, server.local_addr().expect("bound address"));

    map_b.put("seed", "1");
    wait_for("initial replication", || {
        map_a.get("seed") == Some("1".to_string())
    });

    // Wipe the server's copy behind the transport's back, then force every
    // session to re-issue its backlog.
    map_a.state.entries.lock().unwrap().clear();
    client.force_bootstrap();

    wait_for("forced replay", || map_a.get("seed") == Some("1".to_string()));

    client.close();
    server.close();
}

#[test]
fn close_is_idempotent_and_joins_the_worker() {
    let map = TestMap::new(1);
    let server = start_server(&map);
    let addr = server.local_addr().expect("bound address");

    server.close();
    server.close();
    drop(server);

    // The worker has exited and released the listener, so the same address
    // binds again.
    let map2 = TestMap::new(1);
    let server2 = TcpReplicator::new(
        Arc::new(map2.clone()),
        Arc::new(map2.clone()),
        server_config().with_listen(addr),
    )
    .expect("rebind after close");
    server2.close();
}

#[test]
fn lww_prefers_newer_timestamp_and_higher_origin() {
    let map = TestMap::new(3);

    let frame = |key: &str, value: &str, ts: u64, origin: u8| {
        let stored = Stored {
            value: value.to_string(),
            timestamp_ms: ts,
            origin: NodeId::new(origin),
        };
        Bytes::from(TestMap::serialize(key, &stored))
    };

    let mut first = frame("k", "old", 100, 2);
    map.read_external_entry(&mut first);
    assert_eq!(map.get("k"), Some("old".to_string()));

    // Older timestamp loses.
    let mut stale = frame("k", "stale", 50, 7);
    map.read_external_entry(&mut stale);
    assert_eq!(map.get("k"), Some("old".to_string()));

    // Equal timestamp, higher origin wins.
    let mut tied = frame("k", "tied", 100, 9);
    map.read_external_entry(&mut tied);
    assert_eq!(map.get("k"), Some("tied".to_string()));

    // Newer timestamp wins outright.
    let mut newer = frame("k", "new", 200, 2);
    map.read_external_entry(&mut newer);
    assert_eq!(map.get("k"), Some("new".to_string()));
}
