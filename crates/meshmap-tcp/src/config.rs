//! Replication transport configuration.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use meshmap_wire::MAX_FRAME_PAYLOAD;

use crate::error::ConfigError;

/// Configuration for one node's TCP replication engine.
///
/// A node may listen for inbound peers, dial outbound endpoints, or both.
/// Endpoints are static; there is no topology discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// Address accepted connections arrive on. `None` for dial-only nodes.
    pub listen: Option<SocketAddr>,

    /// Peers this node actively connects to.
    pub endpoints: Vec<SocketAddr>,

    /// How often this node emits heartbeats on an otherwise idle socket.
    ///
    /// Also advertised to peers during the handshake; a peer declares this
    /// node lost after 1.25 times the advertised interval without bytes.
    pub heartbeat_interval: Duration,

    /// Nominal per-socket buffer page.
    ///
    /// The outbound staging buffer holds `packet_size + max_entry_size`
    /// bytes, so a full packet never blocks framing one more entry.
    pub packet_size: usize,

    /// Upper bound on one externalized entry. Must fit the 16-bit frame
    /// length prefix.
    pub max_entry_size: usize,

    /// Long-term write budget in bits per day. Zero disables throttling.
    pub throttle_bits_per_day: u64,

    /// Granularity of the throttle's token bucket.
    pub throttle_bucket_interval: Duration,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            listen: None,
            endpoints: Vec::new(),
            heartbeat_interval: Duration::from_secs(20),
            packet_size: 8 * 1024,
            max_entry_size: 4 * 1024,
            throttle_bits_per_day: 0,
            throttle_bucket_interval: Duration::from_millis(100),
        }
    }
}

impl ReplicationConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the listen address.
    pub fn with_listen(mut self, addr: SocketAddr) -> Self {
        self.listen = Some(addr);
        self
    }

    /// Listens on every interface at `port`.
    pub fn with_server_port(mut self, port: u16) -> Self {
        self.listen = Some(SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        self
    }

    /// Adds an endpoint to dial.
    pub fn with_endpoint(mut self, addr: SocketAddr) -> Self {
        self.endpoints.push(addr);
        self
    }

    /// Sets the heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Sets the nominal packet size.
    pub fn with_packet_size(mut self, bytes: usize) -> Self {
        self.packet_size = bytes;
        self
    }

    /// Sets the per-entry size bound.
    pub fn with_max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }

    /// Enables throttling with a bits-per-day budget.
    pub fn with_throttle(mut self, bits_per_day: u64, bucket_interval: Duration) -> Self {
        self.throttle_bits_per_day = bits_per_day;
        self.throttle_bucket_interval = bucket_interval;
        self
    }

    /// Heartbeat interval in milliseconds, as sent on the wire.
    pub(crate) fn heartbeat_ms(&self) -> u64 {
        self.heartbeat_interval.as_millis() as u64
    }

    /// Staging capacity of each session's outbound and inbound buffers.
    pub(crate) fn buffer_capacity(&self) -> usize {
        self.packet_size + self.max_entry_size
    }

    /// Validates the configuration before any I/O starts.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_entry_size == 0 {
            return Err(ConfigError::ZeroEntrySize);
        }
        if self.max_entry_size > MAX_FRAME_PAYLOAD {
            return Err(ConfigError::EntryTooLarge(self.max_entry_size));
        }
        if self.packet_size == 0 {
            return Err(ConfigError::ZeroPacketSize);
        }
        if self.heartbeat_interval.is_zero() {
            return Err(ConfigError::ZeroHeartbeatInterval);
        }
        if self.throttle_bits_per_day > 0 && self.throttle_bucket_interval.is_zero() {
            return Err(ConfigError::ZeroBucketInterval);
        }
        if self.listen.is_none() && self.endpoints.is_empty() {
            return Err(ConfigError::NoPeers);
        }
        Ok(())
    }
}
