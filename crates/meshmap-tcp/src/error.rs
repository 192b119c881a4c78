//! Error taxonomy for the replication engine.
//!
//! Three tiers, matching how they are handled:
//!
//! - [`ConfigError`] / [`ReplicatorError`]: raised synchronously at startup,
//!   not recoverable.
//! - [`ChannelError`]: misuse of the channel multiplexer, surfaced to the
//!   caller attaching a channel.
//! - [`CloseReason`] (crate-internal): why one peer session ended. Sessions
//!   close quietly without disturbing the event loop; whether the connector
//!   retries depends on the reason.

use std::io;
use std::net::SocketAddr;

use meshmap_core::ChannelId;
use meshmap_wire::WireError;

// ============================================================================
// Startup Errors
// ============================================================================

/// Invalid transport configuration, detected before any I/O happens.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    /// `max_entry_size` cannot exceed the 16-bit frame length prefix.
    #[error("max entry size {0} exceeds the 65535-byte frame limit")]
    EntryTooLarge(usize),

    /// A zero entry size leaves nothing to replicate.
    #[error("max entry size must be non-zero")]
    ZeroEntrySize,

    /// Packet size bounds the outbound staging buffer and must be positive.
    #[error("packet size must be non-zero")]
    ZeroPacketSize,

    /// A zero heartbeat interval would flood the wire.
    #[error("heartbeat interval must be non-zero")]
    ZeroHeartbeatInterval,

    /// Throttling was requested with a degenerate bucket.
    #[error("throttle bucket interval must be non-zero when a throttle is set")]
    ZeroBucketInterval,

    /// Neither a listen address nor any endpoint was configured.
    #[error("configuration has no listen address and no endpoints")]
    NoPeers,
}

/// Failure to start the replication engine.
#[derive(Debug, thiserror::Error)]
pub enum ReplicatorError {
    /// The configuration failed validation.
    #[error("invalid replication config: {0}")]
    Config(#[from] ConfigError),

    /// The listen address could not be bound.
    #[error("failed to bind replication listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    /// Setting up the poller, waker, or worker thread failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

// ============================================================================
// Channel Errors
// ============================================================================

/// Misuse of the channel multiplexer.
#[derive(Debug, thiserror::Error)]
pub enum ChannelError {
    /// The slot is already occupied.
    #[error("channel {0} is already in use")]
    InUse(ChannelId),

    /// The identifier does not fit the configured slot table.
    #[error("channel {id} is out of range (this multiplexer carries {max} channels)")]
    OutOfRange { id: ChannelId, max: usize },

    /// Channel 0 belongs to the transport.
    #[error("channel 0 is reserved for system messages")]
    Reserved,

    /// Detach of a channel that was never attached.
    #[error("channel {0} is not attached")]
    NotAttached(ChannelId),
}

// ============================================================================
// Session Close Reasons (internal)
// ============================================================================

/// Why a peer session was torn down.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CloseReason {
    /// Transient socket failure.
    #[error("i/o error: {0}")]
    Io(io::Error),

    /// The peer shut the connection down cleanly.
    #[error("peer closed the connection")]
    PeerClosed,

    /// No bytes within the peer's advertised heartbeat tolerance.
    #[error("missed heartbeats from the peer")]
    HeartbeatLost,

    /// Both ends presented the same identifier.
    #[error("remote node presented our own identifier")]
    IdentifierCollision,

    /// The peer's preamble identifier was outside `[1, 127]`.
    #[error("remote node presented invalid identifier {0}")]
    InvalidIdentifier(u8),

    /// An entry could not be framed.
    #[error("framing error: {0}")]
    Wire(#[from] WireError),

    /// The replicator is shutting down.
    #[error("replicator shutting down")]
    Shutdown,
}

impl CloseReason {
    /// Whether a client-side connector should schedule a reconnect.
    ///
    /// Identifier collisions are configuration mistakes that reconnecting
    /// cannot fix, and shutdown tears everything down for good.
    pub(crate) fn should_reconnect(&self) -> bool {
        !matches!(
            self,
            CloseReason::IdentifierCollision | CloseReason::Shutdown
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn collision_does_not_reconnect() {
        assert!(!CloseReason::IdentifierCollision.should_reconnect());
        assert!(!CloseReason::Shutdown.should_reconnect());
    }

    #[test]
    fn transient_failures_reconnect() {
        assert!(CloseReason::PeerClosed.should_reconnect());
        assert!(CloseReason::HeartbeatLost.should_reconnect());
        assert!(CloseReason::Io(io::Error::new(io::ErrorKind::ConnectionReset, "reset"))
            .should_reconnect());
        assert!(CloseReason::InvalidIdentifier(200).should_reconnect());
    }
}
