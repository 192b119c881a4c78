//! # meshmap-tcp: the TCP replication engine
//!
//! Connects peers holding copies of the same logical stores and streams
//! per-entry mutations between them until every copy converges. Convergence
//! is the stores' concern (last-writer-wins on entry timestamps); this crate
//! moves the bytes.
//!
//! ## Architecture
//!
//! ```text
//! store mutation
//!       │ ModificationNotifier::on_change
//!       ▼
//! ┌───────────────┐  write-interest   ┌──────────────────────────────┐
//! │ any thread    │ ────────────────► │ event loop (one thread)      │
//! └───────────────┘   mailbox + wake  │  sessions, handshake,        │
//!                                     │  heartbeats, throttle,       │
//! ┌───────────────┐  pending sockets  │  framing                     │
//! │ connector     │ ────────────────► │                              │
//! │ helper threads│                   └──────────────┬───────────────┘
//! └───────────────┘                                  │ TCP
//!                                                    ▼
//!                                             remote peers
//! ```
//!
//! Each socket performs a three-step handshake (identifier, bootstrap
//! timestamp, heartbeat interval) before entry frames flow. Entries are
//! length-prefixed; zero-length frames are heartbeats. Client sockets
//! reconnect with linear backoff; accepted sockets wait for the peer to
//! return.
//!
//! ## Key Components
//!
//! - [`TcpReplicator`]: lifecycle facade (start, force rebootstrap, close)
//! - [`ReplicationConfig`]: endpoints, heartbeat, sizes, throttle budget
//! - [`ClusterReplicator`]: multiplexes many channels over one socket

pub mod cluster;
pub mod config;
pub mod error;
pub mod replicator;

mod connector;
mod event_loop;
mod mailbox;
mod session;
mod throttler;

pub use cluster::{ClusterReplicator, BOOTSTRAP_MESSAGE};
pub use config::ReplicationConfig;
pub use error::{ChannelError, ConfigError, ReplicatorError};
pub use replicator::TcpReplicator;

#[cfg(test)]
mod tests;
