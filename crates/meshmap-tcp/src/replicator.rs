//! Public face of the TCP replication engine.
//!
//! [`TcpReplicator::new`] validates the configuration, binds the listener,
//! and starts the worker thread that owns all I/O. The handle that comes
//! back is cheap to share and supports exactly three operations: inspect the
//! bound address, force a rebootstrap, and shut everything down.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use crossbeam::channel;
use mio::{Interest, Poll, Waker};
use tracing::info;

use meshmap_core::{Clock, EntryExternalizable, NodeId, Replica, SystemClock};

use crate::config::ReplicationConfig;
use crate::connector::Connector;
use crate::error::ReplicatorError;
use crate::event_loop::{EventLoop, LoopShared, LISTENER_TOKEN, WAKER_TOKEN};

/// A running replication transport for one node.
///
/// Dropping the replicator shuts it down and joins the worker thread.
pub struct TcpReplicator {
    shared: Arc<LoopShared>,
    worker: Mutex<Option<JoinHandle<()>>>,
    local: NodeId,
    local_addr: Option<SocketAddr>,
}

impl TcpReplicator {
    /// Starts a replicator on the system wall clock.
    pub fn new(
        replica: Arc<dyn Replica>,
        externalizable: Arc<dyn EntryExternalizable>,
        config: ReplicationConfig,
    ) -> Result<Self, ReplicatorError> {
        Self::with_clock(replica, externalizable, config, Arc::new(SystemClock))
    }

    /// Starts a replicator with a caller-supplied clock.
    pub fn with_clock(
        replica: Arc<dyn Replica>,
        externalizable: Arc<dyn EntryExternalizable>,
        config: ReplicationConfig,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, ReplicatorError> {
        config.validate()?;
        let local = replica.identifier();

        let poll = Poll::new()?;
        let waker = Waker::new(poll.registry(), WAKER_TOKEN)?;
        let (registration_tx, registration_rx) = channel::unbounded();
        let shared = Arc::new(LoopShared::new(waker, registration_tx));

        let listener = match config.listen {
            Some(addr) => {
                let mut listener = mio::net::TcpListener::bind(addr)
                    .map_err(|source| ReplicatorError::Bind { addr, source })?;
                poll.registry()
                    .register(&mut listener, LISTENER_TOKEN, Interest::READABLE)?;
                Some(listener)
            }
            None => None,
        };
        let local_addr = listener.as_ref().and_then(|l| l.local_addr().ok());

        let connectors = config
            .endpoints
            .iter()
            .enumerate()
            .map(|(id, &addr)| Connector::new(id, addr, Arc::clone(&shared)))
            .collect();

        let event_loop = EventLoop::new(
            poll,
            listener,
            connectors,
            registration_rx,
            Arc::clone(&shared),
            replica,
            externalizable,
            clock,
            config,
        );

        let worker = std::thread::Builder::new()
            .name(format!("meshmap-replicator-{local}"))
            .spawn(move || event_loop.run())?;

        info!(node = %local, listen = ?local_addr, "replication transport started");

        Ok(Self {
            shared,
            worker: Mutex::new(Some(worker)),
            local,
            local_addr,
        })
    }

    /// This node's identifier.
    pub fn identifier(&self) -> NodeId {
        self.local
    }

    /// The address the listener actually bound, once bound.
    ///
    /// Useful with a port-zero listen address.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Makes every connected session replay its dirty entries from the
    /// peer's bootstrap timestamp.
    ///
    /// Called when cluster topology changes so late-attached stores catch
    /// up.
    pub fn force_bootstrap(&self) {
        self.shared.request_bootstrap();
    }

    /// Shuts the transport down and joins the worker thread.
    ///
    /// Idempotent and callable from any thread. In-flight frames may be
    /// discarded; no socket is written after this returns.
    pub fn close(&self) {
        if self.shared.request_shutdown() {
            info!(node = %self.local, "replication transport closing");
        }
        if let Ok(mut worker) = self.worker.lock() {
            if let Some(handle) = worker.take() {
                let _ = handle.join();
            }
        }
    }
}

impl Drop for TcpReplicator {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TcpReplicator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpReplicator")
            .field("local", &self.local)
            .field("local_addr", &self.local_addr)
            .finish()
    }
}
