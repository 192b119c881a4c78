//! The replication event loop.
//!
//! One dedicated thread owns a mio poller and every piece of selection
//! state: peer sessions, the identifier key store, connectors, and the
//! throttler. Each iteration:
//!
//! 1. drain pending registrations from connector helper threads
//! 2. poll with a timeout bounded by the heartbeat and throttle intervals
//! 3. roll the throttle bucket, restoring write interest if it reset
//! 4. sweep sessions for due heartbeats and missed peers
//! 5. apply cross-thread write-interest requests
//! 6. dispatch socket events: accept, connect-complete, read, write
//!
//! Any per-session error closes that session quietly; client sessions then
//! schedule a reconnect through their connector. Only poller failure or an
//! external shutdown stops the loop.

use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crossbeam::channel::{Receiver, Sender};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use tracing::{debug, error, info, trace, warn};

use meshmap_core::{
    Clock, EntryExternalizable, ModificationNotifier, NodeId, Replica, MAX_NODES,
};
use meshmap_wire::Frame;

use crate::config::ReplicationConfig;
use crate::connector::{Connector, Registration};
use crate::error::CloseReason;
use crate::mailbox::WriteRequests;
use crate::session::Session;
use crate::throttler::Throttler;

/// Token reserved for the cross-thread waker.
pub(crate) const WAKER_TOKEN: Token = Token(0);

/// Token reserved for the listen socket.
pub(crate) const LISTENER_TOKEN: Token = Token(1);

/// First token handed to a peer session.
const FIRST_SESSION_TOKEN: usize = 2;

/// Maximum events taken per poll call.
const MAX_EVENTS: usize = 128;

/// Lower bound on the poll timeout.
///
/// The timeout tightens to the smallest peer-advertised heartbeat and never
/// widens again, so a peer advertising a pathologically small interval could
/// otherwise pin the loop in a busy spin.
pub(crate) const SELECTOR_TIMEOUT_FLOOR_MS: u64 = 50;

// ============================================================================
// Shared Handles
// ============================================================================

/// The only state shared between the loop thread and the outside world.
pub(crate) struct LoopShared {
    waker: Waker,
    write_requests: WriteRequests,
    shutdown: AtomicBool,
    force_bootstrap: AtomicBool,
    registrations: Sender<Registration>,
}

impl LoopShared {
    pub(crate) fn new(waker: Waker, registrations: Sender<Registration>) -> Self {
        Self {
            waker,
            write_requests: WriteRequests::new(),
            shutdown: AtomicBool::new(false),
            force_bootstrap: AtomicBool::new(false),
            registrations,
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// Flags shutdown and wakes the loop. Returns false if already flagged.
    pub(crate) fn request_shutdown(&self) -> bool {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return false;
        }
        let _ = self.waker.wake();
        true
    }

    /// Requests that every session re-prime its outbound iterator.
    pub(crate) fn request_bootstrap(&self) {
        self.force_bootstrap.store(true, Ordering::Release);
        let _ = self.waker.wake();
    }

    /// Hands a registration to the loop and wakes it.
    pub(crate) fn enqueue(&self, registration: Registration) {
        let _ = self.registrations.send(registration);
        let _ = self.waker.wake();
    }
}

/// Wakes the loop when a store reports new dirty entries for one peer.
pub(crate) struct RemoteNotifier {
    shared: Arc<LoopShared>,
    remote: NodeId,
}

impl RemoteNotifier {
    pub(crate) fn new(shared: Arc<LoopShared>, remote: NodeId) -> Self {
        Self { shared, remote }
    }
}

impl ModificationNotifier for RemoteNotifier {
    fn on_change(&self) {
        self.shared.write_requests.request(self.remote);
        let _ = self.shared.waker.wake();
    }
}

// ============================================================================
// Active Identifier Set
// ============================================================================

/// Loop-owned bitset of identifiers with a live session.
#[derive(Debug, Default, Clone, Copy)]
struct ActiveIds(u128);

impl ActiveIds {
    fn set(&mut self, id: NodeId) {
        self.0 |= 1u128 << id.as_usize();
    }

    fn clear(&mut self, id: NodeId) {
        self.0 &= !(1u128 << id.as_usize());
    }

    fn iter(self) -> impl Iterator<Item = NodeId> {
        (1..MAX_NODES as u8).filter_map(move |raw| {
            if self.0 & (1u128 << raw) != 0 {
                NodeId::from_wire(raw)
            } else {
                None
            }
        })
    }
}

// ============================================================================
// Event Loop
// ============================================================================

/// Owner of all selection state. Runs on its own thread until shutdown.
pub(crate) struct EventLoop {
    poll: Poll,
    listener: Option<TcpListener>,
    sessions: HashMap<Token, Session>,
    /// identifier -> session token, alongside `active`.
    key_store: [Option<Token>; MAX_NODES],
    active: ActiveIds,
    connectors: Vec<Connector>,
    registrations: Receiver<Registration>,
    shared: Arc<LoopShared>,

    replica: Arc<dyn Replica>,
    externalizable: Arc<dyn EntryExternalizable>,
    clock: Arc<dyn Clock>,
    config: ReplicationConfig,
    local: NodeId,

    throttler: Option<Throttler>,
    heartbeat_ms: u64,
    selector_timeout_ms: u64,
    next_token: usize,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        poll: Poll,
        listener: Option<TcpListener>,
        connectors: Vec<Connector>,
        registrations: Receiver<Registration>,
        shared: Arc<LoopShared>,
        replica: Arc<dyn Replica>,
        externalizable: Arc<dyn EntryExternalizable>,
        clock: Arc<dyn Clock>,
        config: ReplicationConfig,
    ) -> Self {
        let local = replica.identifier();
        let heartbeat_ms = config.heartbeat_ms();

        let throttler = if config.throttle_bits_per_day > 0 {
            Some(Throttler::new(
                config.throttle_bits_per_day,
                config.throttle_bucket_interval,
                config.max_entry_size,
                clock.now_ms(),
            ))
        } else {
            None
        };

        let selector_timeout_ms = throttler
            .as_ref()
            .map_or(heartbeat_ms, |t| heartbeat_ms.min(t.bucket_interval_ms()))
            .max(SELECTOR_TIMEOUT_FLOOR_MS);

        Self {
            poll,
            listener,
            sessions: HashMap::new(),
            key_store: [None; MAX_NODES],
            active: ActiveIds::default(),
            connectors,
            registrations,
            shared,
            replica,
            externalizable,
            clock,
            config,
            local,
            throttler,
            heartbeat_ms,
            selector_timeout_ms,
            next_token: FIRST_SESSION_TOKEN,
        }
    }

    /// Runs until shutdown is requested or the poller fails.
    pub(crate) fn run(mut self) {
        info!(node = %self.local, "replication loop starting");

        for connector in &self.connectors {
            connector.connect_now();
        }

        let mut events = Events::with_capacity(MAX_EVENTS);
        loop {
            if self.shared.is_shutdown() {
                break;
            }

            self.drain_registrations();

            let timeout = Duration::from_millis(self.poll_timeout_ms(self.clock.now_ms()));
            if let Err(e) = self.poll.poll(&mut events, Some(timeout)) {
                if e.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                error!(error = %e, "poller failed, stopping replication loop");
                break;
            }

            let now_ms = self.clock.now_ms();
            self.check_throttle(now_ms);
            self.heartbeat_sweep(now_ms);
            self.apply_write_requests();
            if self.shared.force_bootstrap.swap(false, Ordering::AcqRel) {
                self.mark_rebootstrap();
            }

            for event in events.iter() {
                let readable = event.is_readable() || event.is_read_closed();
                let writable = event.is_writable() || event.is_error();
                match event.token() {
                    WAKER_TOKEN => {}
                    LISTENER_TOKEN => self.accept_all(now_ms),
                    token => self.dispatch(token, readable, writable, now_ms),
                }
            }
        }

        self.shutdown_all();
        info!(node = %self.local, "replication loop stopped");
    }

    // ------------------------------------------------------------------
    // Registrations and accepts
    // ------------------------------------------------------------------

    fn drain_registrations(&mut self) {
        while let Ok(registration) = self.registrations.try_recv() {
            match registration {
                Registration::Outbound {
                    mut stream,
                    connector,
                } => {
                    let token = self.next_session_token();
                    match self
                        .poll
                        .registry()
                        .register(&mut stream, token, Interest::WRITABLE)
                    {
                        Ok(()) => {
                            trace!(endpoint = %self.connectors[connector].addr(), "outbound socket registered");
                            let session = Session::client(
                                stream,
                                token,
                                connector,
                                self.config.buffer_capacity(),
                                self.clock.now_ms(),
                            );
                            self.sessions.insert(token, session);
                        }
                        Err(e) => {
                            warn!(error = %e, "registering outbound socket failed");
                            self.connectors[connector].connect_later();
                        }
                    }
                }
                Registration::ConnectFailed { connector } => {
                    self.connectors[connector].connect_later();
                }
            }
        }
    }

    fn accept_all(&mut self, now_ms: u64) {
        loop {
            let Some(listener) = self.listener.as_ref() else {
                return;
            };
            match listener.accept() {
                Ok((mut stream, peer)) => {
                    let _ = stream.set_nodelay(true);
                    let token = self.next_session_token();
                    if let Err(e) = self.poll.registry().register(
                        &mut stream,
                        token,
                        Interest::READABLE | Interest::WRITABLE,
                    ) {
                        warn!(peer = %peer, error = %e, "registering accepted socket failed");
                        continue;
                    }

                    let mut session =
                        Session::server(stream, token, self.config.buffer_capacity(), now_ms);
                    session.writer.put_identifier(self.local);
                    debug!(peer = %peer, "accepted replication connection");
                    self.sessions.insert(token, session);
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    return;
                }
            }
        }
    }

    fn next_session_token(&mut self) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        token
    }

    // ------------------------------------------------------------------
    // Periodic work
    // ------------------------------------------------------------------

    /// How long the next poll may block.
    ///
    /// Bounded by the heartbeat and throttle intervals (tightened to the
    /// smallest peer-advertised heartbeat), and further by the next pending
    /// heartbeat deadline. Without the deadline bound, a poll woken early by
    /// traffic would restart its full timeout and let a due heartbeat drift
    /// past the peer's 1.25x tolerance.
    fn poll_timeout_ms(&self, now_ms: u64) -> u64 {
        let mut timeout = self.selector_timeout_ms;
        for session in self.sessions.values() {
            if session.handshake_complete {
                let due = session.last_sent_ms + self.heartbeat_ms;
                timeout = timeout.min(due.saturating_sub(now_ms).max(1));
            }
        }
        timeout
    }

    fn check_throttle(&mut self, now_ms: u64) {
        let Some(throttler) = &mut self.throttler else {
            return;
        };
        if !throttler.tick(now_ms) {
            return;
        }
        trace!("throttle bucket rolled, restoring write interest");
        let registry = self.poll.registry();
        for session in self.sessions.values_mut() {
            if !session.connecting {
                let _ = session.enable_write(registry);
            }
        }
    }

    fn suppress_writes(&mut self) {
        trace!("write budget exhausted, dropping write interest");
        let registry = self.poll.registry();
        for session in self.sessions.values_mut() {
            if !session.connecting {
                let _ = session.disable_write(registry);
            }
        }
    }

    fn heartbeat_sweep(&mut self, now_ms: u64) {
        let ids: Vec<NodeId> = self.active.iter().collect();
        for id in ids {
            let Some(token) = self.key_store[id.as_usize()] else {
                self.active.clear(id);
                continue;
            };

            let mut lost = false;
            match self.sessions.get_mut(&token) {
                Some(session) => {
                    if session.handshake_complete
                        && now_ms.saturating_sub(session.last_sent_ms) >= self.heartbeat_ms
                    {
                        session.writer.put_heartbeat();
                        session.last_sent_ms = now_ms;
                        if !session.connecting {
                            let _ = session.enable_write(self.poll.registry());
                        }
                        trace!(remote = %id, "heartbeat queued");
                    }

                    if !session.is_server && session.handshake_complete {
                        if let Some(tolerance) = session.remote_heartbeat_ms {
                            if now_ms.saturating_sub(session.last_received_ms) > tolerance {
                                lost = true;
                            }
                        }
                    }
                }
                None => {
                    self.key_store[id.as_usize()] = None;
                    self.active.clear(id);
                    continue;
                }
            }

            if lost {
                if let Some(session) = self.sessions.remove(&token) {
                    self.close_session(session, CloseReason::HeartbeatLost);
                }
            }
        }
    }

    fn apply_write_requests(&mut self) {
        let registry = self.poll.registry();
        let sessions = &mut self.sessions;
        let key_store = &self.key_store;
        self.shared.write_requests.drain(|id| {
            if let Some(token) = key_store[id.as_usize()] {
                if let Some(session) = sessions.get_mut(&token) {
                    if !session.connecting {
                        let _ = session.enable_write(registry);
                    }
                }
            }
        });
    }

    fn mark_rebootstrap(&mut self) {
        debug!("rebootstrap requested for every session");
        let registry = self.poll.registry();
        for session in self.sessions.values_mut() {
            if session.handshake_complete {
                session.rebootstrap = true;
                let _ = session.enable_write(registry);
            }
        }
    }

    // ------------------------------------------------------------------
    // Socket events
    // ------------------------------------------------------------------

    fn dispatch(&mut self, token: Token, readable: bool, writable: bool, now_ms: u64) {
        let Some(mut session) = self.sessions.remove(&token) else {
            return;
        };
        match self.drive_session(&mut session, readable, writable, now_ms) {
            Ok(()) => {
                self.sessions.insert(token, session);
            }
            Err(reason) => self.close_session(session, reason),
        }
    }

    fn drive_session(
        &mut self,
        session: &mut Session,
        readable: bool,
        writable: bool,
        now_ms: u64,
    ) -> Result<(), CloseReason> {
        if session.connecting && writable {
            self.finish_connect(session)?;
        }
        if readable {
            self.on_read(session, now_ms)?;
        }
        if writable && !session.connecting {
            self.on_write(session, now_ms)?;
        }
        Ok(())
    }

    /// Completes an in-flight outbound connect.
    fn finish_connect(&mut self, session: &mut Session) -> Result<(), CloseReason> {
        match session.stream.peer_addr() {
            Ok(peer) => {
                let _ = session.stream.set_nodelay(true);
                session
                    .finish_registration(self.poll.registry())
                    .map_err(CloseReason::Io)?;
                session.writer.put_identifier(self.local);
                debug!(peer = %peer, node = %self.local, "connected to peer");
                Ok(())
            }
            Err(e)
                if e.kind() == io::ErrorKind::NotConnected
                    || e.kind() == io::ErrorKind::WouldBlock =>
            {
                // Spurious wakeup; the connect is still in flight.
                Ok(())
            }
            Err(e) => Err(CloseReason::Io(e)),
        }
    }

    fn on_read(&mut self, session: &mut Session, now_ms: u64) -> Result<(), CloseReason> {
        let n = session.read_socket()?;
        if n == 0 {
            return Ok(());
        }
        session.last_received_ms = now_ms;

        if !session.handshake_complete {
            self.advance_handshake(session)?;
        }
        if session.handshake_complete {
            self.drain_frames(session);
        }
        Ok(())
    }

    /// Advances the three-step handshake as far as buffered bytes allow.
    fn advance_handshake(&mut self, session: &mut Session) -> Result<(), CloseReason> {
        if session.remote.is_none() {
            let Some(raw) = session.reader.read_identifier() else {
                return Ok(());
            };
            let Some(remote) = NodeId::from_wire(raw) else {
                info!(raw, "peer presented an invalid identifier");
                return Err(CloseReason::InvalidIdentifier(raw));
            };
            if remote == self.local {
                info!(
                    node = %self.local,
                    "remote node uses our identifier; change one of the two"
                );
                return Err(CloseReason::IdentifierCollision);
            }

            session.remote = Some(remote);
            self.key_store[remote.as_usize()] = Some(session.token);
            self.active.set(remote);

            let notifier: Arc<dyn ModificationNotifier> =
                Arc::new(RemoteNotifier::new(Arc::clone(&self.shared), remote));
            session.iterator = Some(
                self.replica
                    .acquire_modification_iterator(remote, notifier),
            );

            // Answer with the timestamp we last saw from this peer and our
            // heartbeat interval, completing our half of the preamble.
            session
                .writer
                .put_timestamp(self.replica.last_modification_time(remote));
            session.writer.put_interval(self.heartbeat_ms);
            session
                .enable_write(self.poll.registry())
                .map_err(CloseReason::Io)?;

            debug!(node = %self.local, remote = %remote, "peer identified");
        }

        if session.remote_bootstrap_ms.is_none() {
            let Some(bootstrap_ms) = session.reader.read_u64() else {
                return Ok(());
            };
            session.remote_bootstrap_ms = Some(bootstrap_ms);
        }

        if session.remote_heartbeat_ms.is_none() {
            let Some(interval_ms) = session.reader.read_u64() else {
                return Ok(());
            };
            // Quarter margin over the advertised interval before the peer
            // counts as lost, absorbing network jitter.
            session.remote_heartbeat_ms = Some(interval_ms + interval_ms / 4);
            self.selector_timeout_ms = self
                .selector_timeout_ms
                .min(interval_ms)
                .max(SELECTOR_TIMEOUT_FLOOR_MS);

            session.handshake_complete = true;
            if let Some(connector) = session.connector {
                self.connectors[connector].mark_connected();
            }
            if let (Some(iterator), Some(bootstrap_ms)) =
                (&session.iterator, session.remote_bootstrap_ms)
            {
                iterator.dirty_entries(bootstrap_ms);
            }
            // Kick the writer so the primed backlog drains without waiting
            // for the next heartbeat.
            session
                .enable_write(self.poll.registry())
                .map_err(CloseReason::Io)?;

            debug!(
                node = %self.local,
                remote = ?session.remote,
                bootstrap_ms = session.remote_bootstrap_ms,
                "handshake complete"
            );
        }

        Ok(())
    }

    fn drain_frames(&mut self, session: &mut Session) {
        while let Some(frame) = session.reader.next_frame() {
            match frame {
                Frame::Heartbeat => trace!(remote = ?session.remote, "heartbeat received"),
                Frame::Entry(mut payload) => {
                    self.externalizable.read_external_entry(&mut payload);
                    if !payload.is_empty() {
                        trace!(
                            remote = ?session.remote,
                            unread = payload.len(),
                            "externalizer left bytes in an entry frame"
                        );
                    }
                }
            }
        }
    }

    fn on_write(&mut self, session: &mut Session, now_ms: u64) -> Result<(), CloseReason> {
        if session.rebootstrap {
            if let (Some(iterator), Some(bootstrap_ms)) =
                (&session.iterator, session.remote_bootstrap_ms)
            {
                iterator.dirty_entries(bootstrap_ms);
            }
            session.rebootstrap = false;
        }

        session
            .pump_entries(self.externalizable.as_ref(), self.config.max_entry_size)
            .map_err(|e| {
                info!(remote = ?session.remote, error = %e, "dropping session");
                CloseReason::Wire(e)
            })?;

        if session.writer.is_empty() && session.handshake_complete {
            session
                .disable_write(self.poll.registry())
                .map_err(CloseReason::Io)?;
        }

        let written = session.flush()?;
        if written > 0 {
            session.last_sent_ms = now_ms;
            let throttled = self
                .throttler
                .as_mut()
                .is_some_and(|t| t.on_wrote(written));
            if throttled {
                // This session is detached from the table while it is being
                // driven, so the sweep below cannot reach it.
                session
                    .disable_write(self.poll.registry())
                    .map_err(CloseReason::Io)?;
                self.suppress_writes();
                return Ok(());
            }
        }

        // The poller is edge-triggered; if staged bytes or further dirty
        // entries remain, reregister so the next writable edge is delivered.
        let more = !session.writer.is_empty()
            || session.iterator.as_ref().is_some_and(|it| it.has_next());
        if more {
            session
                .enable_write(self.poll.registry())
                .map_err(CloseReason::Io)?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Teardown
    // ------------------------------------------------------------------

    fn close_session(&mut self, mut session: Session, reason: CloseReason) {
        match &reason {
            CloseReason::Io(_) | CloseReason::PeerClosed | CloseReason::Shutdown => {
                debug!(remote = ?session.remote, reason = %reason, "closing session");
            }
            _ => info!(remote = ?session.remote, reason = %reason, "closing session"),
        }

        let _ = self.poll.registry().deregister(&mut session.stream);

        if let Some(remote) = session.remote {
            if self.key_store[remote.as_usize()] == Some(session.token) {
                self.key_store[remote.as_usize()] = None;
                self.active.clear(remote);
            }
        }

        if !session.is_server && reason.should_reconnect() {
            if let Some(connector) = session.connector {
                self.connectors[connector].connect_later();
            }
        }
    }

    fn shutdown_all(&mut self) {
        let tokens: Vec<Token> = self.sessions.keys().copied().collect();
        for token in tokens {
            if let Some(session) = self.sessions.remove(&token) {
                self.close_session(session, CloseReason::Shutdown);
            }
        }
        self.listener = None;
    }
}
