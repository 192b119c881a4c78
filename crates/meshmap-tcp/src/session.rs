//! Per-connection replication state.
//!
//! A [`Session`] owns one peer socket together with its framed buffers,
//! handshake progress, heartbeat bookkeeping, and the modification iterator
//! bound during the handshake. Sessions are owned exclusively by the event
//! loop; nothing here is shared across threads.
//!
//! The handshake advances through three waits as bytes arrive: the peer's
//! one-byte identifier, its eight-byte bootstrap timestamp echo, and its
//! eight-byte heartbeat interval. Only after all three does entry framing
//! begin.

use std::io::{self, Read};
use std::sync::Arc;

use bytes::BytesMut;
use mio::net::TcpStream;
use mio::{Interest, Registry, Token};

use meshmap_core::{ChannelId, EntryCallback, EntryExternalizable, ModificationIterator};
use meshmap_wire::{FrameReader, FrameWriter, WireError, LENGTH_PREFIX_SIZE};

use crate::connector::ConnectorId;
use crate::error::CloseReason;

/// Scratch buffer for draining a readable socket.
const READ_CHUNK: usize = 8 * 1024;

/// State attached to one peer socket.
pub(crate) struct Session {
    pub(crate) stream: TcpStream,
    pub(crate) token: Token,
    pub(crate) reader: FrameReader,
    pub(crate) writer: FrameWriter,
    interest: Interest,

    /// True for accepted sockets; they are never self-reconnected.
    pub(crate) is_server: bool,
    /// True while an outbound connect is still in flight.
    pub(crate) connecting: bool,
    /// Dialer responsible for this socket, if it is a client socket.
    pub(crate) connector: Option<ConnectorId>,

    pub(crate) remote: Option<meshmap_core::NodeId>,
    pub(crate) remote_bootstrap_ms: Option<u64>,
    /// Peer's advertised heartbeat interval with the 1.25 latency margin
    /// already applied.
    pub(crate) remote_heartbeat_ms: Option<u64>,
    pub(crate) handshake_complete: bool,

    /// Outbound cursor for this peer, bound once the identifier is known.
    pub(crate) iterator: Option<Arc<dyn ModificationIterator>>,

    pub(crate) last_sent_ms: u64,
    pub(crate) last_received_ms: u64,
    /// Set when a forced rebootstrap should re-prime the iterator on the
    /// next writable event.
    pub(crate) rebootstrap: bool,
}

impl Session {
    /// Creates state for a socket this node dialed.
    pub(crate) fn client(
        stream: TcpStream,
        token: Token,
        connector: ConnectorId,
        buffer_capacity: usize,
        now_ms: u64,
    ) -> Self {
        Self::new(stream, token, false, Some(connector), buffer_capacity, now_ms)
    }

    /// Creates state for an accepted socket.
    pub(crate) fn server(
        stream: TcpStream,
        token: Token,
        buffer_capacity: usize,
        now_ms: u64,
    ) -> Self {
        Self::new(stream, token, true, None, buffer_capacity, now_ms)
    }

    fn new(
        stream: TcpStream,
        token: Token,
        is_server: bool,
        connector: Option<ConnectorId>,
        buffer_capacity: usize,
        now_ms: u64,
    ) -> Self {
        let interest = if is_server {
            Interest::READABLE | Interest::WRITABLE
        } else {
            Interest::WRITABLE
        };
        Self {
            stream,
            token,
            reader: FrameReader::with_capacity(buffer_capacity),
            writer: FrameWriter::new(buffer_capacity),
            interest,
            is_server,
            connecting: !is_server,
            connector,
            remote: None,
            remote_bootstrap_ms: None,
            remote_heartbeat_ms: None,
            handshake_complete: false,
            iterator: None,
            last_sent_ms: now_ms,
            last_received_ms: now_ms,
            rebootstrap: false,
        }
    }

    /// Re-arms write interest.
    ///
    /// Always reregisters, even when the interest bit is already set: the
    /// poller is edge-triggered, and reregistering re-delivers current
    /// readiness, so bytes queued while the socket sat idle still flush.
    pub(crate) fn enable_write(&mut self, registry: &Registry) -> io::Result<()> {
        self.interest = self.interest | Interest::WRITABLE;
        registry.reregister(&mut self.stream, self.token, self.interest)
    }

    /// Drops write interest so an idle socket does not spin the selector.
    pub(crate) fn disable_write(&mut self, registry: &Registry) -> io::Result<()> {
        let Some(interest) = self.interest.remove(Interest::WRITABLE) else {
            return Ok(());
        };
        if interest == self.interest {
            return Ok(());
        }
        self.interest = interest;
        registry.reregister(&mut self.stream, self.token, self.interest)
    }

    /// Promotes a connecting socket to a fully registered one.
    pub(crate) fn finish_registration(&mut self, registry: &Registry) -> io::Result<()> {
        self.connecting = false;
        self.interest = Interest::READABLE | Interest::WRITABLE;
        registry.reregister(&mut self.stream, self.token, self.interest)
    }

    /// Drains the readable socket into the frame reader.
    ///
    /// Returns the number of bytes taken; zero means the socket had nothing
    /// for us this round.
    pub(crate) fn read_socket(&mut self) -> Result<usize, CloseReason> {
        let mut chunk = [0u8; READ_CHUNK];
        let mut total = 0;

        loop {
            match self.stream.read(&mut chunk) {
                Ok(0) => return Err(CloseReason::PeerClosed),
                Ok(n) => {
                    self.reader.extend(&chunk[..n]);
                    total += n;
                }
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(total),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(CloseReason::Io(e)),
            }
        }
    }

    /// Pumps dirty entries from the bound iterator into the outbound buffer.
    ///
    /// Stops once the iterator runs dry or the buffer no longer has room for
    /// a maximum-size entry, which keeps one peer from monopolizing the
    /// staging space.
    pub(crate) fn pump_entries(
        &mut self,
        externalizable: &dyn EntryExternalizable,
        max_entry_size: usize,
    ) -> Result<(), WireError> {
        let Some(iterator) = self.iterator.clone() else {
            return Ok(());
        };

        loop {
            if self.writer.free() < max_entry_size + LENGTH_PREFIX_SIZE {
                return Ok(());
            }

            let mut callback = FrameCallback {
                writer: &mut self.writer,
                externalizable,
                error: None,
            };
            let wrote = iterator.next_entry(&mut callback, ChannelId::SYSTEM);
            if let Some(e) = callback.error {
                return Err(e);
            }
            if !wrote {
                return Ok(());
            }
        }
    }

    /// Writes staged bytes to the socket.
    pub(crate) fn flush(&mut self) -> Result<usize, CloseReason> {
        self.writer.flush_to(&mut self.stream).map_err(CloseReason::Io)
    }
}

/// Frames each entry offered by a modification iterator.
struct FrameCallback<'a> {
    writer: &'a mut FrameWriter,
    externalizable: &'a dyn EntryExternalizable,
    error: Option<WireError>,
}

impl EntryCallback for FrameCallback<'_> {
    fn on_entry(&mut self, entry: &[u8], channel: ChannelId) -> bool {
        let externalizable = self.externalizable;
        match self
            .writer
            .write_entry(|dst: &mut BytesMut| externalizable.write_external_entry(entry, dst, channel))
        {
            Ok(wrote) => wrote,
            Err(e) => {
                self.error = Some(e);
                false
            }
        }
    }
}
