//! Length-prefixed entry framing.
//!
//! Every frame on a replication socket is:
//!
//! ```text
//! ┌──────────────────┬──────────────────────────────────┐
//! │  Length (2 bytes)│            Payload               │
//! │  big-endian u16  │        (Length bytes)            │
//! └──────────────────┴──────────────────────────────────┘
//! ```
//!
//! A length of zero is a heartbeat and carries no payload. Ahead of any
//! frames, each side sends a fixed preamble exactly once: its one-byte
//! identifier, the eight-byte bootstrap timestamp it last observed from the
//! peer, and its eight-byte heartbeat interval in milliseconds.
//!
//! [`FrameWriter`] stages outbound bytes until the socket accepts them;
//! [`FrameReader`] accumulates inbound bytes and yields complete frames, so
//! both sides tolerate arbitrary TCP segmentation.

use std::io::{self, Write};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use meshmap_core::NodeId;

use crate::error::WireError;

/// Size of the length prefix ahead of each entry.
pub const LENGTH_PREFIX_SIZE: usize = 2;

/// Largest payload a single frame can carry.
pub const MAX_FRAME_PAYLOAD: usize = u16::MAX as usize;

/// One frame lifted off the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Zero-length liveness frame.
    Heartbeat,
    /// One entry's payload, exactly as framed by the sender.
    Entry(Bytes),
}

// ============================================================================
// Writer
// ============================================================================

/// Staging buffer for outbound frames.
///
/// Capacity is `packet_size + max_entry_size` so one maximum-size entry can
/// always be framed beyond a full packet's worth of staged bytes. The buffer
/// is drained to the socket with single `write` calls; leftovers stay staged
/// for the next writable event.
#[derive(Debug)]
pub struct FrameWriter {
    buf: BytesMut,
    capacity: usize,
}

impl FrameWriter {
    /// Creates a writer with the given staging capacity.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends the preamble identifier byte.
    pub fn put_identifier(&mut self, id: NodeId) {
        self.buf.put_u8(id.as_u8());
    }

    /// Appends a preamble timestamp (bootstrap echo).
    pub fn put_timestamp(&mut self, ts_ms: u64) {
        self.buf.put_u64(ts_ms);
    }

    /// Appends a preamble heartbeat interval.
    pub fn put_interval(&mut self, interval_ms: u64) {
        self.buf.put_u64(interval_ms);
    }

    /// Appends a heartbeat frame.
    pub fn put_heartbeat(&mut self) {
        self.buf.put_u16(0);
    }

    /// Frames one entry produced by `fill`.
    ///
    /// Two bytes are reserved for the length prefix, `fill` appends the
    /// payload, and the prefix is backpatched afterwards. If `fill` writes
    /// nothing the reservation is rewound and `Ok(false)` is returned; a
    /// payload over [`MAX_FRAME_PAYLOAD`] is rewound and rejected.
    pub fn write_entry<F>(&mut self, fill: F) -> Result<bool, WireError>
    where
        F: FnOnce(&mut BytesMut),
    {
        let start = self.buf.len();
        self.buf.put_u16(0);

        fill(&mut self.buf);

        let size = self.buf.len() - start - LENGTH_PREFIX_SIZE;
        if size == 0 {
            self.buf.truncate(start);
            return Ok(false);
        }
        if size > MAX_FRAME_PAYLOAD {
            self.buf.truncate(start);
            return Err(WireError::EntryTooLarge {
                size,
                max: MAX_FRAME_PAYLOAD,
            });
        }

        let prefix = (size as u16).to_be_bytes();
        self.buf[start..start + LENGTH_PREFIX_SIZE].copy_from_slice(&prefix);
        Ok(true)
    }

    /// Number of staged bytes waiting for the socket.
    pub fn pending(&self) -> usize {
        self.buf.len()
    }

    /// Returns true if nothing is staged.
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Remaining staging room before the nominal capacity is reached.
    pub fn free(&self) -> usize {
        self.capacity.saturating_sub(self.buf.len())
    }

    /// Drains staged bytes into `writer` with one write call.
    ///
    /// Returns the number of bytes accepted; a `WouldBlock` counts as zero.
    pub fn flush_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        if self.buf.is_empty() {
            return Ok(0);
        }
        match writer.write(&self.buf) {
            Ok(n) => {
                self.buf.advance(n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }
}

// ============================================================================
// Reader
// ============================================================================

/// Incremental decoder for inbound bytes.
///
/// Handshake fields are pulled with the `read_*` methods; once the handshake
/// completes, [`FrameReader::next_frame`] yields heartbeats and entries.
/// Either way the reader never consumes more than one item per call, so
/// partially arrived data simply waits.
#[derive(Debug, Default)]
pub struct FrameReader {
    buf: BytesMut,
    pending_entry: Option<usize>,
}

impl FrameReader {
    /// Creates an empty reader.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a reader with pre-allocated capacity.
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buf: BytesMut::with_capacity(capacity),
            pending_entry: None,
        }
    }

    /// Appends bytes read from the socket.
    pub fn extend(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered, not yet decoded bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Reads the preamble identifier byte, if it has arrived.
    pub fn read_identifier(&mut self) -> Option<u8> {
        if self.buf.is_empty() {
            return None;
        }
        Some(self.buf.get_u8())
    }

    /// Reads an eight-byte preamble field, if it has arrived.
    pub fn read_u64(&mut self) -> Option<u64> {
        if self.buf.len() < 8 {
            return None;
        }
        Some(self.buf.get_u64())
    }

    /// Decodes the next complete frame, if any.
    pub fn next_frame(&mut self) -> Option<Frame> {
        if self.pending_entry.is_none() {
            if self.buf.len() < LENGTH_PREFIX_SIZE {
                return None;
            }
            let size = self.buf.get_u16() as usize;
            if size == 0 {
                return Some(Frame::Heartbeat);
            }
            self.pending_entry = Some(size);
        }

        let size = self.pending_entry.expect("set above");
        if self.buf.len() < size {
            return None;
        }
        self.pending_entry = None;
        Some(Frame::Entry(self.buf.split_to(size).freeze()))
    }
}
