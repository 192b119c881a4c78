//! # meshmap-wire: framing for the replication socket
//!
//! Defines the byte-level protocol spoken between peers:
//!
//! - [`frame`]: two-byte length prefixes, zero-length heartbeats, and the
//!   handshake preamble, with staging buffers tolerant of partial reads and
//!   writes
//! - [`stopbit`]: the variable-length channel-id encoding used when many
//!   logical channels share one socket
//!
//! All multi-byte integers are big-endian.

pub mod error;
pub mod frame;
pub mod stopbit;

pub use error::WireError;
pub use frame::{Frame, FrameReader, FrameWriter, LENGTH_PREFIX_SIZE, MAX_FRAME_PAYLOAD};
pub use stopbit::{get_stop_bit, put_stop_bit, stop_bit_len, MAX_STOP_BIT_LEN};
