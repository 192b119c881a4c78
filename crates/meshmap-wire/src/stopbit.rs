//! Stop-bit variable-length integer codec.
//!
//! Seven data bits per byte, least significant group first; a set high bit
//! means another byte follows. Channel identifiers are encoded this way ahead
//! of each multiplexed entry, so the common single-digit channels cost one
//! byte.

use bytes::{Buf, BufMut};

/// Largest number of bytes a stop-bit encoded `u64` can occupy.
pub const MAX_STOP_BIT_LEN: usize = 10;

/// Appends `value` to `dst` in stop-bit encoding.
pub fn put_stop_bit(dst: &mut impl BufMut, mut value: u64) {
    loop {
        let byte = (value & 0x7f) as u8;
        value >>= 7;
        if value == 0 {
            dst.put_u8(byte);
            return;
        }
        dst.put_u8(byte | 0x80);
    }
}

/// Reads one stop-bit encoded value from `src`.
///
/// Returns `None` if `src` runs out before the terminating byte or the
/// encoding overflows 64 bits.
pub fn get_stop_bit(src: &mut impl Buf) -> Option<u64> {
    let mut value: u64 = 0;
    let mut shift: u32 = 0;

    loop {
        if !src.has_remaining() || shift >= 64 {
            return None;
        }
        let byte = src.get_u8();
        value |= u64::from(byte & 0x7f) << shift;
        if byte & 0x80 == 0 {
            return Some(value);
        }
        shift += 7;
    }
}

/// Returns the encoded length of `value` in bytes.
pub fn stop_bit_len(value: u64) -> usize {
    let bits = 64 - value.leading_zeros().min(63) as usize;
    bits.div_ceil(7).max(1)
}
