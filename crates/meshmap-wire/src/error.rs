//! Wire-level error types.

/// Errors raised while framing entries.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// An externalized entry exceeded the 16-bit length prefix.
    #[error("entry too large: {size} bytes (frames are limited to {max})")]
    EntryTooLarge { size: usize, max: usize },
}
