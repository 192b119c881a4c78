//! Token-bucket write throttle.
//!
//! The throttle converts a bits-per-day budget into a per-bucket byte
//! allowance and accounts every socket write against it. When the bucket is
//! exhausted the event loop drops write interest on every peer session; when
//! the bucket rolls over it re-arms them. The accounting here is pure; the
//! interest changes are applied by the loop, which is the only place that may
//! touch selection state.
//!
//! One maximum-size entry is subtracted from the allowance so a write that
//! starts just under budget cannot meaningfully overshoot it.

use std::time::Duration;

const BITS_PER_BYTE: u64 = 8;
const MS_PER_DAY: u64 = 24 * 60 * 60 * 1000;

/// Write-budget accounting for one event loop.
#[derive(Debug)]
pub(crate) struct Throttler {
    bucket_interval_ms: u64,
    max_bytes_per_interval: i64,
    bytes_written: i64,
    interval_start_ms: u64,
}

impl Throttler {
    /// Creates a throttler from a daily bit budget.
    pub(crate) fn new(
        bits_per_day: u64,
        bucket_interval: Duration,
        max_entry_size: usize,
        now_ms: u64,
    ) -> Self {
        let bucket_interval_ms = bucket_interval.as_millis() as u64;
        let bytes_per_ms = bits_per_day as f64 / MS_PER_DAY as f64 / BITS_PER_BYTE as f64;
        let max_bytes_per_interval =
            (bytes_per_ms * bucket_interval_ms as f64).round() as i64 - max_entry_size as i64;

        Self {
            bucket_interval_ms,
            max_bytes_per_interval,
            bytes_written: 0,
            interval_start_ms: now_ms,
        }
    }

    /// The bucket granularity, used to bound the selector timeout.
    pub(crate) fn bucket_interval_ms(&self) -> u64 {
        self.bucket_interval_ms
    }

    /// Accounts `bytes` just written to a socket.
    ///
    /// Returns true when the interval budget is now exhausted and write
    /// interest should be suppressed on every session.
    pub(crate) fn on_wrote(&mut self, bytes: usize) -> bool {
        self.bytes_written += bytes as i64;
        self.bytes_written > self.max_bytes_per_interval
    }

    /// Rolls the bucket if its interval elapsed.
    ///
    /// Returns true when the bucket rolled and write interest should be
    /// restored on every session.
    pub(crate) fn tick(&mut self, now_ms: u64) -> bool {
        if self.interval_start_ms + self.bucket_interval_ms >= now_ms {
            return false;
        }
        self.interval_start_ms = now_ms;
        self.bytes_written = 0;
        true
    }
}
