//! Outbound connection establishment with linear backoff.
//!
//! Socket opens may resolve addresses and therefore must not run on the
//! event loop thread. Each attempt runs on a short-lived helper thread that
//! sleeps out the backoff, opens a non-blocking socket, and hands it to the
//! loop through the pending-registration queue. The loop finishes the
//! connect when the socket signals writable.
//!
//! Attempt counters live on the loop thread; helper threads never touch
//! them. A counter resets only once a handshake completes, so a peer that
//! accepts connections but fails handshakes still backs off.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mio::net::TcpStream;
use tracing::{debug, trace};

use crate::event_loop::LoopShared;

/// Index of a connector in the event loop's connector table.
///
/// Sessions refer to their connector by index rather than by reference,
/// which keeps per-session state free of ownership cycles.
pub(crate) type ConnectorId = usize;

/// Work handed from helper threads to the event loop.
pub(crate) enum Registration {
    /// A freshly opened outbound socket awaiting `OP_CONNECT` completion.
    Outbound {
        stream: TcpStream,
        connector: ConnectorId,
    },
    /// The socket open itself failed; the loop should back off and retry.
    ConnectFailed { connector: ConnectorId },
}

/// Reconnect delay for the given number of prior attempts: linear in the
/// attempt count, capped at 400 ms.
pub(crate) fn backoff_delay(attempts: u32) -> Duration {
    Duration::from_millis(100 * u64::from(attempts.min(4)))
}

/// Dialer for one static endpoint.
pub(crate) struct Connector {
    id: ConnectorId,
    addr: SocketAddr,
    attempts: u32,
    shared: Arc<LoopShared>,
}

impl Connector {
    pub(crate) fn new(id: ConnectorId, addr: SocketAddr, shared: Arc<LoopShared>) -> Self {
        Self {
            id,
            addr,
            attempts: 0,
            shared,
        }
    }

    pub(crate) fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Attempts a connection immediately.
    pub(crate) fn connect_now(&self) {
        self.spawn_attempt(Duration::ZERO);
    }

    /// Attempts a connection after the current backoff delay.
    pub(crate) fn connect_later(&mut self) {
        let delay = backoff_delay(self.attempts);
        self.attempts = self.attempts.saturating_add(1);
        trace!(endpoint = %self.addr, delay_ms = delay.as_millis() as u64, "scheduling reconnect");
        self.spawn_attempt(delay);
    }

    /// Resets the backoff after a completed handshake.
    pub(crate) fn mark_connected(&mut self) {
        self.attempts = 0;
    }

    fn spawn_attempt(&self, delay: Duration) {
        let addr = self.addr;
        let connector = self.id;
        let shared = Arc::clone(&self.shared);

        let spawned = thread::Builder::new()
            .name(format!("meshmap-connect-{addr}"))
            .spawn(move || {
                if !delay.is_zero() {
                    thread::sleep(delay);
                }
                if shared.is_shutdown() {
                    return;
                }

                let registration = match TcpStream::connect(addr) {
                    Ok(stream) => Registration::Outbound { stream, connector },
                    Err(e) => {
                        debug!(endpoint = %addr, error = %e, "socket open failed");
                        Registration::ConnectFailed { connector }
                    }
                };
                shared.enqueue(registration);
            });

        if let Err(e) = spawned {
            debug!(endpoint = %addr, error = %e, "could not spawn connect helper");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        assert_eq!(backoff_delay(0), Duration::ZERO);
        assert_eq!(backoff_delay(1), Duration::from_millis(100));
        assert_eq!(backoff_delay(3), Duration::from_millis(300));
        assert_eq!(backoff_delay(4), Duration::from_millis(400));
        assert_eq!(backoff_delay(50), Duration::from_millis(400));
    }
}
