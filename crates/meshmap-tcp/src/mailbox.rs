//! Cross-thread write-interest requests.
//!
//! Stores notify the transport from arbitrary threads; only the event loop
//! thread may touch selection state. [`WriteRequests`] bridges the two: a
//! producer sets the bit for the peer's identifier and then raises the dirty
//! flag, the loop swaps the flag down before draining the bits. Because the
//! bit is always set before the flag, a drain that observes the flag also
//! observes the bit, and a request raced against a drain is picked up by the
//! next one. No request is ever lost.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use meshmap_core::{NodeId, MAX_NODES};

const WORD_BITS: usize = u64::BITS as usize;
const WORDS: usize = MAX_NODES / WORD_BITS;

/// Fixed-width atomic bitmap of peers wanting write interest re-armed.
#[derive(Debug, Default)]
pub(crate) struct WriteRequests {
    words: [AtomicU64; WORDS],
    dirty: AtomicBool,
}

impl WriteRequests {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Requests a write-interest re-arm for `id`. Any thread.
    pub(crate) fn request(&self, id: NodeId) {
        let index = id.as_usize();
        let bit = 1u64 << (index % WORD_BITS);
        self.words[index / WORD_BITS].fetch_or(bit, Ordering::Release);
        self.dirty.store(true, Ordering::Release);
    }

    /// Drains all pending requests. Event loop thread only.
    pub(crate) fn drain<F: FnMut(NodeId)>(&self, mut apply: F) {
        if !self.dirty.swap(false, Ordering::Acquire) {
            return;
        }
        for (word_index, word) in self.words.iter().enumerate() {
            let mut bits = word.swap(0, Ordering::Acquire);
            while bits != 0 {
                let offset = bits.trailing_zeros() as usize;
                bits &= bits - 1;
                let raw = (word_index * WORD_BITS + offset) as u8;
                if let Some(id) = NodeId::from_wire(raw) {
                    apply(id);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn drained(requests: &WriteRequests) -> Vec<NodeId> {
        let mut ids = Vec::new();
        requests.drain(|id| ids.push(id));
        ids
    }

    #[test]
    fn drain_without_requests_is_empty() {
        let requests = WriteRequests::new();
        assert!(drained(&requests).is_empty());
    }

    #[test]
    fn requests_drain_in_identifier_order() {
        let requests = WriteRequests::new();
        requests.request(NodeId::new(90));
        requests.request(NodeId::new(3));
        requests.request(NodeId::new(64));

        assert_eq!(
            drained(&requests),
            vec![NodeId::new(3), NodeId::new(64), NodeId::new(90)]
        );
        assert!(drained(&requests).is_empty());
    }

    #[test]
    fn duplicate_requests_collapse() {
        let requests = WriteRequests::new();
        requests.request(NodeId::new(7));
        requests.request(NodeId::new(7));
        assert_eq!(drained(&requests), vec![NodeId::new(7)]);
    }

    #[test]
    fn concurrent_requests_are_never_lost() {
        let requests = Arc::new(WriteRequests::new());
        let mut handles = Vec::new();

        for id in 1..=32u8 {
            let requests = Arc::clone(&requests);
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    requests.request(NodeId::new(id));
                }
            }));
        }

        let mut seen = [false; MAX_NODES];
        for _ in 0..1_000 {
            requests.drain(|id| seen[id.as_usize()] = true);
        }
        for handle in handles {
            handle.join().expect("producer thread");
        }
        requests.drain(|id| seen[id.as_usize()] = true);

        for id in 1..=32usize {
            assert!(seen[id], "request from n{id} was lost");
        }
    }
}
