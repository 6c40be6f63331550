//! Thread-safe sequence counter for LAN request numbering.
//!
//! # What is the sequence number for?
//!
//! Every LAN request carries a 6-bit *sequence number* in the upper bits of
//! its `rqSeq/rqLUN` byte.  The controller echoes it back in the response, so
//! the requester can:
//!
//! - **Correlate** a response with the request that produced it, even when a
//!   late response to a retransmitted request arrives after a newer one.
//! - **Discard** stale datagrams whose sequence number no longer matches the
//!   outstanding request.
//!
//! Because the field is only six bits wide, the counter wraps modulo 64.
//!
//! # Thread safety
//!
//! The counter uses `AtomicU8::fetch_update`, so two tasks calling `next()`
//! at the same time never observe the same value within one 64-step cycle.

use std::sync::atomic::{AtomicU8, Ordering};

use crate::protocol::messages::SEQUENCE_MODULUS;

/// A thread-safe counter producing sequence numbers in `[0, 64)`.
///
/// # Examples
///
/// ```rust
/// use oob_core::protocol::SequenceCounter;
///
/// let counter = SequenceCounter::new();
/// assert_eq!(counter.next(), 0);
/// assert_eq!(counter.next(), 1);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU8,
}

impl SequenceCounter {
    /// Creates a new counter starting at 0.
    pub fn new() -> Self {
        Self {
            inner: AtomicU8::new(0),
        }
    }

    /// Creates a counter whose first `next()` returns `start % 64`.
    pub fn starting_at(start: u8) -> Self {
        Self {
            inner: AtomicU8::new(start % SEQUENCE_MODULUS),
        }
    }

    /// Returns the next sequence number and atomically advances the counter.
    ///
    /// After 63 the counter wraps back to 0.
    pub fn next(&self) -> u8 {
        // The closure never returns `None`, so `fetch_update` cannot fail;
        // both arms carry the previous value.
        match self
            .inner
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some((v + 1) % SEQUENCE_MODULUS)
            }) {
            Ok(prev) | Err(prev) => prev,
        }
    }

    /// Returns the value the next call to [`next`](Self::next) will produce.
    pub fn current(&self) -> u8 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
