//! Thread-safe counter used to number packets and sockets.
//!
//! Packet ids let a caller find its own packet again (for example to pull it
//! out of the queue when a synchronous wait times out).  Socket ids are the
//! key the multiplexer and the client registry share, so they must never be
//! reused while the process runs.

use std::sync::atomic::{AtomicU64, Ordering};

/// A lock-free, monotonically increasing counter.
///
/// ```rust
/// use devlink_core::SequenceCounter;
///
/// let counter = SequenceCounter::starting_at(1);
/// assert_eq!(counter.next(), 1);
/// assert_eq!(counter.next(), 2);
/// ```
#[derive(Debug)]
pub struct SequenceCounter {
    inner: AtomicU64,
}

impl SequenceCounter {
    pub fn new() -> Self {
        Self::starting_at(0)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            inner: AtomicU64::new(first),
        }
    }

    /// Returns the next value and advances the counter.
    ///
    /// `Relaxed` is enough: ids only need to be unique, they do not order
    /// other memory operations.
    pub fn next(&self) -> u64 {
        self.inner.fetch_add(1, Ordering::Relaxed)
    }

    /// The value the next call to [`next`](Self::next) will return.
    pub fn current(&self) -> u64 {
        self.inner.load(Ordering::Relaxed)
    }
}

impl Default for SequenceCounter {
    fn default() -> Self {
        Self::new()
    }
}
