//! Time-ordered identities for mempool-mirror records.
//!
//! The rejection sweep needs the age of a pending spend without a separate
//! timestamp column, so pending identities embed their creation instant:
//! the high 32 bits are the Unix second, the low 32 bits a per-process
//! wrapping counter seeded randomly at startup. Identities from one process
//! are time-ordered; the random seed keeps independent restarts within the
//! same second from colliding.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// Generator for pending-record identities.
#[derive(Debug)]
pub struct PendingIdGenerator {
    counter: AtomicU32,
}

impl Default for PendingIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}

impl PendingIdGenerator {
    pub fn new() -> Self {
        Self {
            counter: AtomicU32::new(fastrand::u32(..)),
        }
    }

    /// Next identity, stamped with the current wall clock.
    pub fn next(&self) -> i64 {
        self.next_at(unix_now())
    }

    /// Next identity with an explicit creation second. Exposed so tests can
    /// synthesize aged records.
    pub fn next_at(&self, unix_secs: u64) -> i64 {
        let seq = self.counter.fetch_add(1, Ordering::Relaxed);
        (((unix_secs & 0xffff_ffff) << 32) | u64::from(seq)) as i64
    }
}

/// Creation second embedded in a pending identity.
pub fn pending_id_timestamp(id: i64) -> u64 {
    (id as u64) >> 32
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
