//! Block time for incoming commands.
//!
//! The ledger never reads a clock itself; the node stamps every command
//! with the wall clock plus a development offset that
//! `bitsave_increaseTime` can push forward.

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Default)]
pub struct BlockClock {
    offset_secs: AtomicU64,
}

impl BlockClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current block time in unix seconds.
    pub fn now(&self) -> u64 {
        let wall = u64::try_from(chrono::Utc::now().timestamp()).unwrap_or(0);
        wall.saturating_add(self.offset_secs.load(Ordering::SeqCst))
    }

    /// Moves block time forward by `secs`. Returns the new offset.
    pub fn advance(&self, secs: u64) -> u64 {
        let mut current = self.offset_secs.load(Ordering::SeqCst);
        loop {
            let next = current.saturating_add(secs);
            match self.offset_secs.compare_exchange(
                current,
                next,
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return next,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset_secs.load(Ordering::SeqCst)
    }
}
