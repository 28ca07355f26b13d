//! The synchronization protocol both slot stores speak.
//!
//! A store owns `capacity` cells and four control words. The producer
//! reserves space, writes payload into cells nobody reads yet, then publishes
//! by advancing `write_index` under the write lock. The consumer samples
//! `write_index`, reads every cell below it and advances `read_index` under
//! the read lock once it is done with a cell. Counters never wrap; the
//! physical slot is `counter % capacity`.
//!
//! ```text
//!            read_index            write_index
//!                 │                     │
//!   ... consumed  ▼  published, unread  ▼  free (producer owned) ...
//! ```
//!
//! Invariants kept by every implementation:
//! - `read_index <= write_index`
//! - `write_index - read_index <= capacity`

use crate::config::Backend;
use crate::error::{Result, TelemetryError};
use crate::record::{Delivery, Frame};

/// Values of the running control word.
pub(crate) const RUN_STOPPED: u64 = 0;
pub(crate) const RUN_ACTIVE: u64 = 1;
/// The controller stopped waiting for startup; a late worker must not go active.
pub(crate) const RUN_ABANDONED: u64 = 2;

/// Snapshot of both counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Indices {
    pub read: u64,
    pub write: u64,
}

impl Indices {
    /// Published cells the consumer has not finished with.
    pub fn pending(&self) -> u64 {
        self.write.saturating_sub(self.read)
    }

    pub fn is_drained(&self) -> bool {
        self.read >= self.write
    }
}

/// Space granted by [`Channel::reserve`]; `cells` counters starting at `start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    pub start: u64,
    pub cells: u64,
}

pub trait Channel: Send + Sync {
    fn backend(&self) -> Backend;

    /// Number of cells, fixed at construction.
    fn capacity(&self) -> u64;

    /// Longest key in bytes, fixed at construction.
    fn key_size(&self) -> usize;

    /// Read under the running-flag lock.
    fn is_running(&self) -> bool;

    /// Written under the running-flag lock.
    fn set_running(&self, running: bool);

    /// The worker's ready step: sets the flag unless [`Channel::abandon`]
    /// got there first. Returns whether the worker may run.
    fn mark_ready(&self) -> bool;

    /// Clears the flag for good: an active worker drains and leaves, a
    /// worker still starting up is refused by [`Channel::mark_ready`].
    fn abandon(&self);

    /// Read under the write lock.
    fn write_index(&self) -> u64;

    /// Read under the read lock.
    fn read_index(&self) -> u64;

    /// Cells `frame` occupies once written.
    fn cost(&self, frame: &Frame<'_>) -> u64;

    /// Writes the payload of `frame` into the cells starting at `start`
    /// without publishing them. `start` must come from a live reservation.
    fn write(&self, start: u64, frame: &Frame<'_>) -> Result<u64>;

    /// Advances `write_index` by `cells` under the write lock.
    fn commit_write(&self, cells: u64);

    /// Reads the published cell at `counter`. Only the consumer calls this,
    /// and only for `read_index <= counter < write_index`.
    fn read(&self, counter: u64) -> Result<Delivery>;

    /// Advances `read_index` by `cells` under the read lock.
    fn commit_read(&self, cells: u64);

    /// Read index first: `write_index` only grows, so the pair never shows
    /// `read > write`.
    fn indices(&self) -> Indices {
        let read = self.read_index();
        let write = self.write_index();
        Indices { read, write }
    }

    fn compute_free_space(&self) -> u64 {
        self.capacity().saturating_sub(self.indices().pending())
    }

    /// Grants `cells` cells or fails with `Backpressure`, touching no
    /// control word either way.
    fn reserve(&self, cells: u64) -> Result<Reservation> {
        let indices = self.indices();
        let free = self.capacity().saturating_sub(indices.pending());
        if free < cells {
            return Err(TelemetryError::Backpressure {
                requested: cells,
                free,
            });
        }
        Ok(Reservation {
            start: indices.write,
            cells,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_indices() {
        let idx = Indices { read: 3, write: 7 };
        assert_eq!(idx.pending(), 4);
        assert!(!idx.is_drained());
        assert!(Indices { read: 7, write: 7 }.is_drained());
    }
}
