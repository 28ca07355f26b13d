// src/store/queue.rs

use crate::channel::{Channel, RUN_ABANDONED, RUN_ACTIVE, RUN_STOPPED};
use crate::config::{Backend, MAX_CAPACITY};
use crate::error::{Result, TelemetryError};
use crate::record::{Delivery, Frame, Object};
use crossbeam_channel::{bounded, Receiver, Sender, TryRecvError, TrySendError};
use std::sync::{Mutex, MutexGuard, PoisonError};

/// In-process slot store: a bounded queue of whole records.
///
/// No memory crosses a process boundary, so a record travels as one queue
/// item and the assembler receives it already built. `capacity` counts
/// records, not cells. The control words keep the same protocol as the
/// shared store so `wait()` and backpressure behave identically.
pub struct QueueStore {
    tx: Sender<Object>,
    rx: Receiver<Object>,
    write_idx: Mutex<u64>,
    read_idx: Mutex<u64>,
    running: Mutex<u64>,
    capacity: u64,
    key_size: usize,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    // 控制字只是整数，持锁线程 panic 后的值依然有效
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl QueueStore {
    pub fn new(capacity: u64, key_size: usize) -> Result<Self> {
        if capacity == 0 || key_size == 0 {
            return Err(TelemetryError::config(
                "capacity and key_size must be positive",
            ));
        }
        if capacity > MAX_CAPACITY {
            return Err(TelemetryError::config(format!(
                "capacity {} exceeds the maximum of {}",
                capacity, MAX_CAPACITY
            )));
        }
        let (tx, rx) = bounded(capacity as usize);
        log::info!(
            "Created queue store ({} records, key_size {})",
            capacity,
            key_size
        );
        Ok(Self {
            tx,
            rx,
            write_idx: Mutex::new(0),
            read_idx: Mutex::new(0),
            running: Mutex::new(RUN_STOPPED),
            capacity,
            key_size,
        })
    }
}

impl Channel for QueueStore {
    fn backend(&self) -> Backend {
        Backend::Queue
    }

    fn capacity(&self) -> u64 {
        self.capacity
    }

    fn key_size(&self) -> usize {
        self.key_size
    }

    fn is_running(&self) -> bool {
        *lock(&self.running) == RUN_ACTIVE
    }

    fn set_running(&self, running: bool) {
        *lock(&self.running) = if running { RUN_ACTIVE } else { RUN_STOPPED };
    }

    fn mark_ready(&self) -> bool {
        let mut word = lock(&self.running);
        if *word == RUN_ABANDONED {
            return false;
        }
        *word = RUN_ACTIVE;
        true
    }

    fn abandon(&self) {
        *lock(&self.running) = RUN_ABANDONED;
    }

    fn write_index(&self) -> u64 {
        *lock(&self.write_idx)
    }

    fn read_index(&self) -> u64 {
        *lock(&self.read_idx)
    }

    fn cost(&self, _frame: &Frame<'_>) -> u64 {
        1
    }

    fn write(&self, _start: u64, frame: &Frame<'_>) -> Result<u64> {
        match self.tx.try_send(frame.to_object()) {
            Ok(()) => Ok(1),
            Err(TrySendError::Full(_)) => Err(TelemetryError::Backpressure {
                requested: 1,
                free: 0,
            }),
            Err(TrySendError::Disconnected(_)) => Err(TelemetryError::WorkerStopped),
        }
    }

    fn commit_write(&self, cells: u64) {
        *lock(&self.write_idx) += cells;
    }

    fn read(&self, counter: u64) -> Result<Delivery> {
        match self.rx.try_recv() {
            Ok(object) => Ok(Delivery::Object(object)),
            Err(TryRecvError::Empty) => Err(TelemetryError::transport(format!(
                "record {} published but not queued",
                counter
            ))),
            Err(TryRecvError::Disconnected) => {
                Err(TelemetryError::transport("record queue disconnected"))
            }
        }
    }

    fn commit_read(&self, cells: u64) {
        *lock(&self.read_idx) += cells;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::Value;

    #[test]
    fn test_one_item_per_record() {
        let store = QueueStore::new(2, 8).unwrap();
        let fields = [("a", Value::Int(1)), ("b", Value::Int(2))];
        let frame = Frame::Object(&fields);
        assert_eq!(store.cost(&frame), 1);

        let r = store.reserve(1).unwrap();
        store.write(r.start, &frame).unwrap();
        store.commit_write(1);

        let expected: Object = fields.iter().map(|&(k, v)| (k, v)).collect();
        assert_eq!(store.read(0).unwrap(), Delivery::Object(expected));
        store.commit_read(1);
        assert!(store.indices().is_drained());
    }

    #[test]
    fn test_backpressure_when_full() {
        let store = QueueStore::new(1, 8).unwrap();
        let frame = Frame::Cell {
            key: "x",
            value: Value::Int(1),
        };
        let r = store.reserve(1).unwrap();
        store.write(r.start, &frame).unwrap();
        store.commit_write(1);

        let before = store.indices();
        assert!(matches!(
            store.reserve(1),
            Err(TelemetryError::Backpressure {
                requested: 1,
                free: 0
            })
        ));
        assert_eq!(store.indices(), before);
    }

    #[test]
    fn test_rejects_oversized_capacity() {
        assert!(matches!(
            QueueStore::new(u64::MAX / 4, 8),
            Err(TelemetryError::Config { .. })
        ));
    }

    #[test]
    fn test_abandon_wins_over_late_ready() {
        let store = QueueStore::new(1, 8).unwrap();
        store.abandon();
        assert!(!store.mark_ready());
        assert!(!store.is_running());
    }

    #[test]
    fn test_read_without_item_is_an_error() {
        let store = QueueStore::new(1, 8).unwrap();
        assert!(matches!(store.read(0), Err(TelemetryError::Transport { .. })));
    }
}
