//! Caller-facing push operations.
//!
//! Every push is reserve → write → commit: the payload is in place before
//! the index that exposes it moves, and a failed reserve leaves the channel
//! exactly as it was. Nothing here blocks.

use crate::channel::Channel;
use crate::error::{Result, TelemetryError};
use crate::record::{is_sentinel, Frame, IntoValue, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Handle used by the application to emit events.
///
/// Clones share the channel and a single "push in progress" flag; the channel
/// has one producer, so a push that starts while another is still running
/// fails with [`TelemetryError::ConcurrentProducer`] instead of corrupting
/// the cells.
#[derive(Clone)]
pub struct Producer {
    channel: Arc<dyn Channel>,
    busy: Arc<AtomicBool>,
}

struct PushGuard<'a> {
    busy: &'a AtomicBool,
}

impl Drop for PushGuard<'_> {
    fn drop(&mut self) {
        self.busy.store(false, Ordering::Release);
    }
}

/// Cuts `key` to at most `max` bytes on a char boundary.
fn truncate_key(key: &str, max: usize) -> &str {
    if key.len() <= max {
        return key;
    }
    let mut end = max;
    while !key.is_char_boundary(end) {
        end -= 1;
    }
    &key[..end]
}

impl Producer {
    pub(crate) fn new(channel: Arc<dyn Channel>) -> Self {
        Self {
            channel,
            busy: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn channel(&self) -> &Arc<dyn Channel> {
        &self.channel
    }

    fn enter(&self) -> Result<PushGuard<'_>> {
        self.busy
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .map_err(|_| TelemetryError::ConcurrentProducer)?;
        Ok(PushGuard { busy: &self.busy })
    }

    fn ensure_running(&self) -> Result<()> {
        if !self.channel.is_running() {
            return Err(TelemetryError::WorkerStopped);
        }
        Ok(())
    }

    fn check_key(&self, key: &str) -> Result<()> {
        if is_sentinel(key) {
            return Err(TelemetryError::ReservedKey {
                key: key.to_string(),
            });
        }
        let max = self.channel.key_size();
        if key.len() > max {
            return Err(TelemetryError::KeyTooLong {
                len: key.len(),
                max,
            });
        }
        Ok(())
    }

    fn publish(&self, frame: &Frame<'_>) -> Result<()> {
        let reservation = self.channel.reserve(self.channel.cost(frame))?;
        let written = self.channel.write(reservation.start, frame)?;
        debug_assert_eq!(written, reservation.cells);
        self.channel.commit_write(reservation.cells);
        Ok(())
    }

    /// Pushes one raw cell after checking the worker, the key and the free space.
    pub fn push(&self, key: &str, value: impl IntoValue) -> Result<()> {
        let _guard = self.enter()?;
        self.ensure_running()?;
        self.check_key(key)?;
        let value = value.into_value()?;
        self.publish(&Frame::Cell { key, value })
    }

    /// Same write path as [`Producer::push`] without the running-flag and key
    /// checks, for callers that already hold those guarantees. Free space is
    /// still checked: a full channel reports `Backpressure` rather than
    /// overwriting unread cells. An oversized key is cut to `key_size`.
    pub fn push_unsafe(&self, key: &str, value: Value) -> Result<()> {
        let _guard = self.enter()?;
        let key = truncate_key(key, self.channel.key_size());
        self.publish(&Frame::Cell { key, value })
    }

    /// Pushes a framed record. Either every cell of the record becomes
    /// visible to the consumer in one commit, or nothing does.
    pub fn push_object<I, K, V>(&self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: IntoValue,
    {
        let _guard = self.enter()?;
        self.ensure_running()?;

        let mut owned: Vec<(K, Value)> = Vec::new();
        for (key, value) in fields {
            self.check_key(key.as_ref())?;
            owned.push((key, value.into_value()?));
        }
        let view: Vec<(&str, Value)> = owned.iter().map(|(k, v)| (k.as_ref(), *v)).collect();
        self.publish(&Frame::Object(&view))
    }

    pub fn is_running(&self) -> bool {
        self.channel.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::Indices;
    use crate::record::{Delivery, END_KEY, START_KEY};
    use crate::store::{QueueStore, SharedSlotStore};

    fn running_shared(capacity: u64, key_size: usize) -> Producer {
        let store = Arc::new(SharedSlotStore::create(capacity, key_size).unwrap());
        store.set_running(true);
        Producer::new(store)
    }

    fn keys(producer: &Producer) -> Vec<String> {
        let ch = producer.channel();
        let idx = ch.indices();
        (idx.read..idx.write)
            .map(|c| match ch.read(c).unwrap() {
                Delivery::Cell { key, .. } => key,
                Delivery::Object(_) => unreachable!(),
            })
            .collect()
    }

    #[test]
    fn test_push_requires_running_worker() {
        let store = Arc::new(SharedSlotStore::create(4, 8).unwrap());
        let producer = Producer::new(store);
        assert!(matches!(
            producer.push("x", 1),
            Err(TelemetryError::WorkerStopped)
        ));
        assert!(matches!(
            producer.push_object(vec![("a", Value::Int(1))]),
            Err(TelemetryError::WorkerStopped)
        ));
    }

    #[test]
    fn test_key_checks_happen_before_mutation() {
        let producer = running_shared(4, 8);
        assert!(matches!(
            producer.push("way_too_long", 1),
            Err(TelemetryError::KeyTooLong { len: 12, max: 8 })
        ));
        assert!(matches!(
            producer.push(START_KEY, 1),
            Err(TelemetryError::ReservedKey { .. })
        ));
        assert!(matches!(
            producer.push_object(vec![("ok", Value::Int(1)), (END_KEY, Value::Int(2))]),
            Err(TelemetryError::ReservedKey { .. })
        ));
        assert_eq!(producer.channel().indices(), Indices::default());
    }

    #[test]
    fn test_backpressure_scenario() {
        // capacity=4, key_size=8: 第一个对象占 3 个 cell，剩余 1 < 3
        let producer = running_shared(4, 8);
        producer.push_object(vec![("a", Value::Int(1))]).unwrap();
        let before = producer.channel().indices();
        assert!(matches!(
            producer.push_object(vec![("b", Value::Int(2))]),
            Err(TelemetryError::Backpressure {
                requested: 3,
                free: 1
            })
        ));
        assert_eq!(producer.channel().indices(), before);
        assert_eq!(before, Indices { read: 0, write: 3 });
    }

    #[test]
    fn test_push_fills_to_capacity() {
        let producer = running_shared(3, 8);
        for i in 0..3 {
            producer.push("k", i).unwrap();
        }
        assert!(matches!(
            producer.push("k", 3),
            Err(TelemetryError::Backpressure {
                requested: 1,
                free: 0
            })
        ));
        assert_eq!(producer.channel().indices().pending(), 3);
    }

    #[test]
    fn test_push_unsafe_skips_checks_but_not_capacity() {
        let store = Arc::new(SharedSlotStore::create(1, 4).unwrap());
        let producer = Producer::new(store);
        // 未运行也可写入，超长 key 被截断
        producer.push_unsafe("abcdef", Value::Int(1)).unwrap();
        assert_eq!(keys(&producer), vec!["abcd".to_string()]);
        assert!(matches!(
            producer.push_unsafe("x", Value::Int(2)),
            Err(TelemetryError::Backpressure { .. })
        ));
    }

    #[test]
    fn test_object_layout() {
        let producer = running_shared(8, 8);
        producer
            .push_object(crate::fields! { "name" => "batch", "size" => 10 }.unwrap())
            .unwrap();
        assert_eq!(keys(&producer), vec![START_KEY, "name", "size", END_KEY]);
    }

    #[test]
    fn test_concurrent_push_is_detected() {
        let producer = running_shared(8, 8);
        let clone = producer.clone();
        let held = producer.enter().unwrap();
        assert!(matches!(
            clone.push("x", 1),
            Err(TelemetryError::ConcurrentProducer)
        ));
        drop(held);
        clone.push("x", 1).unwrap();
    }

    #[test]
    fn test_queue_backend_counts_records() {
        let store = Arc::new(QueueStore::new(2, 8).unwrap());
        store.set_running(true);
        let producer = Producer::new(store);
        producer.push_object(vec![("a", 1), ("b", 2)]).unwrap();
        producer.push("c", 3).unwrap();
        assert!(matches!(
            producer.push("d", 4),
            Err(TelemetryError::Backpressure { .. })
        ));
    }

    #[test]
    fn test_truncate_key_on_char_boundary() {
        assert_eq!(truncate_key("héllo", 2), "h");
        assert_eq!(truncate_key("abc", 8), "abc");
    }
}
