//! The consumer-side extension point.
//!
//! An observer is built inside the worker by its factory, entered once,
//! fed every published cell (or whole record for the queue backend), and
//! exited once when the worker stops.

use crate::record::{Object, Value, END_KEY, START_KEY};

pub trait Observer {
    fn enter(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    /// One raw cell, in index order.
    fn on_event(&mut self, key: &str, value: Value) -> anyhow::Result<()>;

    /// One whole record. The default replays it as a framed cell run so
    /// cell-level observers see the same stream from either backend.
    fn on_object(&mut self, object: Object) -> anyhow::Result<()> {
        let count = Value::Int(object.len() as i64);
        self.on_event(START_KEY, count)?;
        for (key, value) in object {
            self.on_event(&key, value)?;
        }
        self.on_event(END_KEY, count)
    }

    /// Called when a poll of the channel found nothing new.
    fn on_idle(&mut self) -> anyhow::Result<()> {
        Ok(())
    }

    fn exit(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Builds the observer inside the worker thread or process.
pub type ObserverFactory = Box<dyn FnOnce() -> anyhow::Result<Box<dyn Observer>> + Send>;

/// Boxes a typed constructor into an [`ObserverFactory`].
pub fn factory<O, F>(make: F) -> ObserverFactory
where
    O: Observer + 'static,
    F: FnOnce() -> anyhow::Result<O> + Send + 'static,
{
    Box::new(move || Ok(Box::new(make()?) as Box<dyn Observer>))
}

/// Observer that ignores everything, handy when only the producer side matters.
#[derive(Debug, Default)]
pub struct NullObserver;

impl Observer for NullObserver {
    fn on_event(&mut self, _key: &str, _value: Value) -> anyhow::Result<()> {
        Ok(())
    }
}
