//! Downstream consumers of assembled objects.
//!
//! A [`Sink`] is whatever the assembled records are pushed into: a channel
//! feeding another thread, a file, a statistics accumulator. A sink may not
//! be ready when the first records arrive (nothing subscribed yet); the
//! assembler holds records back until [`Sink::is_ready`] turns true.

use crate::record::Object;
use anyhow::Context;
use crossbeam_channel::Sender;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

pub trait Sink: Send {
    fn is_ready(&self) -> bool {
        true
    }

    /// Delivers one object. On error the caller keeps the object and retries
    /// later, so implementations must not half-consume it.
    fn push(&mut self, object: &Object) -> anyhow::Result<()>;

    /// Called once when the worker shuts down.
    fn complete(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<S: Sink + ?Sized> Sink for Box<S> {
    fn is_ready(&self) -> bool {
        (**self).is_ready()
    }

    fn push(&mut self, object: &Object) -> anyhow::Result<()> {
        (**self).push(object)
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        (**self).complete()
    }
}

/// Closure sink, always ready.
pub struct FnSink<F> {
    f: F,
}

impl<F> FnSink<F>
where
    F: FnMut(&Object) -> anyhow::Result<()> + Send,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> Sink for FnSink<F>
where
    F: FnMut(&Object) -> anyhow::Result<()> + Send,
{
    fn push(&mut self, object: &Object) -> anyhow::Result<()> {
        (self.f)(object)
    }
}

/// Forwards objects to another thread through a crossbeam channel.
pub struct ChannelSink {
    tx: Sender<Object>,
}

impl ChannelSink {
    pub fn new(tx: Sender<Object>) -> Self {
        Self { tx }
    }
}

impl Sink for ChannelSink {
    fn push(&mut self, object: &Object) -> anyhow::Result<()> {
        self.tx
            .send(object.clone())
            .map_err(|_| anyhow::anyhow!("object receiver dropped"))
    }
}

type Downstream = Box<dyn Sink>;

/// Sink whose downstream is attached after the worker started.
///
/// Until [`SinkAttach::attach`] is called the sink reports not ready and the
/// assembler buffers; afterwards every call goes to the attached sink.
pub struct DeferredSink {
    slot: Arc<Mutex<Option<Downstream>>>,
}

/// Handle that plugs the real downstream into a [`DeferredSink`].
#[derive(Clone)]
pub struct SinkAttach {
    slot: Arc<Mutex<Option<Downstream>>>,
}

impl DeferredSink {
    pub fn pair() -> (Self, SinkAttach) {
        let slot = Arc::new(Mutex::new(None));
        (
            Self { slot: slot.clone() },
            SinkAttach { slot },
        )
    }
}

impl SinkAttach {
    /// Replaces any previously attached downstream.
    pub fn attach(&self, sink: impl Sink + 'static) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(sink));
    }

    pub fn is_attached(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }
}

impl Sink for DeferredSink {
    fn is_ready(&self) -> bool {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|sink| sink.is_ready())
    }

    fn push(&mut self, object: &Object) -> anyhow::Result<()> {
        match self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(sink) => sink.push(object),
            None => anyhow::bail!("no downstream attached"),
        }
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        match self
            .slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_mut()
        {
            Some(sink) => sink.complete(),
            None => anyhow::bail!("downstream was never attached"),
        }
    }
}

/// Appends every object as one JSON line. Works from a forked worker, the
/// file is opened inside the consumer.
pub struct JsonLinesSink {
    writer: BufWriter<File>,
}

impl JsonLinesSink {
    pub fn create(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .with_context(|| format!("open {:?}", path))?;
        Ok(Self {
            writer: BufWriter::new(file),
        })
    }
}

impl Sink for JsonLinesSink {
    fn push(&mut self, object: &Object) -> anyhow::Result<()> {
        let line = serde_json::to_string(object)?;
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn complete(&mut self) -> anyhow::Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}
