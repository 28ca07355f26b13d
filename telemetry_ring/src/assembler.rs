//! Rebuilds records from the flat cell stream.
//!
//! ```text
//!   #s  name  size  #e   x   #s  name  size  #e
//!   └──── object ────┘   │   └──── object ────┘
//!                    singleton
//! ```
//!
//! Emitted objects go to a [`Sink`]. While the sink is not ready they wait in
//! a buffer and are flushed, oldest first, before anything newer, either on
//! the next cell or when the worker goes idle.

use crate::observer::Observer;
use crate::record::{Object, Value, END_KEY, START_KEY};
use crate::sink::Sink;
use std::collections::VecDeque;

pub struct Assembler<S: Sink> {
    sink: S,
    acc: Object,
    building: bool,
    pending: VecDeque<Object>,
    emitted: u64,
    discarded: u64,
}

impl<S: Sink> Assembler<S> {
    pub fn new(sink: S) -> Self {
        Self {
            sink,
            acc: Object::new(),
            building: false,
            pending: VecDeque::new(),
            emitted: 0,
            discarded: 0,
        }
    }

    pub fn sink(&self) -> &S {
        &self.sink
    }

    /// Objects waiting for the sink.
    pub fn pending(&self) -> usize {
        self.pending.len()
    }

    /// Objects handed to the sink so far.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    /// Partial objects dropped because a new frame started before `#e`.
    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    /// Pushes buffered objects while the sink accepts them. Stops at the first
    /// failure and keeps that object at the head of the buffer.
    fn flush(&mut self) -> anyhow::Result<()> {
        while self.sink.is_ready() {
            let Some(object) = self.pending.front() else {
                break;
            };
            self.sink.push(object)?;
            self.pending.pop_front();
            self.emitted += 1;
        }
        Ok(())
    }

    fn emit(&mut self, object: Object) -> anyhow::Result<()> {
        self.pending.push_back(object);
        self.flush()
    }
}

impl<S: Sink> Observer for Assembler<S> {
    fn on_event(&mut self, key: &str, value: Value) -> anyhow::Result<()> {
        match key {
            START_KEY => {
                if self.building {
                    log::warn!(
                        "Frame restarted before it ended, dropping {} partial fields",
                        self.acc.len()
                    );
                    self.discarded += 1;
                }
                self.acc.clear();
                self.building = true;
                Ok(())
            }
            END_KEY => {
                if !self.building {
                    log::warn!("Frame end without a start, ignored");
                    return Ok(());
                }
                self.building = false;
                let object = std::mem::take(&mut self.acc);
                self.emit(object)
            }
            _ if self.building => {
                self.acc.insert(key, value);
                Ok(())
            }
            _ => self.emit(Object::singleton(key, value)),
        }
    }

    fn on_object(&mut self, object: Object) -> anyhow::Result<()> {
        self.emit(object)
    }

    fn on_idle(&mut self) -> anyhow::Result<()> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.flush()
    }

    fn exit(&mut self) -> anyhow::Result<()> {
        if self.building {
            log::warn!(
                "Worker stopped inside a frame, dropping {} partial fields",
                self.acc.len()
            );
        }
        self.flush()?;
        if !self.pending.is_empty() {
            anyhow::bail!(
                "sink never became ready, {} objects undelivered",
                self.pending.len()
            );
        }
        log::info!("Assembler emitted {} objects", self.emitted);
        self.sink.complete()
    }
}
