// src/store/mod.rs

//! Slot store backends. Both implement [`crate::Channel`].

pub mod queue;
pub mod shm;

pub use queue::QueueStore;
pub use shm::SharedSlotStore;

use crate::channel::Channel;
use crate::config::{Backend, TelemetryConfig};
use crate::error::Result;
use std::sync::Arc;

/// Allocates the store the configuration selects.
pub fn create(config: &TelemetryConfig) -> Result<Arc<dyn Channel>> {
    let store: Arc<dyn Channel> = match config.backend {
        Backend::Shared => Arc::new(SharedSlotStore::create(config.capacity, config.key_size)?),
        Backend::Queue => Arc::new(QueueStore::new(config.capacity, config.key_size)?),
    };
    Ok(store)
}
