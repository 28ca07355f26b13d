//! Low-overhead telemetry transport.
//!
//! A single producer pushes key/value cells from the application's hot path
//! into a fixed-capacity channel; a background worker (thread or forked
//! process) drains them, reassembles framed records and hands them to a
//! [`Sink`]. Producer calls never block: a full channel is reported as
//! [`TelemetryError::Backpressure`].
//!
//! ```no_run
//! use telemetry_ring::{factory, fields, Assembler, FnSink, Object, Telemetry, TelemetryConfig};
//!
//! let print = FnSink::new(|o: &Object| {
//!     println!("{:?}", o);
//!     Ok(())
//! });
//! let sink = move || Ok(Assembler::new(print));
//! Telemetry::scope(TelemetryConfig::default(), factory(sink), |t| {
//!     t.push_object(fields! { "name" => "batch", "size" => 1024 }?)?;
//!     Ok::<_, telemetry_ring::TelemetryError>(())
//! })?;
//! # Ok::<_, telemetry_ring::TelemetryError>(())
//! ```

pub mod assembler;
pub mod backoff;
pub mod channel;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod observer;
pub mod producer;
pub mod record;
pub mod report;
pub mod sink;
pub mod stats;
pub mod store;
pub mod worker;

pub use assembler::Assembler;
pub use channel::{Channel, Indices, Reservation};
pub use config::{
    Backend, LoggingConfig, PollConfig, TelemetryConfig, WorkerKind, MAX_CAPACITY, MAX_KEY_SIZE,
};
pub use error::{Result, TelemetryError};
pub use lifecycle::{State, Telemetry};
pub use observer::{factory, NullObserver, Observer, ObserverFactory};
pub use producer::Producer;
pub use record::{IntoValue, Label, Object, Value, END_KEY, START_KEY};
pub use report::{stat_stream_table, Cell, Table, TableFormat};
pub use sink::{ChannelSink, DeferredSink, FnSink, JsonLinesSink, Sink, SinkAttach};
pub use stats::{RateMeter, StatStream};
pub use store::{QueueStore, SharedSlotStore};
pub use worker::{WorkerHandle, WorkerStats};
