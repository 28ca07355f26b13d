//! Error handling for the telemetry channel

use std::time::Duration;

/// Channel error types
#[derive(Debug, thiserror::Error)]
pub enum TelemetryError {
    #[error("Channel used before it was started")]
    NotInitialized,

    #[error("Consumer worker is not running")]
    WorkerStopped,

    #[error("Key is {len} bytes, storage allows {max}")]
    KeyTooLong { len: usize, max: usize },

    #[error("Text value is {len} bytes, a value slot holds {max}")]
    ValueTooLong { len: usize, max: usize },

    #[error("Value {value} does not fit in a 64-bit signed slot")]
    ValueOutOfRange { value: String },

    #[error("Key {key:?} is reserved for record framing")]
    ReservedKey { key: String },

    #[error("Not enough free cells: requested {requested}, free {free}")]
    Backpressure { requested: u64, free: u64 },

    #[error("Worker did not report ready within {waited:?}")]
    StartupTimeout { waited: Duration },

    #[error("Channel not drained within {waited:?}, {pending} cells pending")]
    DrainTimeout { waited: Duration, pending: u64 },

    #[error("Another push is already in progress on this channel")]
    ConcurrentProducer,

    #[error("Shared memory error: {message}")]
    SharedMemory { message: String },

    #[error("Transport error: {message}")]
    Transport { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    #[error("Observer error: {message}")]
    Observer { message: String },

    #[error("Report error: {message}")]
    Report { message: String },

    #[error("IO error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("Config parse error: {source}")]
    Toml {
        #[from]
        source: toml::de::Error,
    },
}

/// Convenient Result type alias
pub type Result<T> = std::result::Result<T, TelemetryError>;

impl TelemetryError {
    pub fn shared_memory<S: Into<String>>(message: S) -> Self {
        Self::SharedMemory {
            message: message.into(),
        }
    }

    pub fn transport<S: Into<String>>(message: S) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    pub fn observer<S: Into<String>>(message: S) -> Self {
        Self::Observer {
            message: message.into(),
        }
    }

    pub fn report<S: Into<String>>(message: S) -> Self {
        Self::Report {
            message: message.into(),
        }
    }

    /// Only a full channel is worth retrying; everything else needs a fix or a restart.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::Backpressure { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_backpressure_is_recoverable() {
        let full = TelemetryError::Backpressure {
            requested: 3,
            free: 1,
        };
        assert!(full.is_recoverable());
        assert!(!TelemetryError::WorkerStopped.is_recoverable());
        assert!(!TelemetryError::KeyTooLong { len: 9, max: 8 }.is_recoverable());
    }

    #[test]
    fn test_messages() {
        let err = TelemetryError::KeyTooLong { len: 9, max: 8 };
        assert_eq!(err.to_string(), "Key is 9 bytes, storage allows 8");
        assert_eq!(
            TelemetryError::config("bad").to_string(),
            "Configuration error: bad"
        );
    }
}
