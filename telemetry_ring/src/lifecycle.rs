//! Owns the channel, the producer and the worker from start to release.
//!
//! ```text
//!   Created ──start()──▶ Started ──worker ready──▶ Running
//!                                                     │ release()
//!                                                     ▼
//!                         Stopped ◀──worker joined── Draining
//! ```
//!
//! Release always drains before it asks the worker to stop; stopping first
//! would let the worker leave with published cells unread.

use crate::backoff::{poll_until, Backoff};
use crate::channel::{Channel, Indices};
use crate::config::TelemetryConfig;
use crate::error::{Result, TelemetryError};
use crate::observer::ObserverFactory;
use crate::producer::Producer;
use crate::record::{IntoValue, Value};
use crate::store;
use crate::worker::{WorkerHandle, WorkerStats};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Created,
    Started,
    Running,
    Draining,
    Stopped,
}

pub struct Telemetry {
    config: TelemetryConfig,
    factory: Option<ObserverFactory>,
    state: State,
    channel: Option<Arc<dyn Channel>>,
    producer: Option<Producer>,
    // 推送路径只有 &self，探测子进程存活需要可变访问
    worker: Mutex<Option<WorkerHandle>>,
    worker_stats: Option<WorkerStats>,
}

impl Telemetry {
    pub fn new(config: TelemetryConfig, factory: ObserverFactory) -> Self {
        Self {
            config,
            factory: Some(factory),
            state: State::Created,
            channel: None,
            producer: None,
            worker: Mutex::new(None),
            worker_stats: None,
        }
    }

    /// Starts a channel, runs `body` against it and releases it afterwards,
    /// whatever `body` returned. An error from `body` takes precedence over
    /// one from the release.
    pub fn scope<T, E>(
        config: TelemetryConfig,
        factory: ObserverFactory,
        body: impl FnOnce(&mut Telemetry) -> std::result::Result<T, E>,
    ) -> std::result::Result<T, E>
    where
        E: From<TelemetryError>,
    {
        let mut telemetry = Telemetry::new(config, factory);
        telemetry.start()?;
        let outcome = body(&mut telemetry);
        let released = telemetry.release();
        let value = outcome?;
        released?;
        Ok(value)
    }

    /// Allocates the store, launches the worker and waits until it reports
    /// ready.
    pub fn start(&mut self) -> Result<()> {
        if self.state != State::Created {
            return Err(TelemetryError::config(format!(
                "start() called in state {:?}",
                self.state
            )));
        }
        self.config.validate()?;
        let factory = self.factory.take().ok_or(TelemetryError::NotInitialized)?;

        let channel = store::create(&self.config)?;
        self.state = State::Started;
        log::info!(
            "Store created: backend={:?}, capacity={}, key_size={}",
            self.config.backend,
            self.config.capacity,
            self.config.key_size
        );

        let mut worker = match WorkerHandle::spawn(
            self.config.worker,
            channel.clone(),
            factory,
            self.config.poll.clone(),
        ) {
            Ok(worker) => worker,
            Err(e) => {
                self.state = State::Stopped;
                return Err(e);
            }
        };

        let mut backoff = Backoff::from_config(&self.config.poll);
        let ready = poll_until(&mut backoff, self.config.startup_timeout(), || {
            if channel.is_running() {
                Some(Ok(()))
            } else if worker.has_exited() {
                Some(Err(TelemetryError::WorkerStopped))
            } else {
                None
            }
        })
        .unwrap_or_else(|waited| Err(TelemetryError::StartupTimeout { waited }));

        if let Err(e) = ready {
            log::error!("Worker failed to start: {}", e);
            channel.abandon();
            worker.abort();
            self.state = State::Stopped;
            return Err(e);
        }

        log::info!("Worker ready ({:?})", worker.kind());
        self.producer = Some(Producer::new(channel.clone()));
        self.channel = Some(channel);
        *self.worker.get_mut().unwrap_or_else(PoisonError::into_inner) = Some(worker);
        self.state = State::Running;
        Ok(())
    }

    fn live_producer(&self) -> Result<&Producer> {
        match (self.state, self.producer.as_ref()) {
            (State::Running, Some(producer)) => Ok(producer),
            (State::Created | State::Started, _) => Err(TelemetryError::NotInitialized),
            _ => Err(TelemetryError::WorkerStopped),
        }
    }

    fn worker_slot(&self) -> MutexGuard<'_, Option<WorkerHandle>> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// A worker killed by a signal never clears the running flag, so a full
    /// channel is the first sign of it. Checked only on backpressure to keep
    /// the push path free of syscalls.
    fn check_backpressure(&self, pushed: Result<()>) -> Result<()> {
        match pushed {
            Err(e) if e.is_recoverable() => {
                let exited = self.worker_slot().as_mut().is_some_and(|w| w.has_exited());
                if !exited {
                    return Err(e);
                }
                log::warn!("Worker exited without clearing the running flag");
                if let Some(channel) = &self.channel {
                    channel.set_running(false);
                }
                Err(TelemetryError::WorkerStopped)
            }
            other => other,
        }
    }

    /// A producer handle for code that should not own the controller.
    ///
    /// Handles only see the running flag; when the worker is killed outright
    /// they keep reporting `Backpressure` until the controller's own push or
    /// [`Telemetry::wait`] notices the exit.
    pub fn producer(&self) -> Result<Producer> {
        self.live_producer().cloned()
    }

    pub fn push(&self, key: &str, value: impl IntoValue) -> Result<()> {
        self.check_backpressure(self.live_producer()?.push(key, value))
    }

    pub fn push_unsafe(&self, key: &str, value: Value) -> Result<()> {
        self.check_backpressure(self.live_producer()?.push_unsafe(key, value))
    }

    pub fn push_object<I, K, V>(&self, fields: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: IntoValue,
    {
        self.check_backpressure(self.live_producer()?.push_object(fields))
    }

    /// Blocks until everything published before the call has been consumed,
    /// or the worker is gone. Bounded by `drain_timeout_ms`.
    pub fn wait(&mut self) -> Result<()> {
        let Some(channel) = self.channel.clone() else {
            return match self.state {
                State::Stopped => Ok(()),
                _ => Err(TelemetryError::NotInitialized),
            };
        };

        let target = channel.write_index();
        let mut backoff = Backoff::from_config(&self.config.poll);
        let worker = self.worker.get_mut().unwrap_or_else(PoisonError::into_inner);
        let drained = poll_until(&mut backoff, self.config.drain_timeout(), || {
            if channel.read_index() >= target || !channel.is_running() {
                return Some(());
            }
            // 子进程被信号杀死时 running 不会被清除，这里替它清除
            if worker.as_mut().is_some_and(|w| w.has_exited()) {
                log::warn!("Worker exited without clearing the running flag");
                channel.set_running(false);
                return Some(());
            }
            None
        });

        match drained {
            Ok(()) => {
                log::debug!("Drained up to {}", target);
                Ok(())
            }
            Err(waited) => Err(TelemetryError::DrainTimeout {
                waited,
                pending: target.saturating_sub(channel.read_index()),
            }),
        }
    }

    /// Drains, stops and joins the worker, then frees the store. Calling it
    /// again is a no-op.
    pub fn release(&mut self) -> Result<()> {
        match self.state {
            State::Stopped => return Ok(()),
            State::Created => {
                self.state = State::Stopped;
                return Ok(());
            }
            _ => {}
        }

        self.state = State::Draining;
        if let Err(e) = self.wait() {
            log::warn!("Releasing without a full drain: {}", e);
        }
        if let Some(channel) = &self.channel {
            channel.set_running(false);
        }

        let worker = self
            .worker
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let joined = match worker {
            Some(worker) => worker.join().map(|stats| {
                self.worker_stats = Some(stats);
            }),
            None => Ok(()),
        };

        if let Some(channel) = &self.channel {
            let indices = channel.indices();
            log::info!(
                "Telemetry released: read={}, write={}",
                indices.read,
                indices.write
            );
        }
        self.producer = None;
        self.channel = None;
        self.state = State::Stopped;
        joined
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Current indices, `None` unless the channel is live.
    pub fn stats(&self) -> Option<Indices> {
        self.channel.as_ref().map(|c| c.indices())
    }

    /// What the worker reported after `release()`.
    pub fn worker_stats(&self) -> Option<WorkerStats> {
        self.worker_stats
    }

    pub fn config(&self) -> &TelemetryConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.channel.as_ref().is_some_and(|c| c.is_running())
    }
}

impl Drop for Telemetry {
    fn drop(&mut self) {
        if matches!(self.state, State::Running | State::Draining) {
            if let Err(e) = self.release() {
                log::error!("Release on drop failed: {}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Backend, PollConfig};
    use crate::observer::{factory, NullObserver};

    fn config(backend: Backend) -> TelemetryConfig {
        TelemetryConfig {
            capacity: 32,
            key_size: 16,
            backend,
            startup_timeout_ms: 2_000,
            drain_timeout_ms: 2_000,
            poll: PollConfig {
                spins: 8,
                min_sleep_us: 10,
                max_sleep_us: 200,
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_push_before_start() {
        let telemetry = Telemetry::new(config(Backend::Shared), factory(|| Ok(NullObserver)));
        assert_eq!(telemetry.state(), State::Created);
        assert!(matches!(
            telemetry.push("x", 1),
            Err(TelemetryError::NotInitialized)
        ));
        assert!(matches!(
            telemetry.producer(),
            Err(TelemetryError::NotInitialized)
        ));
        assert!(telemetry.stats().is_none());
    }

    #[test]
    fn test_start_release_cycle() {
        for backend in [Backend::Shared, Backend::Queue] {
            let mut telemetry = Telemetry::new(config(backend), factory(|| Ok(NullObserver)));
            telemetry.start().unwrap();
            assert_eq!(telemetry.state(), State::Running);
            assert!(telemetry.is_running());

            for i in 0..10 {
                telemetry.push("n", i).unwrap();
            }
            telemetry.wait().unwrap();
            assert!(telemetry.stats().unwrap().is_drained());

            telemetry.release().unwrap();
            assert_eq!(telemetry.state(), State::Stopped);
            assert_eq!(telemetry.worker_stats().unwrap().delivered, 10);
            assert!(matches!(
                telemetry.push("n", 1),
                Err(TelemetryError::WorkerStopped)
            ));
            // 幂等
            telemetry.release().unwrap();
            telemetry.wait().unwrap();
        }
    }

    #[test]
    fn test_start_twice_is_rejected() {
        let mut telemetry = Telemetry::new(config(Backend::Shared), factory(|| Ok(NullObserver)));
        telemetry.start().unwrap();
        assert!(matches!(
            telemetry.start(),
            Err(TelemetryError::Config { .. })
        ));
    }

    #[test]
    fn test_invalid_config_fails_start() {
        let mut cfg = config(Backend::Shared);
        cfg.capacity = 0;
        let mut telemetry = Telemetry::new(cfg, factory(|| Ok(NullObserver)));
        assert!(matches!(
            telemetry.start(),
            Err(TelemetryError::Config { .. })
        ));
    }

    #[test]
    fn test_scope_prefers_body_error() {
        let result: Result<()> = Telemetry::scope(
            config(Backend::Queue),
            factory(|| Ok(NullObserver)),
            |t| {
                t.push("x", 1)?;
                Err(TelemetryError::observer("body failed"))
            },
        );
        assert!(matches!(result, Err(TelemetryError::Observer { .. })));
    }
}
