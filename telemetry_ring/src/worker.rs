//! Consumer loop and the execution unit that runs it.
//!
//! The loop owns the observer for its whole life. It marks the channel
//! running, then keeps draining every published cell in index order until
//! the flag is cleared, and on the way out always clears the flag itself so
//! producers notice a dead consumer.

use crate::backoff::Backoff;
use crate::channel::Channel;
use crate::config::{PollConfig, WorkerKind};
use crate::error::{Result, TelemetryError};
use crate::observer::{Observer, ObserverFactory};
use crate::record::Delivery;
use nix::sys::signal::{kill, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

/// Counters reported when the loop ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WorkerStats {
    /// Cells (or queue records) handed to the observer.
    pub delivered: u64,
    /// Observer calls that returned an error or panicked.
    pub failures: u64,
    /// Construction, `enter` and `exit` all succeeded.
    pub clean: bool,
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs `f` and folds both error returns and panics into one `Err(String)`.
fn guarded<T>(what: &str, f: impl FnOnce() -> anyhow::Result<T>) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(e)) => Err(format!("{} failed: {:#}", what, e)),
        Err(payload) => Err(format!("{} panicked: {}", what, panic_message(payload.as_ref()))),
    }
}

fn dispatch(observer: &mut dyn Observer, delivery: Delivery) -> anyhow::Result<()> {
    match delivery {
        Delivery::Cell { key, value } => observer.on_event(&key, value),
        Delivery::Object(object) => observer.on_object(object),
    }
}

/// The consumer loop. Returns once the running flag is observed cleared and
/// every cell published before that observation has been delivered.
pub fn run(channel: &dyn Channel, factory: ObserverFactory, poll: &PollConfig) -> WorkerStats {
    let mut stats = WorkerStats::default();

    // 先构造并进入 observer，失败时不置位 running，生产者直接看到停止状态
    let mut observer = match guarded("observer construction", factory) {
        Ok(observer) => observer,
        Err(message) => {
            log::error!("{}", message);
            channel.set_running(false);
            return stats;
        }
    };
    if let Err(message) = guarded("observer enter", || observer.enter()) {
        log::error!("{}", message);
        channel.set_running(false);
        return stats;
    }

    // 控制端已放弃等待时不再进入运行状态，直接退出 observer
    if !channel.mark_ready() {
        log::warn!("Startup was abandoned by the controller, worker leaving");
        if let Err(message) = guarded("observer exit", || observer.exit()) {
            log::error!("{}", message);
        }
        return stats;
    }
    log::info!(
        "Worker running: backend={:?}, capacity={}",
        channel.backend(),
        channel.capacity()
    );

    let mut backoff = Backoff::from_config(poll);
    let mut cursor = channel.read_index();
    loop {
        // 先读 running，再读 write_index：停止前发布的数据一定能被读到
        let running = channel.is_running();
        let frontier = channel.write_index();

        let progressed = cursor < frontier;
        while cursor < frontier {
            let result = match channel.read(cursor) {
                Ok(delivery) => guarded("observer", || dispatch(observer.as_mut(), delivery)),
                Err(e) => Err(format!("read of cell {} failed: {}", cursor, e)),
            };
            if let Err(message) = result {
                stats.failures += 1;
                log::error!("{}", message);
            }
            stats.delivered += 1;
            cursor += 1;
            channel.commit_read(1);
        }

        if !running {
            break;
        }
        if progressed {
            backoff.reset();
        } else {
            // 空闲时让 observer 有机会投递缓冲的数据，失败留到下次再试
            if let Err(message) = guarded("observer idle", || observer.on_idle()) {
                log::debug!("{}", message);
            }
            backoff.snooze();
        }
    }

    stats.clean = match guarded("observer exit", || observer.exit()) {
        Ok(()) => true,
        Err(message) => {
            log::error!("{}", message);
            false
        }
    };
    channel.set_running(false);
    log::info!(
        "Worker stopped: delivered={}, failures={}, clean={}",
        stats.delivered,
        stats.failures,
        stats.clean
    );
    stats
}

/// A running consumer.
#[derive(Debug)]
pub enum WorkerHandle {
    Thread(JoinHandle<WorkerStats>),
    Process {
        pid: Pid,
        reaped: Option<WaitStatus>,
    },
}

impl WorkerHandle {
    /// Starts the consumer loop on a new thread or in a forked child.
    ///
    /// A forked child only runs the loop and leaves through `_exit`, it never
    /// returns into the caller's code or runs destructors of the parent's
    /// state. Observers for a process worker should open their own resources
    /// in the factory.
    pub fn spawn(
        kind: WorkerKind,
        channel: Arc<dyn Channel>,
        factory: ObserverFactory,
        poll: PollConfig,
    ) -> Result<Self> {
        match kind {
            WorkerKind::Thread => {
                let handle = thread::Builder::new()
                    .name("telemetry-worker".to_string())
                    .spawn(move || run(channel.as_ref(), factory, &poll))?;
                Ok(WorkerHandle::Thread(handle))
            }
            WorkerKind::Process => {
                // SAFETY: 子进程只执行 run() 然后 _exit，不会回到调用者的栈
                match unsafe { fork() } {
                    Ok(ForkResult::Child) => {
                        let stats = run(channel.as_ref(), factory, &poll);
                        let code = if stats.clean { 0 } else { 1 };
                        // SAFETY: 跳过 atexit 和父进程状态的析构
                        unsafe { libc::_exit(code) }
                    }
                    Ok(ForkResult::Parent { child }) => {
                        log::info!("Forked worker process {}", child);
                        Ok(WorkerHandle::Process {
                            pid: child,
                            reaped: None,
                        })
                    }
                    Err(errno) => Err(TelemetryError::transport(format!("fork failed: {}", errno))),
                }
            }
        }
    }

    pub fn kind(&self) -> WorkerKind {
        match self {
            WorkerHandle::Thread(_) => WorkerKind::Thread,
            WorkerHandle::Process { .. } => WorkerKind::Process,
        }
    }

    /// Non-blocking liveness check.
    pub fn has_exited(&mut self) -> bool {
        match self {
            WorkerHandle::Thread(handle) => handle.is_finished(),
            WorkerHandle::Process { pid, reaped } => {
                if reaped.is_some() {
                    return true;
                }
                match waitpid(*pid, Some(WaitPidFlag::WNOHANG)) {
                    Ok(WaitStatus::StillAlive) => false,
                    Ok(status) => {
                        *reaped = Some(status);
                        true
                    }
                    Err(errno) => {
                        log::warn!("waitpid({}) failed: {}", pid, errno);
                        true
                    }
                }
            }
        }
    }

    /// Gives up on a worker that never became ready. A child process is
    /// killed and reaped; a thread cannot be killed and is left detached.
    /// Call [`Channel::abandon`] first so a detached thread leaves through
    /// `exit()` once its startup finishes instead of running the loop.
    pub fn abort(mut self) {
        if self.has_exited() {
            if let Err(e) = self.join() {
                log::warn!("Worker ended with error: {}", e);
            }
            return;
        }
        match self {
            WorkerHandle::Thread(_) => {
                log::warn!("Detaching unresponsive worker thread");
            }
            WorkerHandle::Process { pid, .. } => {
                if let Err(errno) = kill(pid, Signal::SIGKILL) {
                    log::warn!("kill({}) failed: {}", pid, errno);
                }
                if let Err(errno) = waitpid(pid, None) {
                    log::warn!("waitpid({}) failed: {}", pid, errno);
                }
            }
        }
    }

    /// Waits for the worker to finish. Thread workers return their stats;
    /// process workers only report whether the child exited cleanly.
    pub fn join(self) -> Result<WorkerStats> {
        match self {
            WorkerHandle::Thread(handle) => handle
                .join()
                .map_err(|payload| TelemetryError::observer(panic_message(payload.as_ref()))),
            WorkerHandle::Process { pid, reaped } => {
                let status = match reaped {
                    Some(status) => status,
                    None => waitpid(pid, None)
                        .map_err(|e| TelemetryError::transport(format!("waitpid failed: {}", e)))?,
                };
                log::info!("Worker process {} finished: {:?}", pid, status);
                Ok(WorkerStats {
                    clean: matches!(status, WaitStatus::Exited(_, 0)),
                    ..WorkerStats::default()
                })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observer::factory;
    use crate::record::{Object, Value};
    use crate::store::{QueueStore, SharedSlotStore};
    use std::sync::Mutex;

    #[derive(Clone, Default)]
    struct Seen(Arc<Mutex<Vec<String>>>);

    struct Recorder {
        seen: Seen,
        fail_on: Option<&'static str>,
    }

    impl Observer for Recorder {
        fn on_event(&mut self, key: &str, _value: Value) -> anyhow::Result<()> {
            self.seen.0.lock().unwrap().push(key.to_string());
            match self.fail_on {
                Some("panic") if key == "boom" => panic!("boom"),
                Some(bad) if key == bad => anyhow::bail!("rejected {}", key),
                _ => Ok(()),
            }
        }
    }

    fn quick_poll() -> PollConfig {
        PollConfig {
            spins: 4,
            min_sleep_us: 10,
            max_sleep_us: 100,
        }
    }

    fn write_cell(channel: &dyn Channel, key: &str, n: i64) {
        let frame = crate::record::Frame::Cell {
            key,
            value: Value::Int(n),
        };
        let r = channel.reserve(1).unwrap();
        channel.write(r.start, &frame).unwrap();
        channel.commit_write(1);
    }

    #[test]
    fn test_drains_everything_published_before_stop() {
        let store = SharedSlotStore::create(16, 8).unwrap();
        for (i, key) in ["a", "b", "c"].iter().enumerate() {
            write_cell(&store, key, i as i64);
        }
        // 启动前已发布的数据与停止前最后一条都要送达
        let seen = Seen::default();
        let observer = Recorder {
            seen: seen.clone(),
            fail_on: None,
        };
        let stop = std::thread::scope(|s| {
            let worker = s.spawn(|| run(&store, factory(move || Ok(observer)), &quick_poll()));
            while !store.is_running() && !worker.is_finished() {
                std::thread::yield_now();
            }
            write_cell(&store, "d", 3);
            store.set_running(false);
            worker.join().unwrap()
        });
        assert_eq!(*seen.0.lock().unwrap(), vec!["a", "b", "c", "d"]);
        assert_eq!(stop.delivered, 4);
        assert!(stop.clean);
        assert!(store.indices().is_drained());
        assert!(!store.is_running());
    }

    #[test]
    fn test_observer_failures_do_not_stop_the_loop() {
        let store = SharedSlotStore::create(16, 8).unwrap();
        for key in ["a", "bad", "boom", "z"] {
            write_cell(&store, key, 0);
        }
        let seen = Seen::default();
        let seen2 = seen.clone();
        let stats = std::thread::scope(|s| {
            let worker = s.spawn(|| {
                run(
                    &store,
                    factory(move || {
                        Ok(Recorder {
                            seen: seen2,
                            fail_on: Some("bad"),
                        })
                    }),
                    &quick_poll(),
                )
            });
            while store.read_index() < 4 {
                std::thread::yield_now();
            }
            store.set_running(false);
            worker.join().unwrap()
        });
        assert_eq!(*seen.0.lock().unwrap(), vec!["a", "bad", "boom", "z"]);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_observer_panic_is_contained() {
        let store = SharedSlotStore::create(16, 8).unwrap();
        for key in ["boom", "after"] {
            write_cell(&store, key, 0);
        }
        let seen = Seen::default();
        let seen2 = seen.clone();
        let stats = std::thread::scope(|s| {
            let worker = s.spawn(|| {
                run(
                    &store,
                    factory(move || {
                        Ok(Recorder {
                            seen: seen2,
                            fail_on: Some("panic"),
                        })
                    }),
                    &quick_poll(),
                )
            });
            while store.read_index() < 2 {
                std::thread::yield_now();
            }
            store.set_running(false);
            worker.join().unwrap()
        });
        assert_eq!(*seen.0.lock().unwrap(), vec!["boom", "after"]);
        assert_eq!(stats.failures, 1);
    }

    #[test]
    fn test_construction_failure_leaves_channel_stopped() {
        let store = SharedSlotStore::create(4, 8).unwrap();
        store.set_running(true);
        let failing: ObserverFactory = Box::new(|| -> anyhow::Result<Box<dyn Observer>> {
            anyhow::bail!("no sink")
        });
        let stats = run(&store, failing, &quick_poll());
        assert!(!stats.clean);
        assert_eq!(stats.delivered, 0);
        assert!(!store.is_running());
    }

    #[test]
    fn test_abandoned_startup_exits_observer_without_running() {
        struct Tracked(Arc<Mutex<Vec<&'static str>>>);
        impl Observer for Tracked {
            fn enter(&mut self) -> anyhow::Result<()> {
                self.0.lock().unwrap().push("enter");
                Ok(())
            }
            fn on_event(&mut self, _key: &str, _value: Value) -> anyhow::Result<()> {
                self.0.lock().unwrap().push("event");
                Ok(())
            }
            fn exit(&mut self) -> anyhow::Result<()> {
                self.0.lock().unwrap().push("exit");
                Ok(())
            }
        }

        let store = SharedSlotStore::create(4, 8).unwrap();
        write_cell(&store, "a", 1);
        store.abandon();

        let calls = Arc::new(Mutex::new(Vec::new()));
        let calls2 = calls.clone();
        let stats = run(&store, factory(move || Ok(Tracked(calls2))), &quick_poll());

        assert_eq!(*calls.lock().unwrap(), vec!["enter", "exit"]);
        assert_eq!(stats.delivered, 0);
        assert!(!stats.clean);
        assert!(!store.is_running());
        assert_eq!(store.read_index(), 0);
    }

    #[test]
    fn test_queue_records_reach_on_object() {
        struct Objects(Arc<Mutex<Vec<Object>>>);
        impl Observer for Objects {
            fn on_event(&mut self, _key: &str, _value: Value) -> anyhow::Result<()> {
                unreachable!("queue records arrive whole")
            }
            fn on_object(&mut self, object: Object) -> anyhow::Result<()> {
                self.0.lock().unwrap().push(object);
                Ok(())
            }
        }

        let store = Arc::new(QueueStore::new(4, 8).unwrap());
        let got = Arc::new(Mutex::new(Vec::new()));
        let got2 = got.clone();
        let mut handle = WorkerHandle::spawn(
            WorkerKind::Thread,
            store.clone(),
            factory(move || Ok(Objects(got2))),
            quick_poll(),
        )
        .unwrap();
        while !store.is_running() {
            std::thread::yield_now();
        }
        let fields = [("a", Value::Int(1)), ("b", Value::Int(2))];
        let r = store.reserve(1).unwrap();
        store.write(r.start, &crate::record::Frame::Object(&fields)).unwrap();
        store.commit_write(1);
        while store.read_index() < 1 {
            std::thread::yield_now();
        }
        assert!(!handle.has_exited());
        store.set_running(false);
        assert!(handle.join().unwrap().clean);

        let got = got.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].get("b"), Some(Value::Int(2)));
    }
}
