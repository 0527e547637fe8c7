//! Worker execution loop.
//!
//! Each worker owns one lane endpoint and runs the same cycle until told to
//! stop: drain request frames, execute task functions, poll deferred
//! results, write results back, and on an empty pass fall into the hybrid
//! wait — a bounded busy-spin, then a timed park on the lane's wake word
//! with the parked state published so the host knows a real wake is needed.
//!
//! Task state rides in pooled shells so the steady-state loop does not
//! allocate per task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use object_pool::{Pool, ReusableOwned};
use tokio::sync::oneshot;

use spindle_core::{
    BootstrapError, FrameMeta, Payload, SendOutcome, FLAG_FULFILLED, FLAG_REJECTED,
};

use crate::lane::WorkerLane;
use crate::task::{TaskOutput, TaskRegistry, TaskResult};

/// Request frames taken per intake pass.
const BATCH_MAX: usize = 32;

/// Tasks executed per pass before the loop re-checks the rings.
const SERVICE_BATCH: usize = 3;

/// Result frames written back per pass.
const WRITE_MAX: usize = 64;

/// One task's state while it is on the worker.
pub(crate) struct Shell {
    pub id: u32,
    pub fn_id: u32,
    pub flags: u32,
    pub payload: Payload,
}

impl Shell {
    fn blank() -> Self {
        Self {
            id: 0,
            fn_id: 0,
            flags: FLAG_FULFILLED,
            payload: Payload::Unit,
        }
    }

    fn reset(&mut self) {
        self.id = 0;
        self.fn_id = 0;
        self.flags = FLAG_FULFILLED;
        self.payload = Payload::Unit;
    }
}

type PooledShell = ReusableOwned<Shell>;

/// Recycles task shells. Shells come back in whatever state they were
/// dropped, so `get` resets them; a recycled shell never exposes a previous
/// task's payload.
#[derive(Clone)]
pub(crate) struct ShellPool {
    pool: Arc<Pool<Shell>>,
}

impl ShellPool {
    pub fn new(capacity: usize) -> Self {
        Self {
            pool: Arc::new(Pool::new(capacity, Shell::blank)),
        }
    }

    pub fn get(&self) -> PooledShell {
        let mut shell = self.pool.pull_owned(Shell::blank);
        shell.reset();
        shell
    }
}

/// Resolved (not optional) worker tuning.
#[derive(Debug, Clone, Copy)]
pub(crate) struct WorkerOptions {
    pub spin_us: u64,
    pub park_ms: u64,
    pub resolve_after_finishing_all: bool,
}

pub(crate) struct Worker {
    lane: WorkerLane,
    registry: Arc<TaskRegistry>,
    options: WorkerOptions,
    shutdown: Arc<AtomicBool>,
    shells: ShellPool,
    work: VecDeque<PooledShell>,
    deferred: Vec<(PooledShell, oneshot::Receiver<TaskResult>)>,
    results: VecDeque<PooledShell>,
}

impl Worker {
    pub fn new(
        lane: WorkerLane,
        registry: Arc<TaskRegistry>,
        options: WorkerOptions,
        shutdown: Arc<AtomicBool>,
    ) -> Self {
        Self {
            lane,
            registry,
            options,
            shutdown,
            shells: ShellPool::new(BATCH_MAX * 2),
            work: VecDeque::new(),
            deferred: Vec::new(),
            results: VecDeque::new(),
        }
    }

    pub fn run(mut self) -> Result<(), BootstrapError> {
        self.lane.validate()?;
        self.registry.ensure_not_empty()?;
        self.lane.mark_awake();
        tracing::debug!(lane = self.lane.index, "worker up");

        while !self.shutdown.load(Ordering::Acquire) {
            let mut progress = 0usize;
            progress += self.intake();
            progress += self.execute();
            progress += self.poll_deferred();
            progress += self.write_back();
            if progress == 0 {
                self.idle_wait();
            }
        }

        tracing::debug!(lane = self.lane.index, "worker stopping");
        Ok(())
    }

    /// Pull request frames off the down ring into work shells. Frames that
    /// failed to decode skip execution and go straight out as rejections.
    fn intake(&mut self) -> usize {
        let shells = &self.shells;
        let work = &mut self.work;
        let results = &mut self.results;
        self.lane.rx.recv(BATCH_MAX, |frame| {
            let mut shell = shells.get();
            shell.id = frame.id;
            shell.fn_id = frame.fn_id;
            match frame.payload {
                Ok(payload) => {
                    shell.payload = payload;
                    work.push_back(shell);
                }
                Err(e) => {
                    shell.flags = FLAG_REJECTED;
                    shell.payload = Payload::Str(e.to_string());
                    results.push_back(shell);
                }
            }
        })
    }

    fn execute(&mut self) -> usize {
        let mut ran = 0;
        while ran < SERVICE_BATCH {
            let Some(mut shell) = self.work.pop_front() else {
                break;
            };
            ran += 1;

            let Some(task) = self.registry.get(shell.fn_id).cloned() else {
                shell.flags = FLAG_REJECTED;
                shell.payload = Payload::Str(format!("unknown task {}", shell.fn_id));
                self.results.push_back(shell);
                continue;
            };

            let arg = std::mem::replace(&mut shell.payload, Payload::Unit);
            match task(arg) {
                TaskOutput::Ready(result) => {
                    Self::settle(&mut shell, result);
                    self.results.push_back(shell);
                }
                TaskOutput::Deferred(rx) => self.deferred.push((shell, rx)),
            }
        }
        ran
    }

    fn poll_deferred(&mut self) -> usize {
        let mut settled = 0;
        let mut still_pending = Vec::with_capacity(self.deferred.len());
        for (mut shell, mut rx) in self.deferred.drain(..) {
            match rx.try_recv() {
                Ok(result) => {
                    Self::settle(&mut shell, result);
                    self.results.push_back(shell);
                    settled += 1;
                }
                Err(oneshot::error::TryRecvError::Empty) => still_pending.push((shell, rx)),
                Err(oneshot::error::TryRecvError::Closed) => {
                    shell.flags = FLAG_REJECTED;
                    shell.payload = Payload::str("deferred result dropped");
                    self.results.push_back(shell);
                    settled += 1;
                }
            }
        }
        self.deferred = still_pending;
        settled
    }

    fn settle(shell: &mut Shell, result: TaskResult) {
        match result {
            Ok(value) => {
                shell.flags = FLAG_FULFILLED;
                shell.payload = value;
            }
            Err(reason) => {
                shell.flags = FLAG_REJECTED;
                shell.payload = reason;
            }
        }
    }

    /// Publish finished results on the up ring, at most [`WRITE_MAX`] per
    /// pass. A result whose payload cannot be encoded is converted to a
    /// rejection carrying the encode reason and re-sent, once per attempt.
    fn write_back(&mut self) -> usize {
        if self.options.resolve_after_finishing_all
            && (!self.work.is_empty() || self.lane.rx.has_unread())
        {
            return 0;
        }

        let mut written = 0;
        while written < WRITE_MAX {
            let Some(mut shell) = self.results.pop_front() else {
                break;
            };
            let meta = FrameMeta {
                id: shell.id,
                fn_id: shell.fn_id,
                flags: shell.flags,
            };
            match self.lane.tx.send(meta, &shell.payload) {
                Ok(SendOutcome::Sent { .. }) => written += 1,
                Ok(SendOutcome::Backpressure) => {
                    self.results.push_front(shell);
                    break;
                }
                Err(e) => {
                    tracing::debug!(id = shell.id, error = %e, "result not encodable");
                    shell.flags = FLAG_REJECTED;
                    shell.payload = Payload::Str(e.to_string());
                    self.results.push_front(shell);
                }
            }
        }
        if written > 0 {
            self.lane.nudge_host();
        }
        written
    }

    fn idle_wait(&mut self) {
        // A pending deferred result can complete from any thread; stay
        // responsive instead of parking the full window.
        if !self.deferred.is_empty() {
            std::thread::sleep(Duration::from_millis(1));
            return;
        }

        let spin = Duration::from_micros(self.options.spin_us);
        let start = Instant::now();
        while start.elapsed() < spin {
            if self.lane.rx.has_unread() || self.shutdown.load(Ordering::Acquire) {
                return;
            }
            std::hint::spin_loop();
        }

        let seen = self.lane.wake_seen();
        if self.lane.rx.has_unread() || self.lane.host_busy() {
            return;
        }
        self.lane.park(seen, Duration::from_millis(self.options.park_ms));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lane::{self, LaneConfig};
    use crate::task::TaskRegistry;

    fn lane_pair() -> (crate::lane::HostLane, WorkerLane) {
        lane::create(
            90,
            LaneConfig {
                arena_initial: 4096,
                arena_max: 1 << 20,
            },
        )
        .unwrap()
    }

    fn options() -> WorkerOptions {
        WorkerOptions {
            spin_us: 10,
            park_ms: 1,
            resolve_after_finishing_all: false,
        }
    }

    #[test]
    fn recycled_shells_do_not_leak_payloads() {
        let pool = ShellPool::new(2);
        {
            let mut shell = pool.get();
            shell.id = 9;
            shell.flags = FLAG_REJECTED;
            shell.payload = Payload::str("secret");
        }
        let shell = pool.get();
        assert_eq!(shell.id, 0);
        assert_eq!(shell.flags, FLAG_FULFILLED);
        assert_eq!(shell.payload, Payload::Unit);
    }

    #[test]
    fn empty_registry_aborts_startup() {
        let (_host, worker_lane) = lane_pair();
        let worker = Worker::new(
            worker_lane,
            Arc::new(TaskRegistry::new()),
            options(),
            Arc::new(AtomicBool::new(false)),
        );
        assert_eq!(worker.run(), Err(BootstrapError::NoTasks));
    }

    #[test]
    fn executes_and_writes_back() {
        let (mut host, worker_lane) = lane_pair();
        let mut registry = TaskRegistry::new();
        registry.register_fn("shout", |p| match p {
            Payload::Str(s) => Ok(Payload::Str(s.to_uppercase())),
            other => Err(Payload::Str(format!("bad arg: {other:?}"))),
        });

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(worker_lane, Arc::new(registry), options(), shutdown.clone());
        let handle = std::thread::spawn(move || worker.run());

        host.send(
            FrameMeta {
                id: 11,
                fn_id: 0,
                flags: 0,
            },
            &Payload::str("hey"),
        )
        .unwrap();

        let mut result = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while result.is_none() && Instant::now() < deadline {
            host.rx.recv(1, |f| result = Some(f));
            std::thread::sleep(Duration::from_millis(1));
        }
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap().unwrap();

        let frame = result.expect("worker never answered");
        assert_eq!(frame.id, 11);
        assert_eq!(frame.flags, FLAG_FULFILLED);
        assert_eq!(frame.payload.unwrap(), Payload::str("HEY"));
    }

    #[test]
    fn task_error_comes_back_rejected() {
        let (mut host, worker_lane) = lane_pair();
        let mut registry = TaskRegistry::new();
        registry.register_fn("fail", |_| Err(Payload::str("boom")));

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(worker_lane, Arc::new(registry), options(), shutdown.clone());
        let handle = std::thread::spawn(move || worker.run());

        host.send(FrameMeta { id: 1, fn_id: 0, flags: 0 }, &Payload::Null)
            .unwrap();

        let mut result = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while result.is_none() && Instant::now() < deadline {
            host.rx.recv(1, |f| result = Some(f));
            std::thread::sleep(Duration::from_millis(1));
        }
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap().unwrap();

        let frame = result.expect("worker never answered");
        assert_eq!(frame.flags, FLAG_REJECTED);
        assert_eq!(frame.payload.unwrap(), Payload::str("boom"));
    }

    #[test]
    fn unknown_fn_id_is_rejected_not_fatal() {
        let (mut host, worker_lane) = lane_pair();
        let mut registry = TaskRegistry::new();
        registry.register_fn("only", |p| Ok(p));

        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = Worker::new(worker_lane, Arc::new(registry), options(), shutdown.clone());
        let handle = std::thread::spawn(move || worker.run());

        host.send(FrameMeta { id: 3, fn_id: 42, flags: 0 }, &Payload::Null)
            .unwrap();

        let mut result = None;
        let deadline = Instant::now() + Duration::from_secs(5);
        while result.is_none() && Instant::now() < deadline {
            host.rx.recv(1, |f| result = Some(f));
            std::thread::sleep(Duration::from_millis(1));
        }
        shutdown.store(true, Ordering::Release);
        handle.join().unwrap().unwrap();

        let frame = result.expect("worker never answered");
        assert_eq!(frame.flags, FLAG_REJECTED);
        assert_eq!(frame.payload.unwrap(), Payload::str("unknown task 42"));
    }
}
