//! The pool: lanes, workers, dispatchers and the call surface.
//!
//! `Pool::builder()` wires everything: one lane (three shared segments,
//! one worker thread, one dispatcher thread) per configured thread, an
//! optional inline lane, and the balancer that routes each call. Calls are
//! made through [`TaskHandle`]s; each returns a [`Pending`] that settles
//! when the result frame comes back (or immediately, on the inline lane).

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use spindle_core::{BootstrapError, Payload};

use crate::balancer::Balancer;
use crate::dispatch::{Arg, Dispatcher, LaneClient};
use crate::inline::InlineLane;
use crate::lane::{self, LaneConfig, LaneWaker};
use crate::options::{InlinePlacement, PoolOptions};
use crate::pending::Pending;
use crate::task::{TaskOutput, TaskRegistry, TaskResult};
use crate::worker::{Worker, WorkerOptions};

/// Why a pool could not be built or a handle resolved.
#[derive(Debug)]
pub enum PoolError {
    Io(io::Error),
    Bootstrap(BootstrapError),
    UnknownTask(String),
}

impl fmt::Display for PoolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "shared segment setup failed: {e}"),
            Self::Bootstrap(e) => write!(f, "{e}"),
            Self::UnknownTask(name) => write!(f, "no task named {name:?}"),
        }
    }
}

impl std::error::Error for PoolError {}

impl From<io::Error> for PoolError {
    fn from(e: io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<BootstrapError> for PoolError {
    fn from(e: BootstrapError) -> Self {
        Self::Bootstrap(e)
    }
}

/// Configures and starts a [`Pool`].
#[derive(Default)]
pub struct PoolBuilder {
    options: PoolOptions,
    registry: TaskRegistry,
}

impl PoolBuilder {
    /// Replace all options at once.
    pub fn options(mut self, options: PoolOptions) -> Self {
        self.options = options;
        self
    }

    pub fn threads(mut self, threads: usize) -> Self {
        self.options = self.options.threads(threads);
        self
    }

    pub fn balancer(mut self, strategy: crate::balancer::Strategy) -> Self {
        self.options = self.options.balancer(strategy);
        self
    }

    pub fn inliner(mut self, inliner: crate::options::InlinerOptions) -> Self {
        self.options = self.options.inliner(inliner);
        self
    }

    /// Replace the whole task registry, for callers assembling one
    /// separately.
    pub fn registry(mut self, registry: TaskRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn register<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Payload) -> TaskOutput + Send + Sync + 'static,
    {
        self.registry.register(name, f);
        self
    }

    pub fn register_fn<F>(mut self, name: &str, f: F) -> Self
    where
        F: Fn(Payload) -> TaskResult + Send + Sync + 'static,
    {
        self.registry.register_fn(name, f);
        self
    }

    pub fn build(self) -> Result<Pool, PoolError> {
        self.registry.ensure_not_empty()?;
        let registry = Arc::new(self.registry);
        let options = self.options;
        let shutdown = Arc::new(AtomicBool::new(false));
        let (spin_us, park_ms) = options.timers.resolve(options.threads);
        let lane_config = LaneConfig {
            arena_initial: options.arena_initial,
            arena_max: options.arena_max,
        };

        let mut clients = Vec::with_capacity(options.threads);
        let mut wakers = Vec::with_capacity(options.threads);
        let mut threads = Vec::with_capacity(options.threads * 2);

        for index in 0..options.threads {
            let (host, worker_lane) = lane::create(index, lane_config)?;
            wakers.push(host.waker());

            let worker = Worker::new(
                worker_lane,
                registry.clone(),
                WorkerOptions {
                    spin_us,
                    park_ms,
                    resolve_after_finishing_all: options.resolve_after_finishing_all,
                },
                shutdown.clone(),
            );
            threads.push(
                std::thread::Builder::new()
                    .name(format!("spindle-worker-{index}"))
                    .spawn(move || {
                        if let Err(e) = worker.run() {
                            tracing::error!(lane = index, error = %e, "worker bootstrap failed");
                        }
                    })?,
            );

            let (dispatcher, client) = Dispatcher::new(host, options.dispatcher, shutdown.clone());
            clients.push(client);
            threads.push(
                std::thread::Builder::new()
                    .name(format!("spindle-dispatch-{index}"))
                    .spawn(move || dispatcher.run())?,
            );
        }

        let inline = options
            .inliner
            .enabled
            .then(|| InlineLane::new(registry.clone(), shutdown.clone()));

        tracing::debug!(
            threads = options.threads,
            inline = inline.is_some(),
            "pool started"
        );

        Ok(Pool {
            registry,
            clients,
            inline,
            balancer: Mutex::new(Balancer::new(options.balancer)),
            options,
            shutdown,
            wakers,
            threads: Mutex::new(threads),
        })
    }
}

pub struct Pool {
    registry: Arc<TaskRegistry>,
    clients: Vec<LaneClient>,
    inline: Option<InlineLane>,
    balancer: Mutex<Balancer>,
    options: PoolOptions,
    shutdown: Arc<AtomicBool>,
    wakers: Vec<LaneWaker>,
    threads: Mutex<Vec<JoinHandle<()>>>,
}

impl Pool {
    pub fn builder() -> PoolBuilder {
        PoolBuilder::default()
    }

    /// A pool around a single unnamed task function.
    pub fn single<F>(f: F, options: PoolOptions) -> Result<Pool, PoolError>
    where
        F: Fn(Payload) -> TaskResult + Send + Sync + 'static,
    {
        Pool::builder().options(options).register_fn("task", f).build()
    }

    /// Handle to a registered task by name.
    pub fn handle(&self, name: &str) -> Result<TaskHandle<'_>, PoolError> {
        match self.registry.id(name) {
            Some(fn_id) => Ok(TaskHandle { pool: self, fn_id }),
            None => Err(PoolError::UnknownTask(name.to_owned())),
        }
    }

    /// Handle to the first registered task; the counterpart of
    /// [`Pool::single`].
    pub fn sole(&self) -> TaskHandle<'_> {
        TaskHandle { pool: self, fn_id: 0 }
    }

    /// Total calls queued or in flight across all worker lanes, plus any
    /// inline task currently executing.
    pub fn in_flight(&self) -> usize {
        let lanes: usize = self.clients.iter().map(LaneClient::load).sum();
        let inline = match &self.inline {
            Some(lane) if !lane.idle() => 1,
            _ => 0,
        };
        lanes + inline
    }

    fn route(&self, fn_id: u32, arg: Arg) -> Pending {
        // Deferred arguments always ride a worker lane; the inline lane
        // settles before returning and cannot wait for an argument.
        if let Arg::Ready(payload) = arg {
            match self.try_inline(fn_id, payload) {
                Ok(pending) => return pending,
                Err(payload) => return self.submit(fn_id, Arg::Ready(payload)),
            }
        }
        self.submit(fn_id, arg)
    }

    fn try_inline(&self, fn_id: u32, payload: Payload) -> Result<Pending, Payload> {
        let Some(inline) = &self.inline else {
            return Err(payload);
        };
        let under_threshold = self.in_flight() < self.options.inliner.threshold;
        let eligible = match self.options.inliner.placement {
            InlinePlacement::First => under_threshold,
            InlinePlacement::Last => {
                under_threshold && !self.clients.iter().any(LaneClient::idle)
            }
        };
        if eligible {
            Ok(inline.call(fn_id, payload))
        } else {
            Err(payload)
        }
    }

    fn submit(&self, fn_id: u32, arg: Arg) -> Pending {
        let lane = self
            .balancer
            .lock()
            .pick(self.clients.len(), |i| self.clients[i].idle());
        self.clients[lane].submit(fn_id, arg)
    }

    /// Stop the pool: reject everything outstanding with the fixed closed
    /// reason and join all threads. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        tracing::debug!("pool shutting down");
        for waker in &self.wakers {
            waker.notify();
        }
        let threads = std::mem::take(&mut *self.threads.lock());
        for handle in threads {
            let _ = handle.join();
        }
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// A callable reference to one registered task.
#[derive(Clone, Copy)]
pub struct TaskHandle<'a> {
    pool: &'a Pool,
    fn_id: u32,
}

impl TaskHandle<'_> {
    /// Queue one call with an immediate argument.
    pub fn call(&self, payload: Payload) -> Pending {
        self.pool.route(self.fn_id, Arg::Ready(payload))
    }

    /// Queue one call whose argument arrives later. The task is held until
    /// the receiver resolves; a rejected argument rejects the call without
    /// it ever reaching a worker.
    pub fn call_deferred(&self, arg: oneshot::Receiver<TaskResult>) -> Pending {
        self.pool.route(self.fn_id, Arg::Deferred(arg))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_registry_fails_to_build() {
        let Err(err) = Pool::builder().build() else {
            panic!("empty registry must not build");
        };
        assert!(matches!(
            err,
            PoolError::Bootstrap(BootstrapError::NoTasks)
        ));
    }

    #[test]
    fn unknown_handle_is_an_error() {
        let pool = Pool::single(Ok, PoolOptions::default()).unwrap();
        assert!(matches!(
            pool.handle("nope"),
            Err(PoolError::UnknownTask(_))
        ));
        pool.shutdown();
    }

    #[test]
    fn shutdown_is_idempotent() {
        let pool = Pool::single(Ok, PoolOptions::default()).unwrap();
        pool.shutdown();
        pool.shutdown();
    }
}
