//! Host-side dispatch: the per-lane tx queue and its pump loop.
//!
//! Callers append to a mutex-guarded pending queue through a [`LaneClient`]
//! and get a [`Pending`] back immediately. One dispatcher thread per lane
//! owns the host endpoint, which keeps the down ring single-producer: it
//! repeatedly settles finished calls, resolves deferred arguments, and
//! encodes pending tasks until backpressure, then backs off with a stall
//! counter and an escalating capped sleep.
//!
//! In-flight calls live in a slab indexed by the header `id`; ids are slab
//! indices recycled through a free stack that grows in steps of ten.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::oneshot;

use spindle_core::{FrameMeta, Payload, Rejection, FLAG_REJECTED};

use crate::lane::{HostLane, LaneWaker};
use crate::options::DispatcherOptions;
use crate::pending::{Pending, Settler};
use crate::task::TaskResult;

const QUEUE_GROW: usize = 10;

/// A call argument: either a value, or a receiver the dispatcher polls
/// until the value (or its rejection) arrives.
pub(crate) enum Arg {
    Ready(Payload),
    Deferred(oneshot::Receiver<TaskResult>),
}

struct Queued {
    fn_id: u32,
    arg: Arg,
    settler: Settler,
}

#[derive(Default)]
struct TxShared {
    pending: VecDeque<Queued>,
    closed: bool,
}

/// Lane load shared with the balancer: pending plus in-flight calls.
#[derive(Default)]
pub(crate) struct LaneStats {
    queued: AtomicUsize,
}

/// Caller-side handle to one lane's tx queue.
#[derive(Clone)]
pub(crate) struct LaneClient {
    shared: Arc<Mutex<TxShared>>,
    stats: Arc<LaneStats>,
    waker: LaneWaker,
}

impl LaneClient {
    /// Queue one call. Never blocks on transport capacity; a full ring
    /// just means the dispatcher sends it later.
    pub fn submit(&self, fn_id: u32, arg: Arg) -> Pending {
        let (settler, pending) = Pending::channel();
        {
            let mut shared = self.shared.lock();
            if shared.closed {
                drop(shared);
                settler.reject(Rejection::Closed);
                return pending;
            }
            shared.pending.push_back(Queued {
                fn_id,
                arg,
                settler,
            });
        }
        self.stats.queued.fetch_add(1, Ordering::AcqRel);
        self.waker.notify();
        pending
    }

    /// Nothing queued and nothing in flight.
    pub fn idle(&self) -> bool {
        self.load() == 0
    }

    pub fn load(&self) -> usize {
        self.stats.queued.load(Ordering::Acquire)
    }
}

/// In-flight slab: header ids are slab indices, recycled through a free
/// stack once the call settles.
struct InFlightTable {
    slots: Vec<Option<Settler>>,
    free: Vec<u32>,
    live: usize,
}

impl InFlightTable {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free: Vec::new(),
            live: 0,
        }
    }

    fn claim(&mut self, settler: Settler) -> u32 {
        self.live += 1;
        if let Some(id) = self.free.pop() {
            self.slots[id as usize] = Some(settler);
            return id;
        }
        let id = self.slots.len() as u32;
        self.slots.push(Some(settler));
        // Pre-grow so the next few claims skip the push.
        for _ in 1..QUEUE_GROW {
            self.free.push(self.slots.len() as u32);
            self.slots.push(None);
        }
        self.free.reverse();
        id
    }

    fn settle(&mut self, id: u32) -> Option<Settler> {
        let settler = self.slots.get_mut(id as usize)?.take();
        if settler.is_some() {
            self.live -= 1;
            self.free.push(id);
        }
        settler
    }

    fn drain(&mut self) -> Vec<Settler> {
        self.live = 0;
        self.free.clear();
        let drained = self.slots.iter_mut().filter_map(Option::take).collect();
        self.slots.clear();
        drained
    }
}

/// The per-lane dispatcher. Owns the host endpoint; consumed by `run`.
pub(crate) struct Dispatcher {
    lane: HostLane,
    shared: Arc<Mutex<TxShared>>,
    stats: Arc<LaneStats>,
    in_flight: InFlightTable,
    options: DispatcherOptions,
    shutdown: Arc<AtomicBool>,
    waker: LaneWaker,
}

impl Dispatcher {
    pub fn new(
        lane: HostLane,
        options: DispatcherOptions,
        shutdown: Arc<AtomicBool>,
    ) -> (Self, LaneClient) {
        let shared = Arc::new(Mutex::new(TxShared::default()));
        let stats = Arc::new(LaneStats::default());
        let waker = lane.waker();
        let client = LaneClient {
            shared: shared.clone(),
            stats: stats.clone(),
            waker: waker.clone(),
        };
        (
            Self {
                lane,
                shared,
                stats,
                in_flight: InFlightTable::new(),
                options,
                shutdown,
                waker,
            },
            client,
        )
    }

    pub fn run(mut self) {
        tracing::debug!(lane = self.lane.index, "dispatcher up");
        let mut stalls = 0u32;
        let mut backoff_ms = 0u64;

        while !self.shutdown.load(Ordering::Acquire) {
            self.lane.set_busy(true);
            let progress = self.complete() + self.pump();
            self.lane.set_busy(false);

            if progress > 0 {
                stalls = 0;
                backoff_ms = 0;
                continue;
            }

            stalls = stalls.saturating_add(1);
            if stalls <= self.options.stall_free_loops {
                std::thread::yield_now();
                continue;
            }

            backoff_ms = (backoff_ms * 2).clamp(1, self.options.max_backoff_ms);
            let seen = self.waker.seen();
            if self.lane.results_waiting() {
                continue;
            }
            self.waker.wait(seen, Duration::from_millis(backoff_ms));
        }

        self.reject_all();
        tracing::debug!(lane = self.lane.index, "dispatcher stopped");
    }

    /// Settle every result frame the worker has published.
    fn complete(&mut self) -> usize {
        let in_flight = &mut self.in_flight;
        let stats = &self.stats;
        self.lane.rx.recv(usize::MAX, |frame| {
            let Some(settler) = in_flight.settle(frame.id) else {
                tracing::warn!(id = frame.id, "result for unknown call");
                return;
            };
            stats.queued.fetch_sub(1, Ordering::AcqRel);
            match frame.payload {
                Ok(value) if frame.flags == FLAG_REJECTED => {
                    settler.reject(Rejection::Value(value))
                }
                Ok(value) => settler.fulfill(value),
                Err(e) => settler.reject(Rejection::Decode(e)),
            }
        })
    }

    /// Encode and publish pending tasks until the queue is empty or the
    /// transport pushes back. Deferred arguments that are still pending are
    /// kept, in order, for the next pass.
    fn pump(&mut self) -> usize {
        let mut taken = {
            let mut shared = self.shared.lock();
            std::mem::take(&mut shared.pending)
        };
        if taken.is_empty() {
            return 0;
        }

        let mut sent = 0usize;
        let mut keep: VecDeque<Queued> = VecDeque::new();
        let mut blocked = false;

        while let Some(mut q) = taken.pop_front() {
            if blocked {
                keep.push_back(q);
                continue;
            }

            // Resolve a deferred argument first; unready ones stay queued.
            if let Arg::Deferred(ref mut rx) = q.arg {
                match rx.try_recv() {
                    Ok(Ok(payload)) => q.arg = Arg::Ready(payload),
                    Ok(Err(reason)) => {
                        q.settler.reject(Rejection::Value(reason));
                        self.stats.queued.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                    Err(oneshot::error::TryRecvError::Empty) => {
                        keep.push_back(q);
                        continue;
                    }
                    Err(oneshot::error::TryRecvError::Closed) => {
                        q.settler
                            .reject(Rejection::Value(Payload::str("deferred payload dropped")));
                        self.stats.queued.fetch_sub(1, Ordering::AcqRel);
                        continue;
                    }
                }
            }

            let payload = match &q.arg {
                Arg::Ready(payload) => payload,
                Arg::Deferred(_) => {
                    keep.push_back(q);
                    continue;
                }
            };
            if self.lane.tx.free_slots() == 0 {
                blocked = true;
                keep.push_back(q);
                continue;
            }

            let id = self.in_flight.claim(q.settler);
            let meta = FrameMeta {
                id,
                fn_id: q.fn_id,
                flags: 0,
            };
            match self.lane.send(meta, payload) {
                Ok(spindle_core::SendOutcome::Sent { .. }) => sent += 1,
                Ok(spindle_core::SendOutcome::Backpressure) => {
                    // Ring had room but the arena did not; retry later.
                    blocked = true;
                    if let Some(settler) = self.in_flight.settle(id) {
                        q.settler = settler;
                        keep.push_back(q);
                    }
                }
                Err(e) => {
                    if let Some(settler) = self.in_flight.settle(id) {
                        settler.reject(Rejection::Encode(e));
                    }
                    self.stats.queued.fetch_sub(1, Ordering::AcqRel);
                }
            }
        }

        if !keep.is_empty() {
            let mut shared = self.shared.lock();
            // Keep FIFO order ahead of anything submitted mid-pump.
            while let Some(q) = keep.pop_back() {
                shared.pending.push_front(q);
            }
        }
        sent
    }

    /// Shutdown: close the queue and reject everything still outstanding
    /// with the fixed closed reason.
    fn reject_all(&mut self) {
        let pending = {
            let mut shared = self.shared.lock();
            shared.closed = true;
            std::mem::take(&mut shared.pending)
        };
        let in_flight = self.in_flight.drain();
        let total = pending.len() + in_flight.len();
        if total > 0 {
            tracing::warn!(
                lane = self.lane.index,
                count = total,
                "rejecting outstanding calls on shutdown"
            );
        }
        for q in pending {
            q.settler.reject(Rejection::Closed);
        }
        for settler in in_flight {
            settler.reject(Rejection::Closed);
        }
        self.stats.queued.store(0, Ordering::Release);
    }
}
