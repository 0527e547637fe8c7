//! Lane wake-up plumbing.
//!
//! Each lane shares one [`SignalSector`] between host and worker. The `op`
//! word is a monotonically increasing wake counter: the host bumps it after
//! publishing work, the worker parks until it changes. `rx_status` and
//! `tx_status` are advisory hints only; every decision made from them is
//! re-checked against the ring bitsets, so a stale read costs at most one
//! spurious pass.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::layout::SignalSector;
use crate::shm::SharedMemory;

/// Worker-side status values published in `rx_status`.
pub const RX_AWAKE: u32 = 1;
pub const RX_PARKED: u32 = 0;

/// Host-side status values published in `tx_status`.
pub const TX_BUSY: u32 = 1;
pub const TX_IDLE: u32 = 0;

/// Borrowed view of a lane's signal sector inside a shared segment.
#[derive(Clone, Copy)]
pub struct SignalView<'a> {
    pub op: &'a AtomicU32,
    pub rx_status: &'a AtomicU32,
    pub tx_status: &'a AtomicU32,
}

impl<'a> SignalView<'a> {
    /// Map the three signal words at `offset` bytes into `shm`.
    pub fn new(shm: &'a SharedMemory, offset: usize) -> Self {
        let stride = 64;
        Self {
            op: shm.atomic_u32(offset),
            rx_status: shm.atomic_u32(offset + stride),
            tx_status: shm.atomic_u32(offset + 2 * stride),
        }
    }

    pub fn worker_parked(&self) -> bool {
        self.rx_status.load(Ordering::Acquire) == RX_PARKED
    }

    pub fn host_busy(&self) -> bool {
        self.tx_status.load(Ordering::Acquire) == TX_BUSY
    }
}

const _: () = {
    // SignalView::new assumes the sector's 64-byte field stride.
    assert!(std::mem::size_of::<SignalSector>() == 192);
};

/// Blocking wake channel keyed on a shared counter word.
///
/// The counter itself lives in shared memory; the mutex and condvar are
/// process-local and exist only so a parked waiter can sleep without
/// burning a core. `notify` is cheap enough to call unconditionally after
/// every publish.
pub struct WakeChannel {
    gate: Mutex<()>,
    cond: Condvar,
}

impl WakeChannel {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            gate: Mutex::new(()),
            cond: Condvar::new(),
        })
    }

    /// Bump the counter and wake any parked waiter.
    pub fn notify(&self, op: &AtomicU32) {
        op.fetch_add(1, Ordering::AcqRel);
        let _guard = self.gate.lock();
        self.cond.notify_all();
    }

    /// Park until the counter moves past `seen` or `timeout` elapses.
    /// Returns the counter value observed on wake-up.
    pub fn wait_change(&self, op: &AtomicU32, seen: u32, timeout: Duration) -> u32 {
        let deadline = Instant::now() + timeout;
        let mut guard = self.gate.lock();
        loop {
            let now = op.load(Ordering::Acquire);
            if now != seen {
                return now;
            }
            if self.cond.wait_until(&mut guard, deadline).timed_out() {
                return op.load(Ordering::Acquire);
            }
        }
    }
}
