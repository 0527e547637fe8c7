//! Pool tuning knobs with their defaults.
//!
//! All of these are performance tunables, not contracts: changing them
//! shifts latency/CPU trade-offs but never changes observable results.

use spindle_core::layout::{ARENA_DEFAULT_INITIAL_BYTES, ARENA_MAX_BYTES};

use crate::balancer::Strategy;

/// Worker-side hybrid wait tuning.
#[derive(Debug, Clone, Copy, Default)]
pub struct TimerOptions {
    /// Busy-spin window before parking, per idle episode. `None` derives
    /// 50 µs × thread count at pool build.
    pub spin_us: Option<u64>,
    /// Timed-park duration on the wake word. `None` derives the same value
    /// as the spin window.
    pub park_ms: Option<u64>,
}

impl TimerOptions {
    pub(crate) fn resolve(&self, threads: usize) -> (u64, u64) {
        let spin = self.spin_us.unwrap_or(50 * threads.max(1) as u64);
        let park = self.park_ms.unwrap_or(spin.max(1));
        (spin, park)
    }
}

/// Host dispatcher loop tuning.
#[derive(Debug, Clone, Copy)]
pub struct DispatcherOptions {
    /// Free passes (no progress) before the dispatcher starts backing off.
    pub stall_free_loops: u32,
    /// Cap on the escalating backoff sleep, in milliseconds.
    pub max_backoff_ms: u64,
}

impl Default for DispatcherOptions {
    fn default() -> Self {
        Self {
            stall_free_loops: 128,
            max_backoff_ms: 10,
        }
    }
}

/// Where the inline lane sits in the lane order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InlinePlacement {
    First,
    Last,
}

/// Inline execution gating.
#[derive(Debug, Clone, Copy)]
pub struct InlinerOptions {
    pub enabled: bool,
    /// With at least this many calls in flight, traffic is routed to worker
    /// lanes instead of the inline lane.
    pub threshold: usize,
    pub placement: InlinePlacement,
}

impl Default for InlinerOptions {
    fn default() -> Self {
        Self {
            enabled: false,
            threshold: 2,
            placement: InlinePlacement::First,
        }
    }
}

/// Everything configurable about a pool.
#[derive(Debug, Clone)]
pub struct PoolOptions {
    /// Worker lane count.
    pub threads: usize,
    pub balancer: Strategy,
    pub inliner: InlinerOptions,
    /// Initial committed bytes of each direction's payload arena.
    pub arena_initial: usize,
    /// Hard cap on each arena.
    pub arena_max: usize,
    pub timers: TimerOptions,
    pub dispatcher: DispatcherOptions,
    /// Workers report a batch done only once their local work ring is fully
    /// drained.
    pub resolve_after_finishing_all: bool,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            threads: 1,
            balancer: Strategy::RoundRobin,
            inliner: InlinerOptions::default(),
            arena_initial: ARENA_DEFAULT_INITIAL_BYTES,
            arena_max: ARENA_MAX_BYTES,
            timers: TimerOptions::default(),
            dispatcher: DispatcherOptions::default(),
            resolve_after_finishing_all: false,
        }
    }
}

impl PoolOptions {
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn balancer(mut self, strategy: Strategy) -> Self {
        self.balancer = strategy;
        self
    }

    pub fn inliner(mut self, inliner: InlinerOptions) -> Self {
        self.inliner = inliner;
        self
    }

    pub fn arena(mut self, initial: usize, max: usize) -> Self {
        // Clamp the cap first so the initial size can never exceed it.
        self.arena_max = max.min(ARENA_MAX_BYTES);
        self.arena_initial = initial.min(self.arena_max);
        self
    }

    pub fn timers(mut self, timers: TimerOptions) -> Self {
        self.timers = timers;
        self
    }

    pub fn dispatcher(mut self, dispatcher: DispatcherOptions) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    pub fn resolve_after_finishing_all(mut self, value: bool) -> Self {
        self.resolve_after_finishing_all = value;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_defaults_scale_with_threads() {
        let t = TimerOptions::default();
        assert_eq!(t.resolve(4), (200, 200));
        assert_eq!(t.resolve(0), (50, 50));
    }

    #[test]
    fn explicit_timers_win() {
        let t = TimerOptions {
            spin_us: Some(10),
            park_ms: Some(3),
        };
        assert_eq!(t.resolve(8), (10, 3));
    }

    #[test]
    fn arena_sizes_clamp_to_the_cap() {
        let o = PoolOptions::default().arena(1 << 30, 1 << 30);
        assert_eq!(o.arena_max, ARENA_MAX_BYTES);
        assert_eq!(o.arena_initial, ARENA_MAX_BYTES);

        // An oversized initial is pulled down to the clamped cap, never
        // left above it.
        let o = PoolOptions::default().arena(1 << 30, 8 * 1024 * 1024);
        assert_eq!(o.arena_max, 8 * 1024 * 1024);
        assert_eq!(o.arena_initial, o.arena_max);
    }
}
