//! Lane selection policies.
//!
//! The balancer only picks an index; whether a lane is "idle" is the
//! caller's judgement (its tx queue is empty and nothing is in flight).
//! Idleness is a stale hint by nature, so every policy must return a valid
//! lane even when the hint says everything is busy.

use rand_core::{RngCore, SeedableRng};
use rand_xoshiro::Xoshiro256PlusPlus;

/// Lane selection strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Strict rotation over the lanes.
    RoundRobin,
    /// Lowest-numbered idle lane, rotation when none is idle.
    FirstIdle,
    /// Uniform random lane.
    RandomLane,
    /// Lowest-numbered idle lane, random when none is idle.
    FirstIdleOrRandom,
}

pub struct Balancer {
    strategy: Strategy,
    next: usize,
    rng: Xoshiro256PlusPlus,
}

impl Balancer {
    pub fn new(strategy: Strategy) -> Self {
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0x9e3779b97f4a7c15);
        Self::with_seed(strategy, seed)
    }

    /// Deterministic construction, for tests.
    pub fn with_seed(strategy: Strategy, seed: u64) -> Self {
        Self {
            strategy,
            next: 0,
            rng: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Choose a lane in `0..lanes`. `idle` reports the caller's view of a
    /// lane's queue state.
    pub fn pick(&mut self, lanes: usize, idle: impl Fn(usize) -> bool) -> usize {
        debug_assert!(lanes > 0);
        match self.strategy {
            Strategy::RoundRobin => self.rotate(lanes),
            Strategy::FirstIdle => self
                .first_idle(lanes, &idle)
                .unwrap_or_else(|| self.rotate(lanes)),
            Strategy::RandomLane => self.random(lanes),
            Strategy::FirstIdleOrRandom => self
                .first_idle(lanes, &idle)
                .unwrap_or_else(|| self.random(lanes)),
        }
    }

    fn rotate(&mut self, lanes: usize) -> usize {
        let lane = self.next % lanes;
        self.next = (lane + 1) % lanes;
        lane
    }

    fn first_idle(&self, lanes: usize, idle: &impl Fn(usize) -> bool) -> Option<usize> {
        (0..lanes).find(|&i| idle(i))
    }

    fn random(&mut self, lanes: usize) -> usize {
        (self.rng.next_u64() % lanes as u64) as usize
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_robin_wraps() {
        let mut b = Balancer::with_seed(Strategy::RoundRobin, 1);
        let picks: Vec<_> = (0..4).map(|_| b.pick(3, |_| true)).collect();
        assert_eq!(picks, vec![0, 1, 2, 0]);
    }

    #[test]
    fn first_idle_skips_busy_lanes() {
        let mut b = Balancer::with_seed(Strategy::FirstIdle, 1);
        assert_eq!(b.pick(3, |i| i == 2), 2);
        assert_eq!(b.pick(3, |i| i != 0), 1);
    }

    #[test]
    fn first_idle_rotates_when_all_busy() {
        let mut b = Balancer::with_seed(Strategy::FirstIdle, 1);
        let picks: Vec<_> = (0..3).map(|_| b.pick(3, |_| false)).collect();
        assert_eq!(picks, vec![0, 1, 2]);
    }

    #[test]
    fn random_lane_stays_in_range() {
        let mut b = Balancer::with_seed(Strategy::RandomLane, 42);
        let mut seen = [false; 4];
        for _ in 0..200 {
            seen[b.pick(4, |_| true)] = true;
        }
        // With 200 draws every lane should have come up.
        assert_eq!(seen, [true; 4]);
    }

    #[test]
    fn first_idle_or_random_prefers_idle() {
        let mut b = Balancer::with_seed(Strategy::FirstIdleOrRandom, 7);
        assert_eq!(b.pick(8, |i| i == 5), 5);
        let lane = b.pick(8, |_| false);
        assert!(lane < 8);
    }
}
