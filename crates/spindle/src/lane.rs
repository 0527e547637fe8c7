//! A lane: one worker's private transport to the host.
//!
//! Three shared segments per lane — the host→worker direction ("down"),
//! the worker→host direction ("up"), and a small signal segment holding the
//! wake counter and the two status hint words. Host and worker each hold
//! one endpoint; the endpoint owns the producer role of its outgoing
//! direction and the consumer role of its incoming one, which is what makes
//! every ring strictly single-producer/single-consumer.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use spindle_core::queue::offsets;
use spindle_core::signal::{RX_AWAKE, RX_PARKED, TX_BUSY, TX_IDLE};
use spindle_core::{
    BootstrapError, FrameMeta, FrameReceiver, FrameSender, Payload, SendOutcome, SharedMemory,
    SignalView, WakeChannel,
};
use spindle_core::layout::{HEADER_SEGMENT_BYTES, SIGNAL_SECTOR_BYTES};

const SIGNAL_SEGMENT_BYTES: usize = 4096;

/// Sizing for both directions of a lane.
#[derive(Debug, Clone, Copy)]
pub struct LaneConfig {
    pub arena_initial: usize,
    pub arena_max: usize,
}

/// Create a lane's segments and split them into the two endpoints.
pub fn create(index: usize, config: LaneConfig) -> io::Result<(HostLane, WorkerLane)> {
    let bytes = offsets::segment_bytes(config.arena_max);
    let down = Arc::new(SharedMemory::create(&format!("spindle-{index}-down"), bytes)?);
    let up = Arc::new(SharedMemory::create(&format!("spindle-{index}-up"), bytes)?);
    let signal = Arc::new(SharedMemory::create(
        &format!("spindle-{index}-sig"),
        SIGNAL_SEGMENT_BYTES,
    )?);
    let wake = WakeChannel::new();

    let host = HostLane {
        index,
        tx: FrameSender::over(down.clone(), config.arena_initial, config.arena_max),
        rx: FrameReceiver::over(up.clone()),
        signal: signal.clone(),
        wake: wake.clone(),
    };
    let worker = WorkerLane {
        index,
        rx: FrameReceiver::over(down.clone()),
        tx: FrameSender::over(up.clone(), config.arena_initial, config.arena_max),
        down,
        up,
        signal,
        wake,
        arena_max: config.arena_max,
    };
    Ok((host, worker))
}

/// Host endpoint of a lane.
pub struct HostLane {
    pub(crate) index: usize,
    pub(crate) tx: FrameSender,
    pub(crate) rx: FrameReceiver,
    signal: Arc<SharedMemory>,
    wake: Arc<WakeChannel>,
}

impl HostLane {
    fn signal(&self) -> SignalView<'_> {
        SignalView::new(&self.signal, 0)
    }

    /// Publish one frame down; bumps the wake word on success so a parked
    /// worker gets up.
    pub(crate) fn send(
        &mut self,
        meta: FrameMeta,
        payload: &Payload,
    ) -> Result<SendOutcome, spindle_core::EncodeError> {
        let outcome = self.tx.send(meta, payload)?;
        if matches!(outcome, SendOutcome::Sent { .. }) {
            self.wake.notify(self.signal().op);
        }
        Ok(outcome)
    }

    /// Caller-side handle for waking this lane's loops.
    pub(crate) fn waker(&self) -> LaneWaker {
        LaneWaker {
            signal: self.signal.clone(),
            wake: self.wake.clone(),
        }
    }

    /// Busy hint for the balancer and the worker's spin loop.
    pub(crate) fn set_busy(&self, busy: bool) {
        self.signal().tx_status.store(
            if busy { TX_BUSY } else { TX_IDLE },
            std::sync::atomic::Ordering::Release,
        );
    }

    pub(crate) fn results_waiting(&self) -> bool {
        self.rx.has_unread()
    }
}

/// Worker endpoint of a lane.
pub struct WorkerLane {
    pub(crate) index: usize,
    pub(crate) rx: FrameReceiver,
    pub(crate) tx: FrameSender,
    down: Arc<SharedMemory>,
    up: Arc<SharedMemory>,
    signal: Arc<SharedMemory>,
    wake: Arc<WakeChannel>,
    arena_max: usize,
}

impl WorkerLane {
    fn signal(&self) -> SignalView<'_> {
        SignalView::new(&self.signal, 0)
    }

    /// Startup contract check. Creation sizes these correctly, so a failure
    /// here means the handles were wired up wrong.
    pub(crate) fn validate(&self) -> Result<(), BootstrapError> {
        let need = offsets::segment_bytes(self.arena_max);
        for (name, segment) in [("down", &self.down), ("up", &self.up)] {
            if segment.len() < need {
                if segment.len() < HEADER_SEGMENT_BYTES {
                    return Err(BootstrapError::HeaderSegmentTooSmall {
                        have: segment.len(),
                        need: HEADER_SEGMENT_BYTES,
                    });
                }
                return Err(BootstrapError::MissingSegment(name));
            }
        }
        if self.signal.len() < SIGNAL_SECTOR_BYTES {
            return Err(BootstrapError::MissingSegment("signal"));
        }
        Ok(())
    }

    pub(crate) fn wake_seen(&self) -> u32 {
        self.signal().op.load(std::sync::atomic::Ordering::Acquire)
    }

    pub(crate) fn host_busy(&self) -> bool {
        self.signal().host_busy()
    }

    /// Timed park on the wake word, bracketed by the parked-state hint.
    pub(crate) fn park(&self, seen: u32, timeout: Duration) -> u32 {
        let view = self.signal();
        view.rx_status
            .store(RX_PARKED, std::sync::atomic::Ordering::Release);
        let now = self.wake.wait_change(view.op, seen, timeout);
        view.rx_status
            .store(RX_AWAKE, std::sync::atomic::Ordering::Release);
        now
    }

    pub(crate) fn mark_awake(&self) {
        self.signal()
            .rx_status
            .store(RX_AWAKE, std::sync::atomic::Ordering::Release);
    }

    /// Bump the wake word so a backed-off host dispatcher notices results
    /// sooner than its next scheduled pass.
    pub(crate) fn nudge_host(&self) {
        self.wake.notify(self.signal().op);
    }
}

/// Cloneable handle onto a lane's wake word, shared by the worker, the
/// dispatcher and the callers enqueuing work. One channel serves both
/// parked sides; each re-checks its own conditions on wake.
#[derive(Clone)]
pub(crate) struct LaneWaker {
    signal: Arc<SharedMemory>,
    wake: Arc<WakeChannel>,
}

impl LaneWaker {
    fn view(&self) -> SignalView<'_> {
        SignalView::new(&self.signal, 0)
    }

    pub(crate) fn notify(&self) {
        self.wake.notify(self.view().op);
    }

    pub(crate) fn seen(&self) -> u32 {
        self.view().op.load(std::sync::atomic::Ordering::Acquire)
    }

    pub(crate) fn wait(&self, seen: u32, timeout: Duration) -> u32 {
        self.wake.wait_change(self.view().op, seen, timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use spindle_core::SLOT_COUNT;

    fn config() -> LaneConfig {
        LaneConfig {
            arena_initial: 4096,
            arena_max: 1 << 20,
        }
    }

    #[test]
    fn endpoints_form_a_full_duplex_pair() {
        let (mut host, mut worker) = create(0, config()).unwrap();
        worker.validate().unwrap();

        host.send(
            FrameMeta {
                id: 1,
                fn_id: 0,
                flags: 0,
            },
            &Payload::str("ping"),
        )
        .unwrap();

        let mut got = None;
        worker.rx.recv(usize::MAX, |f| got = Some(f));
        let frame = got.unwrap();
        assert_eq!(frame.id, 1);
        assert_eq!(frame.payload.unwrap(), Payload::str("ping"));

        worker
            .tx
            .send(
                FrameMeta {
                    id: 1,
                    fn_id: 0,
                    flags: 0,
                },
                &Payload::str("pong"),
            )
            .unwrap();
        assert!(host.results_waiting());
        let mut back = None;
        host.rx.recv(usize::MAX, |f| back = Some(f));
        assert_eq!(back.unwrap().payload.unwrap(), Payload::str("pong"));
    }

    #[test]
    fn send_wakes_a_parked_worker() {
        let (mut host, worker) = create(1, config()).unwrap();

        std::thread::scope(|s| {
            let handle = s.spawn(|| {
                let seen = worker.wake_seen();
                worker.park(seen, Duration::from_secs(5))
            });
            std::thread::sleep(Duration::from_millis(20));
            host.send(FrameMeta::default(), &Payload::Null).unwrap();
            let woke_at = handle.join().unwrap();
            assert!(woke_at >= 1);
        });
    }

    #[test]
    fn each_direction_has_independent_capacity() {
        let (mut host, worker) = create(2, config()).unwrap();
        for i in 0..SLOT_COUNT as u32 {
            let out = host
                .send(
                    FrameMeta {
                        id: i,
                        ..Default::default()
                    },
                    &Payload::Null,
                )
                .unwrap();
            assert!(matches!(out, SendOutcome::Sent { .. }));
        }
        // Down ring is full; up ring is untouched.
        assert_eq!(host.tx.free_slots(), 0);
        assert_eq!(worker.tx.free_slots(), SLOT_COUNT as u32);
    }
}
