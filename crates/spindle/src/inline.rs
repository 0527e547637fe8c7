//! Inline lane: task execution on the caller's thread.
//!
//! Low-concurrency traffic skips the transport entirely — no encoding, no
//! rings, no wake-ups. The inline lane settles its [`Pending`] before
//! `call` returns, which also means a deferred task output is waited for
//! right there; that is the cost of asking for same-thread semantics.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use spindle_core::{Payload, Rejection};

use crate::pending::Pending;
use crate::task::{TaskOutput, TaskRegistry};

pub(crate) struct InlineLane {
    registry: Arc<TaskRegistry>,
    live: AtomicUsize,
    closed: Arc<AtomicBool>,
}

impl InlineLane {
    pub fn new(registry: Arc<TaskRegistry>, closed: Arc<AtomicBool>) -> Self {
        Self {
            registry,
            live: AtomicUsize::new(0),
            closed,
        }
    }

    pub fn call(&self, fn_id: u32, payload: Payload) -> Pending {
        let (settler, pending) = Pending::channel();
        if self.closed.load(Ordering::Acquire) {
            settler.reject(Rejection::Closed);
            return pending;
        }
        let Some(task) = self.registry.get(fn_id).cloned() else {
            settler.reject(Rejection::Value(Payload::Str(format!(
                "unknown task {fn_id}"
            ))));
            return pending;
        };

        self.live.fetch_add(1, Ordering::AcqRel);
        let output = task(payload);
        let result = match output {
            TaskOutput::Ready(result) => result,
            TaskOutput::Deferred(rx) => rx
                .blocking_recv()
                .unwrap_or_else(|_| Err(Payload::str("deferred result dropped"))),
        };
        self.live.fetch_sub(1, Ordering::AcqRel);

        match result {
            Ok(value) => settler.fulfill(value),
            Err(reason) => settler.reject(Rejection::Value(reason)),
        }
        pending
    }

    /// No inline task currently executing.
    pub fn idle(&self) -> bool {
        self.live.load(Ordering::Acquire) == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::task::TaskOutput;

    fn lane() -> InlineLane {
        let mut reg = TaskRegistry::new();
        reg.register_fn("double", |p| match p {
            Payload::I64(v) => Ok(Payload::I64(v * 2)),
            other => Err(Payload::Str(format!("bad arg: {other:?}"))),
        });
        reg.register("late", |_| {
            let (handle, out) = TaskOutput::deferred();
            std::thread::spawn(move || {
                std::thread::sleep(std::time::Duration::from_millis(10));
                handle.fulfill(Payload::Bool(true));
            });
            out
        });
        InlineLane::new(Arc::new(reg), Arc::new(AtomicBool::new(false)))
    }

    #[test]
    fn settles_before_returning() {
        let lane = lane();
        assert_eq!(lane.call(0, Payload::I64(21)).wait(), Ok(Payload::I64(42)));
        assert!(lane.idle());
    }

    #[test]
    fn rejection_carries_the_task_error() {
        let lane = lane();
        assert!(matches!(
            lane.call(0, Payload::Null).wait(),
            Err(Rejection::Value(Payload::Str(_)))
        ));
    }

    #[test]
    fn deferred_output_is_waited_for_inline() {
        let lane = lane();
        assert_eq!(lane.call(1, Payload::Null).wait(), Ok(Payload::Bool(true)));
    }

    #[test]
    fn closed_lane_rejects() {
        let closed = Arc::new(AtomicBool::new(true));
        let mut reg = TaskRegistry::new();
        reg.register_fn("f", Ok);
        let lane = InlineLane::new(Arc::new(reg), closed);
        assert_eq!(lane.call(0, Payload::Null).wait(), Err(Rejection::Closed));
    }
}
