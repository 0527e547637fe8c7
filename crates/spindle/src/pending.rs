//! Call settlement futures.
//!
//! Every call returns a [`Pending`] immediately; the dispatcher settles it
//! once the worker's result frame comes back. `Pending` works with or
//! without an async runtime: `.await` it, or call [`Pending::wait`] from a
//! plain thread.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use spindle_core::{Payload, Rejection};

/// What a call eventually settles to.
pub type Settled = Result<Payload, Rejection>;

/// A not-yet-settled call result.
#[derive(Debug)]
pub struct Pending {
    rx: oneshot::Receiver<Settled>,
}

impl Pending {
    /// A pending/settler pair. The settler side is consumed on use, so a
    /// call can never be settled twice.
    pub(crate) fn channel() -> (Settler, Pending) {
        let (tx, rx) = oneshot::channel();
        (Settler { tx }, Pending { rx })
    }

    /// Block the current thread until the call settles.
    ///
    /// If the pool is torn down without settling (it rejects in-flight
    /// calls on shutdown, so this is a hard bug elsewhere), the call is
    /// reported as closed.
    pub fn wait(self) -> Settled {
        self.rx.blocking_recv().unwrap_or(Err(Rejection::Closed))
    }
}

impl Future for Pending {
    type Output = Settled;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|settled| settled.unwrap_or(Err(Rejection::Closed)))
    }
}

/// Dispatcher-side handle that settles a [`Pending`] exactly once.
#[derive(Debug)]
pub(crate) struct Settler {
    tx: oneshot::Sender<Settled>,
}

impl Settler {
    pub(crate) fn fulfill(self, value: Payload) {
        let _ = self.tx.send(Ok(value));
    }

    pub(crate) fn reject(self, rejection: Rejection) {
        let _ = self.tx.send(Err(rejection));
    }
}
