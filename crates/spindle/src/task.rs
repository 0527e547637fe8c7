//! Task functions and the registry shared between host and workers.
//!
//! Functions are registered once at pool build time; their registration
//! index is the `fn_id` carried in every header, so host and worker agree
//! by construction. A function takes the decoded argument payload and
//! returns either an immediate result or a deferred one the worker polls
//! to completion.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::oneshot;

use spindle_core::{BootstrapError, Payload};

/// `Ok` fulfills the call, `Err` rejects it; the payload is forwarded to
/// the host verbatim either way.
pub type TaskResult = Result<Payload, Payload>;

/// What a task function hands back to the worker loop.
pub enum TaskOutput {
    Ready(TaskResult),
    /// The result arrives later; the worker keeps the task executing until
    /// the receiver is ready. Timeout or cancellation decorators wrap the
    /// sending side.
    Deferred(oneshot::Receiver<TaskResult>),
}

impl TaskOutput {
    /// A deferred output plus the handle that completes it.
    pub fn deferred() -> (DeferredResult, TaskOutput) {
        let (tx, rx) = oneshot::channel();
        (DeferredResult { tx }, TaskOutput::Deferred(rx))
    }
}

impl From<TaskResult> for TaskOutput {
    fn from(result: TaskResult) -> Self {
        TaskOutput::Ready(result)
    }
}

/// Completes a deferred task exactly once; consumed on use.
pub struct DeferredResult {
    tx: oneshot::Sender<TaskResult>,
}

impl DeferredResult {
    pub fn fulfill(self, value: Payload) {
        let _ = self.tx.send(Ok(value));
    }

    pub fn reject(self, reason: Payload) {
        let _ = self.tx.send(Err(reason));
    }
}

pub type TaskFn = Arc<dyn Fn(Payload) -> TaskOutput + Send + Sync>;

/// Immutable name → function table. Built once, then shared by every lane.
#[derive(Clone, Default)]
pub struct TaskRegistry {
    fns: Vec<TaskFn>,
    names: Vec<String>,
    by_name: HashMap<String, u32>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a function returning [`TaskOutput`]. Re-registering a name
    /// replaces the function but keeps its id.
    pub fn register<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Payload) -> TaskOutput + Send + Sync + 'static,
    {
        match self.by_name.get(name) {
            Some(&id) => self.fns[id as usize] = Arc::new(f),
            None => {
                let id = self.fns.len() as u32;
                self.fns.push(Arc::new(f));
                self.names.push(name.to_owned());
                self.by_name.insert(name.to_owned(), id);
            }
        }
    }

    /// Register a plain synchronous function.
    pub fn register_fn<F>(&mut self, name: &str, f: F)
    where
        F: Fn(Payload) -> TaskResult + Send + Sync + 'static,
    {
        self.register(name, move |arg| TaskOutput::Ready(f(arg)));
    }

    pub fn id(&self, name: &str) -> Option<u32> {
        self.by_name.get(name).copied()
    }

    pub fn name(&self, id: u32) -> Option<&str> {
        self.names.get(id as usize).map(String::as_str)
    }

    pub fn get(&self, id: u32) -> Option<&TaskFn> {
        self.fns.get(id as usize)
    }

    pub fn len(&self) -> usize {
        self.fns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fns.is_empty()
    }

    /// Startup validation: a worker with nothing to run is a bootstrap
    /// failure, not an idle worker.
    pub fn ensure_not_empty(&self) -> Result<(), BootstrapError> {
        if self.is_empty() {
            Err(BootstrapError::NoTasks)
        } else {
            Ok(())
        }
    }
}
