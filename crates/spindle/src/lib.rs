//! Shared-memory task dispatch pool.
//!
//! A [`Pool`] owns a set of lanes, one per worker thread. Each lane is a
//! pair of lock-free header rings plus payload arenas in shared memory
//! (see `spindle-core`); the host side runs a dispatcher thread per lane,
//! the worker side an execution loop with spin-then-park waiting. A
//! balancer spreads calls across lanes, optionally short-circuiting
//! low-concurrency traffic onto an inline, same-thread lane.
//!
//! ```no_run
//! use spindle::{Pool, Payload};
//!
//! let pool = Pool::builder()
//!     .threads(2)
//!     .register_fn("greet", |arg| match arg {
//!         Payload::Str(name) => Ok(Payload::Str(format!("hello {name}"))),
//!         other => Err(Payload::Str(format!("bad argument: {other:?}"))),
//!     })
//!     .build()
//!     .unwrap();
//!
//! let greet = pool.handle("greet").unwrap();
//! let reply = greet.call(Payload::str("world")).wait();
//! assert_eq!(reply, Ok(Payload::str("hello world")));
//! pool.shutdown();
//! ```

pub mod balancer;
mod dispatch;
mod inline;
mod lane;
pub mod options;
mod pending;
mod pool;
pub mod task;
mod worker;

pub use balancer::Strategy;
pub use options::{DispatcherOptions, InlinePlacement, InlinerOptions, PoolOptions, TimerOptions};
pub use pending::{Pending, Settled};
pub use pool::{Pool, PoolBuilder, PoolError, TaskHandle};
pub use task::{DeferredResult, TaskOutput, TaskRegistry, TaskResult};

pub use spindle_core::{
    register_symbol, symbol_registered, Payload, Rejection, CLOSED_REASON,
};
