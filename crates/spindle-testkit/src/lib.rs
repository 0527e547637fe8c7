//! Shared helpers for spindle integration tests: a canned task registry,
//! payload sample sets, and pool construction shortcuts with test-friendly
//! timers.

use bytes::Bytes;

use spindle::options::{DispatcherOptions, PoolOptions, TimerOptions};
use spindle::task::TaskOutput;
use spindle::{Payload, Pool, PoolError, TaskRegistry};

/// Install a test subscriber once; later calls are no-ops.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_test_writer()
        .try_init();
}

/// One sample of every payload kind that crosses the wire.
pub fn sample_payloads() -> Vec<Payload> {
    spindle::register_symbol("testkit.sample");
    vec![
        Payload::F64(2.5),
        Payload::I64(-7),
        Payload::U64(u64::MAX),
        Payload::Bool(true),
        Payload::Null,
        Payload::Unit,
        Payload::Timestamp(1_726_000_000_000.0),
        Payload::str("short"),
        Payload::Str("long ".repeat(400)),
        Payload::Symbol("testkit.sample".into()),
        Payload::Bytes(Bytes::from_static(b"\x00\x01\xfe\xff")),
        Payload::I32Array(vec![-3, 0, 3]),
        Payload::F64Array(vec![0.5; 300]),
        Payload::I64Array(vec![i64::MIN, i64::MAX]),
        Payload::U64Array(vec![1, 2, 3]),
        Payload::Json(serde_json::json!({"nested": {"list": [1, 2.5, "x"]}})),
        Payload::Numeric(vec![1.0, 2.0, 3.0]),
        Payload::BigInt {
            negative: false,
            magnitude: vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01],
        },
    ]
}

/// The tasks every integration test can rely on:
///
/// - `echo` returns its argument unchanged
/// - `append_world` appends `" world"` to a string argument
/// - `sum` folds a numeric sequence to one `F64`
/// - `fail` always rejects with its argument
/// - `later` completes through a deferred output on a helper thread
pub fn standard_registry() -> TaskRegistry {
    let mut reg = TaskRegistry::new();
    reg.register_fn("echo", Ok);
    reg.register_fn("append_world", |arg| match arg {
        Payload::Str(s) => Ok(Payload::Str(s + " world")),
        other => Err(Payload::Str(format!("append_world wants a string, got {other:?}"))),
    });
    reg.register_fn("sum", |arg| {
        let values = match arg {
            Payload::F64Array(v) | Payload::Numeric(v) => v,
            other => return Err(Payload::Str(format!("sum wants numbers, got {other:?}"))),
        };
        Ok(Payload::F64(values.iter().sum()))
    });
    reg.register_fn("fail", Err);
    reg.register("later", |arg| {
        let (handle, out) = TaskOutput::deferred();
        std::thread::spawn(move || {
            std::thread::sleep(std::time::Duration::from_millis(5));
            handle.fulfill(arg);
        });
        out
    });
    reg
}

/// Options tuned so tests spend milliseconds, not scheduler defaults.
pub fn fast_options(threads: usize) -> PoolOptions {
    PoolOptions::default()
        .threads(threads)
        .timers(TimerOptions {
            spin_us: Some(20),
            park_ms: Some(1),
        })
        .dispatcher(DispatcherOptions {
            stall_free_loops: 8,
            max_backoff_ms: 1,
        })
}

/// A pool with the standard registry and fast timers.
pub fn standard_pool(threads: usize) -> Result<Pool, PoolError> {
    init_tracing();
    Pool::builder()
        .options(fast_options(threads))
        .registry(standard_registry())
        .build()
}
