//! End-to-end pool tests: calls cross real shared-memory lanes into worker
//! threads and settle back on the caller.

use spindle::options::{InlinePlacement, InlinerOptions};
use spindle::{Payload, Pool, Rejection, CLOSED_REASON};
use spindle_testkit as testkit;

#[test]
fn append_world_round_trip() {
    let pool = testkit::standard_pool(1).unwrap();
    let append = pool.handle("append_world").unwrap();
    assert_eq!(
        append.call(Payload::str("hello")).wait(),
        Ok(Payload::str("hello world"))
    );
    pool.shutdown();
}

#[test]
fn float_array_passes_through_the_arena() {
    let pool = testkit::standard_pool(1).unwrap();
    let echo = pool.handle("echo").unwrap();

    // 4000 doubles: far past the 512-byte static area.
    let big: Vec<f64> = (0..4000).map(|i| i as f64 / 3.0).collect();
    let got = echo.call(Payload::F64Array(big.clone())).wait();
    assert_eq!(got, Ok(Payload::F64Array(big)));
    pool.shutdown();
}

#[test]
fn every_payload_kind_echoes_intact() {
    let pool = testkit::standard_pool(2).unwrap();
    let echo = pool.handle("echo").unwrap();
    for payload in testkit::sample_payloads() {
        let got = echo.call(payload.clone()).wait();
        assert_eq!(got, Ok(payload));
    }
    pool.shutdown();
}

#[test]
fn backpressure_settles_every_call() {
    let pool = testkit::standard_pool(1).unwrap();
    let echo = pool.handle("echo").unwrap();

    // Well past both the 32 ring slots and the 32 arena entries; large
    // payloads force the dynamic path throughout.
    let pendings: Vec<_> = (0..80)
        .map(|i| echo.call(Payload::F64Array(vec![i as f64; 200])))
        .collect();
    for (i, pending) in pendings.into_iter().enumerate() {
        assert_eq!(pending.wait(), Ok(Payload::F64Array(vec![i as f64; 200])));
    }
    assert_eq!(pool.in_flight(), 0);
    pool.shutdown();
}

#[test]
fn task_rejection_forwards_the_value() {
    let pool = testkit::standard_pool(1).unwrap();
    let fail = pool.handle("fail").unwrap();
    assert_eq!(
        fail.call(Payload::I64(13)).wait(),
        Err(Rejection::Value(Payload::I64(13)))
    );
    pool.shutdown();
}

#[test]
fn deferred_task_output_settles_later() {
    let pool = testkit::standard_pool(1).unwrap();
    let later = pool.handle("later").unwrap();
    assert_eq!(
        later.call(Payload::str("patience")).wait(),
        Ok(Payload::str("patience"))
    );
    pool.shutdown();
}

#[test]
fn deferred_argument_feeds_the_call() {
    let pool = testkit::standard_pool(1).unwrap();
    let echo = pool.handle("echo").unwrap();

    let (tx, rx) = tokio::sync::oneshot::channel();
    let pending = echo.call_deferred(rx);
    std::thread::sleep(std::time::Duration::from_millis(10));
    tx.send(Ok(Payload::U64(77))).unwrap();
    assert_eq!(pending.wait(), Ok(Payload::U64(77)));
    pool.shutdown();
}

#[test]
fn shutdown_rejects_in_flight_with_pool_closed() {
    let pool = Pool::builder()
        .options(testkit::fast_options(1))
        .register("hang", |_| {
            let (handle, out) = spindle::TaskOutput::deferred();
            std::mem::forget(handle);
            out
        })
        .build()
        .unwrap();

    let stuck = pool.handle("hang").unwrap().call(Payload::Null);
    std::thread::sleep(std::time::Duration::from_millis(30));
    pool.shutdown();

    let err = stuck.wait().unwrap_err();
    assert_eq!(err, Rejection::Closed);
    assert_eq!(err.to_string(), CLOSED_REASON);
}

#[test]
fn calls_after_shutdown_reject_immediately() {
    let pool = testkit::standard_pool(1).unwrap();
    let echo = pool.handle("echo").unwrap();
    pool.shutdown();
    assert_eq!(echo.call(Payload::Null).wait(), Err(Rejection::Closed));
}

#[test]
fn unencodable_argument_rejects_asynchronously() {
    let pool = testkit::standard_pool(1).unwrap();
    let echo = pool.handle("echo").unwrap();
    let got = echo
        .call(Payload::Symbol("pool-test-never-registered".into()))
        .wait();
    match got {
        Err(Rejection::Encode(e)) => assert_eq!(e.code.as_str(), "SPN_ENC_SYMBOL"),
        other => panic!("expected encode rejection, got {other:?}"),
    }
    pool.shutdown();
}

#[test]
fn multi_lane_pool_spreads_and_settles() {
    let pool = testkit::standard_pool(4).unwrap();
    let sum = pool.handle("sum").unwrap();
    let pendings: Vec<_> = (1..=40)
        .map(|n| sum.call(Payload::Numeric(vec![1.0; n])))
        .collect();
    for (i, pending) in pendings.into_iter().enumerate() {
        assert_eq!(pending.wait(), Ok(Payload::F64((i + 1) as f64)));
    }
    pool.shutdown();
}

#[test]
fn single_task_pool_and_sole_handle() {
    let pool = Pool::single(
        |arg| match arg {
            Payload::I64(v) => Ok(Payload::I64(v + 1)),
            other => Err(Payload::Str(format!("want i64, got {other:?}"))),
        },
        testkit::fast_options(1),
    )
    .unwrap();
    assert_eq!(pool.sole().call(Payload::I64(9)).wait(), Ok(Payload::I64(10)));
    pool.shutdown();
}

#[test]
fn inline_lane_serves_low_concurrency() {
    let pool = Pool::builder()
        .options(testkit::fast_options(1).inliner(InlinerOptions {
            enabled: true,
            threshold: 2,
            placement: InlinePlacement::First,
        }))
        .registry(testkit::standard_registry())
        .build()
        .unwrap();

    // Nothing in flight: the call executes inline and is already settled.
    let echo = pool.handle("echo").unwrap();
    let pending = echo.call(Payload::str("inline"));
    assert_eq!(pending.wait(), Ok(Payload::str("inline")));
    assert_eq!(pool.in_flight(), 0);
    pool.shutdown();
}

#[tokio::test]
async fn pending_awaits_on_a_runtime() {
    let pool = testkit::standard_pool(1).unwrap();
    let append = pool.handle("append_world").unwrap();
    let got = append.call(Payload::str("async")).await;
    assert_eq!(got, Ok(Payload::str("async world")));
    pool.shutdown();
}

#[test]
fn resolve_after_finishing_all_still_answers_everything() {
    let pool = Pool::builder()
        .options(testkit::fast_options(1).resolve_after_finishing_all(true))
        .registry(testkit::standard_registry())
        .build()
        .unwrap();
    let echo = pool.handle("echo").unwrap();
    let pendings: Vec<_> = (0..20).map(|i| echo.call(Payload::I64(i))).collect();
    for (i, pending) in pendings.into_iter().enumerate() {
        assert_eq!(pending.wait(), Ok(Payload::I64(i as i64)));
    }
    pool.shutdown();
}
