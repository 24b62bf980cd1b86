//! End-to-end promise lifecycle tests: settlement, callback chains,
//! retry, timeout, progress ordering and close semantics.

use pledge::{codes, downcast, payload, Dispatcher, Outcome, Promise, PromiseError};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

fn wait_until<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    cond()
}

#[test]
fn test_body_without_settlement_auto_resolves() {
    let result = Promise::new(|_| {}).block_on().unwrap();
    assert!(result.is_none());
}

#[test]
fn test_resolve_with_payload() {
    let result = Promise::new(|p| p.resolve_with(100i32)).block_on().unwrap();
    assert_eq!(*downcast::<i32>(&result).unwrap(), 100);
}

#[test]
fn test_reject_surfaces_as_error() {
    let err = Promise::new(|p| p.reject()).block_on().unwrap_err();
    let outcome = err.outcome().expect("rejection must carry an outcome");
    assert!(outcome.is(codes::FAILURE));
}

#[test]
fn test_body_panic_rejects_internal() {
    let err = Promise::new(|_| panic!("boom")).block_on().unwrap_err();
    let outcome = err.outcome().unwrap();
    assert!(outcome.is(codes::ERR_INTERNAL));
    assert!(outcome.msg().contains("boom"));
}

#[test]
fn test_then_chain_threads_the_value() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let observer = Arc::clone(&seen);

    let result = Promise::new(|p| p.resolve_with(1i32))
        .on_then(|value| {
            let n = *downcast::<i32>(&value).unwrap();
            Ok(Some(payload(n + 1)))
        })
        .on_then(move |value| {
            observer.lock().unwrap().push(*downcast::<i32>(&value).unwrap());
            Ok(value)
        })
        .block_on()
        .unwrap();

    assert_eq!(*downcast::<i32>(&result).unwrap(), 2);
    assert_eq!(*seen.lock().unwrap(), vec![2]);
}

#[test]
fn test_then_failure_redirects_to_catch() {
    let caught = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&caught);

    let err = Promise::new(|p| p.resolve())
        .on_then(|_| Err(Outcome::params("bad input")))
        .on_catch(move |outcome| {
            *sink.lock().unwrap() = Some(outcome.code().to_string());
        })
        .block_on()
        .unwrap_err();

    assert!(err.outcome().unwrap().is(codes::ERR_PARAMS));
    assert_eq!(caught.lock().unwrap().as_deref(), Some(codes::ERR_PARAMS));
}

#[test]
fn test_every_catch_stage_runs_in_order() {
    let order = Arc::new(Mutex::new(Vec::new()));
    let first = Arc::clone(&order);
    let second = Arc::clone(&order);

    let err = Promise::new(|p| p.reject_err("E_DB", "connection refused"))
        .on_catch(move |_| first.lock().unwrap().push(1))
        .on_catch(move |_| second.lock().unwrap().push(2))
        .block_on()
        .unwrap_err();

    assert!(err.outcome().unwrap().is("E_DB"));
    assert_eq!(*order.lock().unwrap(), vec![1, 2]);
}

#[test]
fn test_auto_resolve_skips_then_chain() {
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);

    let result = Promise::new(|_| {})
        .on_then(move |value| {
            flag.store(true, Ordering::SeqCst);
            Ok(value)
        })
        .block_on()
        .unwrap();

    assert!(result.is_none());
    assert!(!ran.load(Ordering::SeqCst));
}

#[test]
fn test_first_settlement_wins() {
    let result = Promise::new(|p| {
        p.resolve_with(7i32);
        p.reject();
        p.resolve_with(8i32);
    })
    .block_on()
    .unwrap();
    assert_eq!(*downcast::<i32>(&result).unwrap(), 7);
}

#[test]
fn test_close_runs_exactly_once() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);

    let promise = Promise::new(|p| p.resolve()).on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let handle = Arc::clone(&promise);

    promise.block_on().unwrap();
    assert!(wait_until(
        || closes.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));

    handle.close();
    handle.close();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(closes.load(Ordering::SeqCst), 1);
}

#[test]
fn test_force_close_records_abort() {
    let closes = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&closes);

    let promise = Promise::new(|p| p.external()).on_close(move || {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let handle = Arc::clone(&promise);
    promise.launch().unwrap();

    // Let the body run and park in the external state.
    thread::sleep(Duration::from_millis(50));
    handle.close();

    assert!(wait_until(
        || handle.result().is_some(),
        Duration::from_secs(2)
    ));
    assert!(handle.result().unwrap().is(codes::ABORT));
    assert!(wait_until(
        || closes.load(Ordering::SeqCst) == 1,
        Duration::from_secs(2)
    ));
}

#[test]
fn test_progress_delivered_in_order() {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);

    Promise::new(|p| {
        for i in 0..50 {
            p.progress(i);
        }
        p.resolve();
    })
    .on_progress(move |event| {
        // A slow subscriber must not reorder or drop events.
        thread::sleep(Duration::from_millis(1));
        sink.lock().unwrap().push(event.value);
    })
    .block_on()
    .unwrap();

    assert!(wait_until(
        || seen.lock().unwrap().len() == 50,
        Duration::from_secs(5)
    ));
    assert_eq!(*seen.lock().unwrap(), (0..50).collect::<Vec<_>>());
}

#[test]
fn test_progress_detail_outcome() {
    let detail = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&detail);

    Promise::new(|p| {
        p.progress_with(5, Outcome::busy());
        p.resolve();
    })
    .on_progress(move |event| {
        *sink.lock().unwrap() = event.detail.clone();
    })
    .block_on()
    .unwrap();

    assert!(wait_until(
        || detail.lock().unwrap().is_some(),
        Duration::from_secs(2)
    ));
    assert!(detail.lock().unwrap().as_ref().unwrap().is(codes::BUSY));
}

#[test]
fn test_timeout_rejects_slow_body() {
    let started = Instant::now();
    let err = Promise::new(|p| {
        thread::sleep(Duration::from_millis(500));
        p.resolve_with(1i32);
    })
    .timeout(100)
    .block_on()
    .unwrap_err();

    assert!(err.outcome().unwrap().is(codes::TIMEOUT));
    assert!(started.elapsed() >= Duration::from_millis(100));
    assert!(started.elapsed() < Duration::from_millis(400));
}

#[test]
fn test_each_retry_gets_a_fresh_timeout_window() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let err = Promise::new(move |p| {
        counter.fetch_add(1, Ordering::SeqCst);
        thread::sleep(Duration::from_millis(250));
        p.reject_err("E_SLOW", "still warming up");
    })
    .retry(2)
    .timeout(400)
    .block_on()
    .unwrap_err();

    // Three 250ms attempts overrun a single 400ms window; only a
    // per-attempt re-arm keeps the timer quiet and lets the explicit
    // rejection win.
    assert!(err.outcome().unwrap().is("E_SLOW"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn test_fast_body_beats_timeout() {
    let result = Promise::new(|p| p.resolve_with(3i32))
        .timeout(500)
        .block_on()
        .unwrap();
    assert_eq!(*downcast::<i32>(&result).unwrap(), 3);
}

#[test]
fn test_retry_until_success() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let promise = Promise::new(move |p| {
        let attempt = counter.fetch_add(1, Ordering::SeqCst);
        if attempt < 2 {
            p.reject();
        } else {
            p.resolve_with(attempt);
        }
    })
    .retry(5);
    let handle = Arc::clone(&promise);

    let result = promise.block_on().unwrap();
    assert_eq!(*downcast::<usize>(&result).unwrap(), 2);
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
    assert_eq!(handle.retry_count(), 2);
}

#[test]
fn test_retry_budget_exhausted() {
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&attempts);

    let err = Promise::new(move |p| {
        counter.fetch_add(1, Ordering::SeqCst);
        p.reject_err("E_FLAKY", "still down");
    })
    .retry(2)
    .block_on()
    .unwrap_err();

    assert!(err.outcome().unwrap().is("E_FLAKY"));
    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

#[test]
fn test_block_on_unconfined_fails_fast() {
    let err = Promise::with(Dispatcher::Unconfined, "", |p| p.resolve())
        .block_on()
        .unwrap_err();
    assert!(matches!(err, PromiseError::AwaitUnconfined));
}

#[test]
fn test_second_launch_is_invalid() {
    let promise = Promise::new(|p| p.resolve());
    let again = Arc::clone(&promise);

    promise.launch().unwrap();
    let err = again.launch().unwrap_err();
    assert!(matches!(err, PromiseError::InvalidState(_)));
}

#[test]
fn test_presettled_promises() {
    let result = Promise::resolved_with(9i32).block_on().unwrap();
    assert_eq!(*downcast::<i32>(&result).unwrap(), 9);

    assert!(Promise::resolved().block_on().unwrap().is_none());

    let err = Promise::rejected_with(Outcome::cancel())
        .block_on()
        .unwrap_err();
    assert!(err.outcome().unwrap().is(codes::CANCEL));
}

#[test]
fn test_named_promise_keeps_its_name() {
    let promise = Promise::named("fetch-user", |p| p.resolve());
    assert_eq!(promise.name(), "fetch-user");
    assert!(!promise.is_finished());
}

#[test]
fn test_then_panic_redirects_to_catch() {
    let caught = Arc::new(Mutex::new(None));
    let sink = Arc::clone(&caught);

    let err = Promise::new(|p| p.resolve())
        .on_then(|_| panic!("stage blew up"))
        .on_catch(move |outcome| {
            *sink.lock().unwrap() = Some(outcome.code().to_string());
        })
        .block_on()
        .unwrap_err();

    assert!(err.outcome().unwrap().is(codes::ERR_INTERNAL));
    assert_eq!(caught.lock().unwrap().as_deref(), Some(codes::ERR_INTERNAL));
}

#[test]
fn test_catch_logging_does_not_disturb_settlement() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let err = Promise::named("doomed", |p| p.reject())
        .on_catch_log(true)
        .block_on()
        .unwrap_err();
    assert!(err.outcome().unwrap().is(codes::FAILURE));
}

#[test]
fn test_explicit_stage_dispatchers() {
    let (tx, rx) = mpsc::channel();
    Promise::with(Dispatcher::Default, "io-hop", |p| p.resolve_with(11i32))
        .on_then_at(Dispatcher::Io, move |value| {
            tx.send(*downcast::<i32>(&value).unwrap()).unwrap();
            Ok(value)
        })
        .block_on()
        .unwrap();
    assert_eq!(rx.recv_timeout(Duration::from_secs(2)).unwrap(), 11);
}
