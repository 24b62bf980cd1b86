//! Process-wide stage-default configuration.
//!
//! Kept in its own binary: flipping the global defaults would race
//! tests in other files that rely on them.

use pledge::{set_stage_defaults, stage_defaults, Dispatcher, Promise};
use std::sync::mpsc;
use std::thread;
use std::time::Duration;

#[test]
fn test_stage_defaults_are_settable() {
    let mut defaults = stage_defaults();
    assert_eq!(defaults.then, Dispatcher::Main);

    defaults.then = Dispatcher::Io;
    set_stage_defaults(defaults);

    let (tx, rx) = mpsc::channel();
    Promise::new(|p| p.resolve())
        .on_then(move |value| {
            let name = thread::current().name().unwrap_or("").to_string();
            tx.send(name).unwrap();
            Ok(value)
        })
        .block_on()
        .unwrap();

    let worker = rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert!(
        worker.starts_with("pledge-io"),
        "then stage ran on {worker:?}"
    );

    defaults.then = Dispatcher::Main;
    set_stage_defaults(defaults);
    assert_eq!(stage_defaults().then, Dispatcher::Main);
}
