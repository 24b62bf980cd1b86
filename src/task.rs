//! Fire-and-forget async blocks
//!
//! [`Async`] runs a fallible closure on its own detached thread and
//! funnels every failure mode, returned errors and panics alike, into a
//! single optional catch handler. Blocking promise waits compose
//! naturally: a `?` on `block_on` inside the block surfaces the
//! rejection, with its promise handle, to the handler.

use crate::error::{panic_message, PromiseError};
use crate::outcome::Outcome;
use crate::promise::Promise;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex};
use std::thread;

type CatchFn = Box<dyn FnOnce(&Outcome, Option<&Arc<Promise>>) + Send + 'static>;

/// Handle to a spawned async block. Dropping it does not cancel the
/// block; it only abandons the chance to attach a catch handler.
pub struct Async {
    catch: Arc<Mutex<Option<CatchFn>>>,
}

impl Async {
    /// Spawns `func` on a fresh detached thread and returns
    /// immediately.
    ///
    /// When the block returns an error or panics, the failure is routed
    /// to the handler registered with [`Async::on_catch`]; without one
    /// it is logged and dropped. A rejection error also hands the
    /// failed promise to the handler.
    pub fn spawn<F>(func: F) -> Async
    where
        F: FnOnce() -> Result<(), PromiseError> + Send + 'static,
    {
        let catch: Arc<Mutex<Option<CatchFn>>> = Arc::new(Mutex::new(None));
        let cell = Arc::clone(&catch);
        let spawned = thread::Builder::new()
            .name("pledge-async".to_string())
            .spawn(move || {
                let (outcome, promise) = match catch_unwind(AssertUnwindSafe(func)) {
                    Ok(Ok(())) => return,
                    Ok(Err(PromiseError::Rejected { promise, outcome })) => (outcome, promise),
                    Ok(Err(err)) => (Outcome::internal(err.to_string()), None),
                    Err(panic) => (Outcome::internal(panic_message(panic)), None),
                };
                let handler = cell.lock().unwrap().take();
                match handler {
                    Some(handler) => handler(&outcome, promise.as_ref()),
                    None => tracing::warn!(
                        code = %outcome.code(),
                        msg = %outcome.msg(),
                        "unhandled async failure"
                    ),
                }
            });
        if let Err(err) = spawned {
            tracing::warn!(error = %err, "failed to spawn async block");
        }
        Async { catch }
    }

    /// Attaches the failure handler. Register it on the same statement
    /// as [`Async::spawn`]; a block that fails before the handler is in
    /// place falls back to the log path.
    pub fn on_catch<F>(self, func: F) -> Async
    where
        F: FnOnce(&Outcome, Option<&Arc<Promise>>) + Send + 'static,
    {
        *self.catch.lock().unwrap() = Some(Box::new(func));
        self
    }
}
