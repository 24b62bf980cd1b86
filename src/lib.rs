//! # Pledge
//!
//! A thread-based promise runtime with deferred-result semantics:
//! retryable launches, per-attempt timeouts, strictly ordered progress
//! events, chained then/catch/close callbacks on named dispatchers,
//! blocking waits and cross-thread completion by id.
//!
//! ```no_run
//! use pledge::{downcast, Promise};
//!
//! let result = Promise::new(|p| {
//!     p.resolve_with(21 * 2);
//! })
//! .block_on()
//! .unwrap();
//! assert_eq!(*downcast::<i32>(&result).unwrap(), 42);
//! ```
//!
//! A promise that cannot settle from inside its body opts out of
//! auto-resolution with [`Promise::external`] and is completed later by
//! whoever holds its id, through [`registry`].

pub mod dispatcher;
pub mod error;
pub mod id;
pub mod outcome;
pub mod promise;
pub mod registry;
pub mod task;
mod timer;

pub use dispatcher::{set_stage_defaults, stage_defaults, Dispatcher, StageDefaults};
pub use error::PromiseError;
pub use id::{IdGenerator, DEFAULT_CYCLE};
pub use outcome::{codes, downcast, payload, Outcome, Payload, Progress};
pub use promise::Promise;
pub use task::Async;
