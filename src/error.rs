//! Error types for the pledge promise runtime
//!
//! Invalid-state and configuration errors are distinct from business
//! rejections, which carry the settled [`Outcome`] and, when available,
//! a handle to the promise that produced it.

use crate::outcome::Outcome;
use crate::promise::Promise;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;

/// Top-level error type for all promise runtime errors
#[derive(Debug, Error)]
pub enum PromiseError {
    /// An operation was attempted in a state that forbids it, such as
    /// launching the same promise twice.
    #[error("invalid promise state: {0}")]
    InvalidState(&'static str),

    /// A blocking wait was requested on the unconfined dispatcher. The
    /// calling thread is the only thread that could service the
    /// completion, so this fails fast instead of deadlocking.
    #[error("blocking wait is forbidden on the unconfined dispatcher")]
    AwaitUnconfined,

    /// The id generator cycle is outside the 19-bit time window.
    #[error("id cycle out of range 1..=524287: {0}")]
    InvalidCycle(u32),

    /// The promise settled with a non-success outcome.
    #[error("promise rejected: {outcome}")]
    Rejected {
        promise: Option<Arc<Promise>>,
        outcome: Outcome,
    },

    /// An internal invariant was violated.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PromiseError {
    /// Returns the rejection outcome when this error is a business
    /// rejection.
    pub fn outcome(&self) -> Option<&Outcome> {
        match self {
            PromiseError::Rejected { outcome, .. } => Some(outcome),
            _ => None,
        }
    }
}

/// Extracts a printable message from a captured panic payload.
pub(crate) fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejected_carries_outcome() {
        let err = PromiseError::Rejected {
            promise: None,
            outcome: Outcome::timeout(),
        };
        assert!(err.outcome().is_some());
        assert!(err.outcome().unwrap().is(crate::outcome::codes::TIMEOUT));
    }

    #[test]
    fn test_panic_message_str() {
        let payload: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(payload), "boom");
    }

    #[test]
    fn test_panic_message_string() {
        let payload: Box<dyn Any + Send> = Box::new(String::from("kaput"));
        assert_eq!(panic_message(payload), "kaput");
    }
}
