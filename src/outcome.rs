//! Settlement outcomes and progress events
//!
//! An [`Outcome`] is the immutable, code-keyed result of a promise:
//! success (optionally with an opaque payload) or failure with a code
//! and message. Identity is the code string; two outcomes with the same
//! code compare equal regardless of message or payload.

use std::any::Any;
use std::fmt;
use std::sync::Arc;

/// Opaque payload carried by a successful outcome.
///
/// Shared across threads once settled, hence the `Arc`.
pub type Payload = Arc<dyn Any + Send + Sync>;

/// Well-known outcome codes.
///
/// Arbitrary application codes are equally valid; these are the ones the
/// runtime itself produces or gives convenience factories for.
pub mod codes {
    pub const SUCCESS: &str = "SUCCESS";
    pub const FAILURE: &str = "FAILURE";
    pub const CANCEL: &str = "CANCEL";
    pub const ABORT: &str = "ABORT";
    pub const TIMEOUT: &str = "TIMEOUT";
    pub const BUSY: &str = "BUSY";
    pub const NOTHING: &str = "NOTHING";
    pub const NONSUPPORT: &str = "NONSUPPORT";
    pub const NOT_AUTH: &str = "NOT_AUTH";
    pub const ERR_INTERNAL: &str = "ERR_INTERNAL";
    pub const ERR_SERVER: &str = "ERR_SERVER";
    pub const ERR_PARAMS: &str = "ERR_PARAMS";
    pub const ERR_NETWORK: &str = "ERR_NETWORK";
}

/// Wraps a value as an outcome payload.
pub fn payload<T: Any + Send + Sync>(data: T) -> Payload {
    Arc::new(data)
}

/// Downcasts an optional payload to a concrete type.
///
/// Returns `None` when the payload is absent or of a different type;
/// never panics.
pub fn downcast<T: Any + Send + Sync>(data: &Option<Payload>) -> Option<Arc<T>> {
    data.clone()?.downcast::<T>().ok()
}

/// The settled result of a promise.
#[derive(Clone)]
pub struct Outcome {
    code: String,
    msg: String,
    payload: Option<Payload>,
}

impl Outcome {
    /// Creates an outcome with an arbitrary code and message.
    pub fn new(code: impl Into<String>, msg: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            msg: msg.into(),
            payload: None,
        }
    }

    pub fn success() -> Self {
        Self::new(codes::SUCCESS, "ok")
    }

    /// Success carrying a typed payload.
    pub fn success_with<T: Any + Send + Sync>(data: T) -> Self {
        Self::success_payload(payload(data))
    }

    pub(crate) fn success_payload(data: Payload) -> Self {
        Self {
            code: codes::SUCCESS.to_string(),
            msg: "ok".to_string(),
            payload: Some(data),
        }
    }

    pub fn failure() -> Self {
        Self::new(codes::FAILURE, "operation failed")
    }

    pub fn failure_msg(msg: impl Into<String>) -> Self {
        Self::new(codes::FAILURE, msg)
    }

    pub fn cancel() -> Self {
        Self::new(codes::CANCEL, "cancelled")
    }

    pub fn abort() -> Self {
        Self::new(codes::ABORT, "aborted")
    }

    pub fn timeout() -> Self {
        Self::new(codes::TIMEOUT, "operation timed out")
    }

    pub fn busy() -> Self {
        Self::new(codes::BUSY, "busy")
    }

    pub fn nothing() -> Self {
        Self::new(codes::NOTHING, "no-op")
    }

    pub fn nonsupport() -> Self {
        Self::new(codes::NONSUPPORT, "not supported")
    }

    pub fn not_auth() -> Self {
        Self::new(codes::NOT_AUTH, "not authorized")
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(codes::ERR_INTERNAL, msg)
    }

    pub fn server(msg: impl Into<String>) -> Self {
        Self::new(codes::ERR_SERVER, msg)
    }

    pub fn params(msg: impl Into<String>) -> Self {
        Self::new(codes::ERR_PARAMS, msg)
    }

    pub fn network(msg: impl Into<String>) -> Self {
        Self::new(codes::ERR_NETWORK, msg)
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn msg(&self) -> &str {
        &self.msg
    }

    /// True only for SUCCESS outcomes.
    pub fn is_success(&self) -> bool {
        self.code == codes::SUCCESS
    }

    /// Compares the outcome code against the given one.
    pub fn is(&self, code: &str) -> bool {
        self.code == code
    }

    /// The raw payload, if any.
    pub fn payload(&self) -> Option<Payload> {
        self.payload.clone()
    }

    /// Typed payload extractor: `None` on absence or type mismatch.
    pub fn payload_as<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        downcast::<T>(&self.payload)
    }
}

impl PartialEq for Outcome {
    fn eq(&self, other: &Self) -> bool {
        self.code == other.code
    }
}

impl fmt::Debug for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Outcome")
            .field("code", &self.code)
            .field("msg", &self.msg)
            .field("payload", &self.payload.as_ref().map(|_| "<payload>"))
            .finish()
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{{code: \"{}\"; msg: \"{}\"}}", self.code, self.msg)
    }
}

/// An ordered, out-of-band notification emitted while a promise is in
/// flight, distinct from the terminal result.
#[derive(Debug, Clone)]
pub struct Progress {
    pub value: i32,
    pub detail: Option<Outcome>,
}

impl Progress {
    pub fn new(value: i32) -> Self {
        Self {
            value,
            detail: None,
        }
    }

    pub fn with_detail(value: i32, detail: Outcome) -> Self {
        Self {
            value,
            detail: Some(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equality_is_by_code() {
        let a = Outcome::new("E1", "first");
        let b = Outcome::new("E1", "second");
        let c = Outcome::new("E2", "first");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn test_is_success_only_for_success() {
        assert!(Outcome::success().is_success());
        assert!(Outcome::success_with(1u8).is_success());
        assert!(!Outcome::failure().is_success());
        assert!(!Outcome::timeout().is_success());
        assert!(!Outcome::abort().is_success());
        assert!(!Outcome::not_auth().is_success());
    }

    #[test]
    fn test_payload_extractor_type_safety() {
        let out = Outcome::success_with(42i32);
        assert_eq!(*out.payload_as::<i32>().unwrap(), 42);
        assert!(out.payload_as::<String>().is_none());
        assert!(Outcome::success().payload_as::<i32>().is_none());
    }

    #[test]
    fn test_display_format() {
        let out = Outcome::new("BUSY", "try later");
        assert_eq!(out.to_string(), "{code: \"BUSY\"; msg: \"try later\"}");
    }

    #[test]
    fn test_downcast_helper() {
        let data = Some(payload("hello".to_string()));
        assert_eq!(*downcast::<String>(&data).unwrap(), "hello");
        assert!(downcast::<i32>(&data).is_none());
        assert!(downcast::<i32>(&None).is_none());
    }
}
