//! Error types for the DDP client.
//!
//! Two families:
//!
//! - [`MethodError`]: the `{error, reason, details}` triple the server (or
//!   the client itself, for `noRetry` failures and stub exceptions) attaches
//!   to one method call or subscription. Always delivered through that
//!   call's callback, never raised into the dispatcher.
//! - [`DdpError`]: engine-level failures. `Invariant` means the connection
//!   state machine is corrupt and must not keep running.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Error code used when a `noRetry` method loses its connection before it
/// was answered.
pub const INVOCATION_FAILED: &str = "invocation-failed";

/// An error attributable to a single method call or subscription.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodError {
    /// Error code: a string such as `"not-found"` or a numeric HTTP-like code.
    pub error: Value,
    /// Human-readable reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Arbitrary extra details.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl MethodError {
    pub fn new(error: impl Into<Value>, reason: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            reason: Some(reason.into()),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    /// The error raised for a `noRetry` method whose connection dropped.
    pub fn invocation_failed() -> Self {
        Self::new(
            INVOCATION_FAILED,
            "Method invocation might have failed due to dropped connection. \
             Failing because `noRetry` option was passed to Meteor.apply.",
        )
    }

    /// Error code as a string, if it is one.
    pub fn code(&self) -> Option<&str> {
        self.error.as_str()
    }
}

impl fmt::Display for MethodError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let code = match &self.error {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match &self.reason {
            Some(reason) => write!(f, "{reason} [{code}]"),
            None => write!(f, "[{code}]"),
        }
    }
}

impl std::error::Error for MethodError {}

/// Engine-level failures.
#[derive(Debug, thiserror::Error)]
pub enum DdpError {
    /// The connection's internal invariants were violated. Continuing would
    /// produce silently wrong data.
    #[error("protocol invariant violated: {0}")]
    Invariant(String),

    /// Permanent version negotiation failure.
    #[error("DDP version negotiation failed; server requested version {0}")]
    VersionNegotiation(String),

    /// A stub raised and the caller asked for stub exceptions to be thrown.
    #[error("stub failed: {0}")]
    Stub(MethodError),

    /// The server answered a method call with an error.
    #[error("method failed: {0}")]
    Method(MethodError),

    /// A method stub with this name is already registered.
    #[error("A method named '{0}' is already defined")]
    DuplicateMethod(String),

    /// The connection task is gone.
    #[error("connection closed")]
    Closed,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl DdpError {
    pub(crate) fn invariant(msg: impl Into<String>) -> Self {
        Self::Invariant(msg.into())
    }

    /// True for errors that mean the connection state can no longer be trusted.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Invariant(_))
    }
}

/// A convenient alias for engine results.
pub type Result<T, E = DdpError> = std::result::Result<T, E>;
