//! VM error type.

use thiserror::Error;
use vesper_error::{ErrorKind, ScriptError};

use crate::value::Value;

/// An error produced during execution.
///
/// Wraps the structured [`ScriptError`] surfaced to embedders and, for
/// script-thrown values, the original payload delivered to `catch`
/// blocks. Fatal errors (resource limits, cancellation, observer halts)
/// bypass the exception handler machine entirely.
#[derive(Error, Debug, Clone)]
#[error("{error}")]
pub struct VmError {
    pub error: ScriptError,
    pub payload: Option<Value>,
    pub fatal: bool,
}

impl VmError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ScriptError::new(kind, message),
            payload: None,
            fatal: false,
        }
    }

    pub fn fatal(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            error: ScriptError::new(kind, message),
            payload: None,
            fatal: true,
        }
    }

    pub fn type_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Type, message)
    }

    pub fn value_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Value, message)
    }

    pub fn args_error(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Args, message)
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Runtime, message)
    }

    pub fn halted_by_observer() -> Self {
        Self::fatal(ErrorKind::Runtime, "execution halted by observer")
    }

    pub fn cancelled() -> Self {
        Self::fatal(ErrorKind::Runtime, "execution cancelled")
    }

    pub fn deadline_exceeded() -> Self {
        Self::fatal(ErrorKind::Runtime, "deadline exceeded")
    }

    pub fn with_payload(mut self, payload: Value) -> Self {
        self.payload = Some(payload);
        self
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.error = self.error.with_hint(hint);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind
    }

    pub fn message(&self) -> &str {
        &self.error.message
    }

    /// The annotated multi-line rendering.
    pub fn friendly(&self) -> String {
        self.error.friendly()
    }
}

impl From<String> for VmError {
    fn from(message: String) -> Self {
        Self::runtime(message)
    }
}

impl From<&str> for VmError {
    fn from(message: &str) -> Self {
        Self::runtime(message)
    }
}

impl From<ScriptError> for VmError {
    fn from(error: ScriptError) -> Self {
        Self {
            error,
            payload: None,
            fatal: false,
        }
    }
}
