use std::fmt;

use strum_macros::Display;

use crate::value::Value;

/// Classification of runtime failures. Everything except
/// `RuntimeAssertion` is recoverable at a protected-call checkpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
pub enum ErrorKind {
    Type,
    NotCallable,
    Index,
    StackOverflow,
    Allocation,
    User,
    Coroutine,
    YieldAcrossBoundary,
    RuntimeAssertion,
}

#[derive(Debug, Clone)]
pub struct RuntimeError {
    pub kind: ErrorKind,
    pub message: String,
    pub line: Option<usize>,
    /// Arbitrary script value attached by an explicit `error(...)` raise.
    pub payload: Option<Value>,
}

impl RuntimeError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        RuntimeError {
            kind,
            message: message.into(),
            line: None,
            payload: None,
        }
    }

    /// A script-raised error with an arbitrary value payload.
    pub fn user(payload: Value, message: impl Into<String>) -> Self {
        RuntimeError {
            kind: ErrorKind::User,
            message: message.into(),
            line: None,
            payload: Some(payload),
        }
    }

    /// Broken core invariant. Never converted into a recoverable error;
    /// protected calls re-propagate it untouched.
    pub fn assertion(message: impl Into<String>) -> Self {
        RuntimeError::new(ErrorKind::RuntimeAssertion, message)
    }

    pub fn with_line(mut self, line: usize) -> Self {
        self.line = Some(line);
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.kind == ErrorKind::RuntimeAssertion
    }
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "Runtime error: {} [line {}] in script", self.message, line),
            None => write!(f, "Runtime error: {}", self.message),
        }
    }
}

impl std::error::Error for RuntimeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_line_when_known() {
        let err = RuntimeError::new(ErrorKind::Type, "operand must be a number").with_line(7);
        assert_eq!(
            err.to_string(),
            "Runtime error: operand must be a number [line 7] in script"
        );
    }

    #[test]
    fn display_without_line() {
        let err = RuntimeError::new(ErrorKind::StackOverflow, "stack overflow");
        assert_eq!(err.to_string(), "Runtime error: stack overflow");
    }

    #[test]
    fn only_assertions_are_fatal() {
        assert!(RuntimeError::assertion("corrupted frame chain").is_fatal());
        assert!(!RuntimeError::new(ErrorKind::User, "boom").is_fatal());
    }
}
