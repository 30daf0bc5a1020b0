use std::fmt::{Display, Formatter};
use thiserror::Error;

/// The closed set of failure categories the routing core distinguishes.
///
/// Redelivery policies, failover sets and circuit breakers match failures by
/// kind; the first registered policy whose kind set contains a failure's kind
/// wins over the route default.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A failure raised by user code inside a processor.
    Processing,
    /// Input that a processor refused to accept.
    Validation,
    /// An I/O style failure from an external collaborator.
    Io,
    /// A wait elapsed before the work completed.
    Timeout,
    /// A bounded resource (task pool, circuit breaker) refused the work.
    Rejected,
    /// A circuit breaker is open and did not attempt delivery.
    CircuitOpen,
    /// A deliberate "abort this unit of work" signal, never redelivered.
    Rollback,
    /// A saga context was required but missing, or compensation failed.
    Saga,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorKind::Processing => "processing",
            ErrorKind::Validation => "validation",
            ErrorKind::Io => "io",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Rejected => "rejected",
            ErrorKind::CircuitOpen => "circuit-open",
            ErrorKind::Rollback => "rollback",
            ErrorKind::Saga => "saga",
        };
        write!(f, "{}", name)
    }
}

/// The failure value attached to an exchange when a processing step fails.
///
/// This is a value, not a live error chain: it is cloned into branch copies,
/// carried across redelivery attempts and inspected by policies, so it stays
/// `Clone` and self-contained.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{kind} error: {message}")]
pub struct ProcessingError {
    kind: ErrorKind,
    message: String,
}

impl ProcessingError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Processing, message)
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn io(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, message)
    }

    pub fn rejected(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rejected, message)
    }

    pub fn circuit_open(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::CircuitOpen, message)
    }

    pub fn rollback(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Rollback, message)
    }

    pub fn saga(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Saga, message)
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    /// Rollback failures skip redelivery and go straight to the rollback
    /// disposition.
    pub fn is_rollback(&self) -> bool {
        self.kind == ErrorKind::Rollback
    }
}
