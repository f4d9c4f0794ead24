//! Error types for the cadre runtime
//!
//! Domain errors are thiserror enums, one per concern, converted into the
//! top-level [`RuntimeError`] at component boundaries. Every runtime error
//! maps onto an [`ErrorKind`], which orders errors by reporting precedence.

use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use super::status::WorkerStatus;

/// Top-level runtime error
#[derive(Debug, Clone, Error)]
pub enum RuntimeError {
    /// Directive validation or execution errors
    #[error("Directive error: {0}")]
    Directive(#[from] DirectiveError),

    /// Storage port errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Outbound dispatch errors
    #[error("Dispatch error: {0}")]
    Dispatch(#[from] DispatchError),

    /// Lifecycle transition not present in the transition table
    #[error("Invalid transition from {from} to {to}")]
    InvalidTransition {
        /// Status before the attempted transition
        from: WorkerStatus,
        /// Requested status
        to: WorkerStatus,
    },

    /// Signal queue is at capacity; the signal was dropped
    #[error("Signal queue full (max {max})")]
    QueueOverflow {
        /// Configured queue bound
        max: usize,
    },

    /// Malformed input (signal, option, argument)
    #[error("Invalid input: {0}")]
    Invalid(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Instance manager is at its agent limit
    #[error("Agent limit of {0} reached")]
    Capacity(usize),

    /// An action or instruction failed
    #[error("Action '{action}' failed: {message}")]
    Execution {
        /// Action identifier
        action: String,
        /// Failure detail
        message: String,
    },

    /// Strategy failure
    #[error("Planning failed: {0}")]
    Planning(String),

    /// No route matched the signal
    #[error("No route for signal type '{0}'")]
    Routing(String),

    /// A synchronous call or scheduled operation exceeded its bound
    #[error("Timed out after {0}ms")]
    Timeout(u64),

    /// The target worker is no longer running
    #[error("Worker {0} is not running")]
    WorkerStopped(String),

    /// Unexpected failure (caught panic, broken invariant)
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RuntimeError {
    /// Classify this error for reporting
    pub fn kind(&self) -> ErrorKind {
        match self {
            RuntimeError::Directive(_)
            | RuntimeError::InvalidTransition { .. }
            | RuntimeError::QueueOverflow { .. }
            | RuntimeError::Invalid(_)
            | RuntimeError::Config(_)
            | RuntimeError::Capacity(_) => ErrorKind::Invalid,
            RuntimeError::Execution { .. }
            | RuntimeError::Storage(_)
            | RuntimeError::Dispatch(_) => ErrorKind::Execution,
            RuntimeError::Planning(_) => ErrorKind::Planning,
            RuntimeError::Routing(_) => ErrorKind::Routing,
            RuntimeError::Timeout(_) => ErrorKind::Timeout,
            RuntimeError::WorkerStopped(_) | RuntimeError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Build an execution error for the named action
    pub fn execution(action: impl Into<String>, message: impl Into<String>) -> Self {
        RuntimeError::Execution {
            action: action.into(),
            message: message.into(),
        }
    }
}

/// Error classes in ascending reporting precedence
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Bad input or configuration
    Invalid,
    /// Action or instruction failure
    Execution,
    /// Strategy or planning failure
    Planning,
    /// No matching route
    Routing,
    /// Bound exceeded
    Timeout,
    /// Unexpected or unclassified
    Internal,
}

impl ErrorKind {
    /// Stable lowercase name used in error signals
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Invalid => "invalid",
            ErrorKind::Execution => "execution",
            ErrorKind::Planning => "planning",
            ErrorKind::Routing => "routing",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Internal => "internal",
        }
    }
}

/// Several errors folded into one report, classed by the highest kind present
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorReport {
    /// Highest-precedence kind among the aggregated errors
    pub kind: ErrorKind,
    /// Rendered messages, in the order they occurred
    pub messages: Vec<String>,
}

impl ErrorReport {
    /// Aggregate errors; returns `None` for an empty input
    pub fn aggregate<'a, I>(errors: I) -> Option<Self>
    where
        I: IntoIterator<Item = &'a RuntimeError>,
    {
        let mut kind: Option<ErrorKind> = None;
        let mut messages = Vec::new();
        for error in errors {
            let k = error.kind();
            kind = Some(kind.map_or(k, |current| current.max(k)));
            messages.push(error.to_string());
        }
        kind.map(|kind| Self { kind, messages })
    }
}

/// Directive validation and effect errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DirectiveError {
    /// `Enqueue` without an action identifier
    #[error("Enqueue directive has no action")]
    InvalidAction,

    /// Action module does not resolve in the catalog
    #[error("Unknown action module '{0}'")]
    InvalidActionModule(String),

    /// Child constructor does not resolve in the catalog
    #[error("Unknown agent module '{0}'")]
    InvalidModule(String),

    /// Malformed kill target
    #[error("Invalid target '{0}'")]
    InvalidTarget(String),

    /// Kill target is not a live child
    #[error("Child '{0}' not found")]
    NotFound(String),

    /// Negative schedule delay
    #[error("Invalid delay {0}ms")]
    InvalidDelay(i64),

    /// Malformed signal
    #[error("Invalid signal: {0}")]
    InvalidSignal(String),

    /// A live child already holds this tag
    #[error("Child tag '{0}' already in use")]
    DuplicateTag(String),
}

/// Convenience result alias for directive operations
pub type DirectiveResult<T> = std::result::Result<T, DirectiveError>;

/// Storage-specific errors
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// Atomic write failed
    #[error("Atomic write failed for {path}: {detail}")]
    AtomicWriteFailed {
        /// Path where write failed
        path: PathBuf,
        /// Error details
        detail: String,
    },

    /// Stored record is not a valid agent state
    #[error("Corrupt record for '{id}': {detail}")]
    Corrupt {
        /// Agent identifier
        id: String,
        /// Decoding failure
        detail: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(String),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(String),
}

impl From<io::Error> for StorageError {
    fn from(err: io::Error) -> Self {
        StorageError::Io(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Json(err.to_string())
    }
}

/// Convenience result alias for storage operations
pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Outbound dispatch errors
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// No adapter registered for the requested kind
    #[error("No dispatcher registered for adapter '{0}'")]
    AdapterUnavailable(String),

    /// Adapter options are missing or malformed
    #[error("Bad options for adapter '{adapter}': {detail}")]
    BadOptions {
        /// Adapter name
        adapter: String,
        /// Error details
        detail: String,
    },

    /// The adapter accepted the signal but could not deliver it
    #[error("Delivery via '{adapter}' failed: {detail}")]
    DeliveryFailed {
        /// Adapter name
        adapter: String,
        /// Error details
        detail: String,
    },
}

/// Convenience result alias for dispatch operations
pub type DispatchResult<T> = std::result::Result<T, DispatchError>;

/// Result type using RuntimeError
pub type RuntimeResult<T> = std::result::Result<T, RuntimeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_precedence_order() {
        assert!(ErrorKind::Invalid < ErrorKind::Execution);
        assert!(ErrorKind::Execution < ErrorKind::Planning);
        assert!(ErrorKind::Planning < ErrorKind::Routing);
        assert!(ErrorKind::Routing < ErrorKind::Timeout);
        assert!(ErrorKind::Timeout < ErrorKind::Internal);
    }

    #[test]
    fn test_aggregate_picks_highest_kind() {
        let errors = vec![
            RuntimeError::execution("a", "boom"),
            RuntimeError::Routing("x.y".into()),
            RuntimeError::Invalid("bad".into()),
        ];
        let report = ErrorReport::aggregate(&errors).unwrap();
        assert_eq!(report.kind, ErrorKind::Routing);
        assert_eq!(report.messages.len(), 3);
        assert!(ErrorReport::aggregate(Vec::<RuntimeError>::new().iter()).is_none());
    }

    #[test]
    fn test_directive_errors_are_invalid() {
        let err: RuntimeError = DirectiveError::InvalidAction.into();
        assert_eq!(err.kind(), ErrorKind::Invalid);
        assert_eq!(RuntimeError::Timeout(10).kind(), ErrorKind::Timeout);
    }
}
