//! Error types for Cumulus
//!
//! This module defines the error hierarchy used throughout the system.
//! We use `thiserror` for automatic `Display` and `Error` trait implementations.
//!
//! Absent keys are not errors: reads return `Ok(None)`. A commit conflict is
//! `Error::Busy`, an ordinary outcome that callers are expected to handle by
//! re-running the whole transaction.

use std::fmt;
use std::io;
use thiserror::Error;

use crate::types::SequenceNumber;

/// Result type alias for Cumulus operations
pub type Result<T> = std::result::Result<T, Error>;

/// Classification of a remote-storage failure
///
/// Assigned by the retry policy when it inspects a remote error. Kept on
/// fatal errors so the caller can tell a credential problem from an
/// exhausted internal-failure budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    /// Access denied or expired credential; refreshing credentials may fix it
    TransientAuth,
    /// Internal server error or an explicit "try again" response
    TransientInternal,
    /// Anything else
    Other,
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorClass::TransientAuth => write!(f, "transient-auth"),
            ErrorClass::TransientInternal => write!(f, "transient-internal"),
            ErrorClass::Other => write!(f, "other"),
        }
    }
}

/// Error types for Cumulus
#[derive(Debug, Error)]
pub enum Error {
    /// Local filesystem error
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A named file, object or checkpoint does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Commit-time conflict with an already committed writer
    #[error("Busy: {0}")]
    Busy(String),

    /// Remote storage hiccup that the retry policy considers retryable
    #[error("Transient remote I/O error ({class}): {message}")]
    IoTransient {
        /// Classification assigned by the retry policy
        class: ErrorClass,
        /// Underlying remote error message
        message: String,
    },

    /// Remote storage error outside the retryable classes, or retry budget exhausted
    #[error("Remote I/O error ({class}) after {attempts} attempt(s): {message}")]
    IoFatal {
        /// Classification assigned by the retry policy
        class: ErrorClass,
        /// Number of attempts made before giving up
        attempts: u32,
        /// Underlying remote error message
        message: String,
    },

    /// On-disk or manifest invariant violated
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// Feature unavailable in the current build or configuration
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Caller supplied an invalid option or argument
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// Operation not valid in the current state (e.g. transaction already committed)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Checkpoint destination has no terminal marker
    #[error("Checkpoint incomplete: {0}")]
    CheckpointIncomplete(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// The batch was applied at `sequence` but the savepoint a sync write
    /// asked for failed
    ///
    /// The write is visible and must not be re-applied; it is lost on
    /// reopen unless a later savepoint succeeds.
    #[error("Committed at {sequence} but not durable: {source}")]
    NotDurable {
        /// Sequence the batch was applied at
        sequence: SequenceNumber,
        /// Why the savepoint failed
        source: Box<Error>,
    },
}

impl Error {
    /// True for commit conflicts
    pub fn is_busy(&self) -> bool {
        matches!(self, Error::Busy(_))
    }

    /// Alias of [`Error::is_busy`]: the transaction lost a commit race
    pub fn is_conflict(&self) -> bool {
        self.is_busy()
    }

    /// True for errors the remote retry loop may retry
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::IoTransient { .. })
    }

    /// True for structural inconsistencies that must never be retried
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_))
    }

    /// True if the named entity does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    /// Sequence of a batch that was applied despite the error
    pub fn applied_sequence(&self) -> Option<SequenceNumber> {
        match self {
            Error::NotDurable { sequence, .. } => Some(*sequence),
            _ => None,
        }
    }

    /// Classification of a remote error, if this is one
    pub fn class(&self) -> Option<ErrorClass> {
        match self {
            Error::IoTransient { class, .. } | Error::IoFatal { class, .. } => Some(*class),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_busy() {
        let err = Error::Busy("key \"abc\" changed".to_string());
        let msg = err.to_string();
        assert!(msg.contains("Busy"));
        assert!(msg.contains("abc"));
    }

    #[test]
    fn test_error_display_fatal_keeps_context() {
        let err = Error::IoFatal {
            class: ErrorClass::TransientInternal,
            attempts: 11,
            message: "We encountered an internal error".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("transient-internal"));
        assert!(msg.contains("11 attempt"));
        assert!(msg.contains("internal error"));
    }

    #[test]
    fn test_error_from_io() {
        let io_err = io::Error::new(io::ErrorKind::PermissionDenied, "access denied");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn test_predicates() {
        assert!(Error::Busy(String::new()).is_busy());
        assert!(Error::Busy(String::new()).is_conflict());
        assert!(Error::Corruption(String::new()).is_corruption());
        assert!(Error::NotFound(String::new()).is_not_found());
        assert!(Error::IoTransient {
            class: ErrorClass::TransientAuth,
            message: String::new(),
        }
        .is_retryable());
        assert!(!Error::IoFatal {
            class: ErrorClass::Other,
            attempts: 1,
            message: String::new(),
        }
        .is_retryable());
    }

    #[test]
    fn test_not_durable_keeps_sequence_and_cause() {
        let err = Error::NotDurable {
            sequence: SequenceNumber::new(7),
            source: Box::new(Error::Io(io::Error::new(io::ErrorKind::Other, "disk full"))),
        };
        assert_eq!(err.applied_sequence(), Some(SequenceNumber::new(7)));
        assert!(!err.is_retryable());
        assert!(!err.is_busy());
        let msg = err.to_string();
        assert!(msg.contains("#7"));
        assert!(msg.contains("disk full"));
        assert!(std::error::Error::source(&err).is_some());
        assert_eq!(Error::Busy(String::new()).applied_sequence(), None);
    }

    #[test]
    fn test_class_accessor() {
        let err = Error::IoFatal {
            class: ErrorClass::TransientAuth,
            attempts: 3,
            message: "ExpiredToken".to_string(),
        };
        assert_eq!(err.class(), Some(ErrorClass::TransientAuth));
        assert_eq!(Error::Busy(String::new()).class(), None);
    }
}
