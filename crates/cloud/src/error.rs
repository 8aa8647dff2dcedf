//! Remote storage errors
//!
//! `CloudError` is what an object store returns for a failed request. It
//! carries the transport's error code, HTTP status, message and exception
//! name so the retry policy can classify it and the logs can show it.

use std::fmt;

use cumulus_core::{Error, ErrorClass};

use crate::retry::classify;

/// Transport-level error code
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloudErrorCode {
    /// The service reported an internal failure
    InternalFailure,
    /// The client could not identify the failure
    Unknown,
    /// Credentials rejected
    AccessDenied,
    /// Temporary credentials expired
    ExpiredToken,
    /// Request rate exceeded
    Throttling,
    /// Service temporarily unavailable
    ServiceUnavailable,
    /// Connection failed or was reset
    NetworkConnection,
    /// Request did not complete within the request timeout
    RequestTimeout,
    /// Object does not exist
    NoSuchKey,
    /// Bucket does not exist
    NoSuchBucket,
    /// Request was malformed
    InvalidArgument,
}

impl CloudErrorCode {
    /// Stable name used in logs and retryable-error lists
    pub fn name(&self) -> &'static str {
        match self {
            CloudErrorCode::InternalFailure => "InternalFailure",
            CloudErrorCode::Unknown => "Unknown",
            CloudErrorCode::AccessDenied => "AccessDenied",
            CloudErrorCode::ExpiredToken => "ExpiredToken",
            CloudErrorCode::Throttling => "Throttling",
            CloudErrorCode::ServiceUnavailable => "ServiceUnavailable",
            CloudErrorCode::NetworkConnection => "NetworkConnection",
            CloudErrorCode::RequestTimeout => "RequestTimeout",
            CloudErrorCode::NoSuchKey => "NoSuchKey",
            CloudErrorCode::NoSuchBucket => "NoSuchBucket",
            CloudErrorCode::InvalidArgument => "InvalidArgument",
        }
    }

    /// Default HTTP status for this code
    pub fn default_http_status(&self) -> u16 {
        match self {
            CloudErrorCode::InternalFailure | CloudErrorCode::Unknown => 500,
            CloudErrorCode::AccessDenied | CloudErrorCode::ExpiredToken => 403,
            CloudErrorCode::Throttling => 429,
            CloudErrorCode::ServiceUnavailable => 503,
            CloudErrorCode::NetworkConnection => 0,
            CloudErrorCode::RequestTimeout => 408,
            CloudErrorCode::NoSuchKey | CloudErrorCode::NoSuchBucket => 404,
            CloudErrorCode::InvalidArgument => 400,
        }
    }

    /// Whether the transport itself flags this code as retryable
    fn transport_retryable(&self) -> bool {
        matches!(
            self,
            CloudErrorCode::Throttling
                | CloudErrorCode::ServiceUnavailable
                | CloudErrorCode::NetworkConnection
                | CloudErrorCode::RequestTimeout
        )
    }
}

impl fmt::Display for CloudErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A failed remote request
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{exception} ({code}, http {http_status}): {message}")]
pub struct CloudError {
    /// Transport error code
    pub code: CloudErrorCode,
    /// HTTP status of the response, 0 if none was received
    pub http_status: u16,
    /// Human-readable message from the service
    pub message: String,
    /// Service exception name, e.g. "InternalError" or "SlowDown"
    pub exception: String,
    /// Transport hint that the request may be retried
    pub retryable: bool,
}

impl CloudError {
    /// Error with the code's default status and exception name
    pub fn new(code: CloudErrorCode, message: impl Into<String>) -> Self {
        CloudError {
            code,
            http_status: code.default_http_status(),
            message: message.into(),
            exception: code.name().to_string(),
            retryable: code.transport_retryable(),
        }
    }

    /// Object `key` was not found
    pub fn no_such_key(key: &str) -> Self {
        CloudError::new(CloudErrorCode::NoSuchKey, format!("object {} does not exist", key))
    }

    /// Bucket `bucket` was not found
    pub fn no_such_bucket(bucket: &str) -> Self {
        CloudError::new(
            CloudErrorCode::NoSuchBucket,
            format!("bucket {} does not exist", bucket),
        )
    }

    /// Override the HTTP status
    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = status;
        self
    }

    /// Override the exception name
    pub fn with_exception(mut self, exception: impl Into<String>) -> Self {
        self.exception = exception.into();
        self
    }

    /// Override the transport retry hint
    pub fn with_retryable(mut self, retryable: bool) -> Self {
        self.retryable = retryable;
        self
    }

    /// True if the object or bucket does not exist
    pub fn is_not_found(&self) -> bool {
        matches!(self.code, CloudErrorCode::NoSuchKey | CloudErrorCode::NoSuchBucket)
    }

    /// Classification assigned by the retry policy
    pub fn class(&self) -> ErrorClass {
        classify(self)
    }

    /// Final error after the retry loop gave up after `attempts` tries
    pub fn into_fatal(self, attempts: u32) -> Error {
        if self.is_not_found() {
            return Error::NotFound(self.to_string());
        }
        Error::IoFatal {
            class: classify(&self),
            attempts,
            message: self.to_string(),
        }
    }

    /// The retryable form seen inside the retry loop
    pub fn to_transient(&self) -> Error {
        Error::IoTransient {
            class: classify(self),
            message: self.to_string(),
        }
    }
}

impl From<std::io::Error> for CloudError {
    fn from(e: std::io::Error) -> Self {
        let code = match e.kind() {
            std::io::ErrorKind::NotFound => CloudErrorCode::NoSuchKey,
            std::io::ErrorKind::PermissionDenied => CloudErrorCode::AccessDenied,
            std::io::ErrorKind::TimedOut => CloudErrorCode::RequestTimeout,
            std::io::ErrorKind::Interrupted => CloudErrorCode::NetworkConnection,
            _ => CloudErrorCode::Unknown,
        };
        CloudError::new(code, e.to_string())
    }
}

impl From<CloudError> for Error {
    fn from(e: CloudError) -> Self {
        e.into_fatal(1)
    }
}
