//! Retrying object store client
//!
//! Every remote request made by the engine goes through `RetryingClient`,
//! which re-issues failed requests as long as the retry policy allows and
//! turns the final failure into `Error::IoFatal` with the attempt count and
//! the classification of the last error.

use std::sync::Arc;
use std::thread;

use cumulus_core::{Error, Result};
use tracing::{debug, error};

use crate::config::CloudConfig;
use crate::error::CloudError;
use crate::object_store::{ObjectMeta, ObjectStore};
use crate::retry::{BackoffPolicy, CloudRetryStrategy, ExponentialBackoff};

/// Object store client that retries under a `BackoffPolicy`
#[derive(Clone)]
pub struct RetryingClient {
    store: Arc<dyn ObjectStore>,
    policy: Arc<dyn BackoffPolicy>,
}

impl RetryingClient {
    /// Client over `store` using `policy`
    pub fn new(store: Arc<dyn ObjectStore>, policy: Arc<dyn BackoffPolicy>) -> Self {
        RetryingClient { store, policy }
    }

    /// Client using the cloud retry strategy configured by `config`
    pub fn from_config(store: Arc<dyn ObjectStore>, config: &CloudConfig) -> Self {
        let strategy = CloudRetryStrategy::new(
            Arc::new(ExponentialBackoff::default()),
            config.internal_failure_limit,
        );
        RetryingClient::new(store, Arc::new(strategy))
    }

    /// The underlying store
    pub fn store(&self) -> &Arc<dyn ObjectStore> {
        &self.store
    }

    /// The retry policy
    pub fn policy(&self) -> &Arc<dyn BackoffPolicy> {
        &self.policy
    }

    /// Run `request` until it succeeds or the policy gives up
    ///
    /// Sleeps between attempts on the calling thread; callers must not hold
    /// locks across this call.
    pub fn execute<T>(
        &self,
        operation: &str,
        mut request: impl FnMut(&dyn ObjectStore) -> std::result::Result<T, CloudError>,
    ) -> Result<T> {
        let mut attempt: u32 = 0;
        loop {
            let e = match request(self.store.as_ref()) {
                Ok(value) => return Ok(value),
                Err(e) => e,
            };
            let failure = self.failure(operation, &e, attempt);
            if !failure.is_retryable() {
                return Err(failure);
            }
            let delay = self.policy.calculate_delay(&e, attempt);
            debug!(
                operation,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %failure,
                "Retrying remote request"
            );
            if !delay.is_zero() {
                thread::sleep(delay);
            }
            attempt += 1;
        }
    }

    /// Outcome of one failed attempt
    ///
    /// `Error::IoTransient` when the policy retries `error` at `attempt`,
    /// otherwise the final error for the caller.
    fn failure(&self, operation: &str, error: &CloudError, attempt: u32) -> Error {
        if error.is_not_found() {
            return error.clone().into_fatal(attempt + 1);
        }
        if self.policy.should_retry(error, attempt) {
            return error.to_transient();
        }
        error!(
            operation,
            attempts = attempt + 1,
            class = %error.class(),
            error = %error,
            "Remote request failed"
        );
        error.clone().into_fatal(attempt + 1)
    }

    /// Create `bucket` if missing
    pub fn create_bucket(&self, bucket: &str) -> Result<()> {
        self.execute("create_bucket", |s| s.create_bucket(bucket))
    }

    /// Upload an object
    pub fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<()> {
        self.execute("put_object", |s| s.put_object(bucket, key, data))
    }

    /// Download an object
    pub fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>> {
        self.execute("get_object", |s| s.get_object(bucket, key))
    }

    /// Object metadata
    pub fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta> {
        self.execute("head_object", |s| s.head_object(bucket, key))
    }

    /// List objects under `prefix`
    pub fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>> {
        self.execute("list_objects", |s| s.list_objects(bucket, prefix))
    }

    /// Delete an object
    pub fn delete_object(&self, bucket: &str, key: &str) -> Result<()> {
        self.execute("delete_object", |s| s.delete_object(bucket, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CloudErrorCode;
    use crate::object_store::MemoryObjectStore;
    use cumulus_core::ErrorClass;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn fast_strategy(limit: u32) -> Arc<dyn BackoffPolicy> {
        Arc::new(CloudRetryStrategy::new(
            Arc::new(
                ExponentialBackoff::new()
                    .without_jitter()
                    .with_scale_factor(Duration::from_micros(1)),
            ),
            limit,
        ))
    }

    fn client(limit: u32) -> RetryingClient {
        let store = Arc::new(MemoryObjectStore::new());
        RetryingClient::new(store, fast_strategy(limit))
    }

    #[test]
    fn test_succeeds_after_transient_failures() {
        let client = client(10);
        let calls = AtomicU32::new(0);
        let out = client
            .execute("op", |_| {
                if calls.fetch_add(1, Ordering::SeqCst) < 3 {
                    Err(CloudError::new(CloudErrorCode::InternalFailure, "boom"))
                } else {
                    Ok(7)
                }
            })
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn test_internal_budget_exhaustion_is_fatal() {
        let client = client(10);
        let calls = AtomicU32::new(0);
        let err = client
            .execute::<()>("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CloudError::new(CloudErrorCode::InternalFailure, "boom"))
            })
            .unwrap_err();

        // Attempts 0..=10 retried, attempt 11 refused
        assert_eq!(calls.load(Ordering::SeqCst), 12);
        match err {
            Error::IoFatal { class, attempts, .. } => {
                assert_eq!(class, ErrorClass::TransientInternal);
                assert_eq!(attempts, 12);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_non_retryable_fails_immediately() {
        let client = client(10);
        let calls = AtomicU32::new(0);
        let err = client
            .execute::<()>("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CloudError::new(CloudErrorCode::InvalidArgument, "bad"))
            })
            .unwrap_err();
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(err.class(), Some(ErrorClass::Other));
    }

    #[test]
    fn test_auth_errors_follow_default_budget() {
        let client = client(10);
        let calls = AtomicU32::new(0);
        let err = client
            .execute::<()>("op", |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(CloudError::new(CloudErrorCode::ExpiredToken, "expired"))
            })
            .unwrap_err();
        // Default policy retries attempts 0..10
        assert_eq!(calls.load(Ordering::SeqCst), 11);
        assert_eq!(err.class(), Some(ErrorClass::TransientAuth));
    }

    #[test]
    fn test_not_found_is_not_retried() {
        let client = client(10);
        client.create_bucket("b").unwrap();
        let err = client.get_object("b", "missing").unwrap_err();
        assert!(err.is_not_found());
    }

    #[test]
    fn test_object_roundtrip_through_client() {
        let client = client(10);
        client.create_bucket("b").unwrap();
        client.put_object("b", "p/k", b"data").unwrap();
        assert_eq!(client.get_object("b", "p/k").unwrap(), b"data");
        assert_eq!(client.head_object("b", "p/k").unwrap().size, 4);
        assert_eq!(client.list_objects("b", "p/").unwrap().len(), 1);
        client.delete_object("b", "p/k").unwrap();
        assert!(client.list_objects("b", "p/").unwrap().is_empty());
    }

    #[test]
    fn test_failure_is_transient_until_budget_spent() {
        let client = client(2);
        let internal = CloudError::new(CloudErrorCode::InternalFailure, "boom");

        for attempt in 0..=2 {
            let failure = client.failure("op", &internal, attempt);
            assert!(failure.is_retryable(), "attempt {}: {:?}", attempt, failure);
            assert_eq!(failure.class(), Some(ErrorClass::TransientInternal));
        }
        match client.failure("op", &internal, 3) {
            Error::IoFatal { class, attempts, .. } => {
                assert_eq!(class, ErrorClass::TransientInternal);
                assert_eq!(attempts, 4);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_failure_for_missing_object_is_not_found() {
        let client = client(10);
        let failure = client.failure("op", &CloudError::no_such_key("b/k"), 0);
        assert!(failure.is_not_found());
        assert!(!failure.is_retryable());
    }
}
