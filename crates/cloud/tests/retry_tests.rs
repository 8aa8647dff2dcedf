//! Retry behavior against a misbehaving object store
//!
//! A `FlakyStore` wraps a real store and fails a scripted number of calls
//! with a chosen error before letting requests through.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use cumulus_cloud::{
    BackoffPolicy, CloudConfig, CloudError, CloudErrorCode, CloudRetryStrategy,
    ExponentialBackoff, MemoryObjectStore, ObjectMeta, ObjectStore, RetryingClient,
};
use cumulus_core::{Error, ErrorClass};
use tracing::field::{Field, Visit};
use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer, SubscriberExt};

// ============================================================================
// Test Helpers
// ============================================================================

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

/// One event seen by `CaptureLayer`
#[derive(Debug)]
struct Captured {
    level: Level,
    fields: HashMap<String, String>,
}

impl Captured {
    fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

/// Layer that keeps every event it sees
#[derive(Clone, Default)]
struct CaptureLayer {
    events: Arc<Mutex<Vec<Captured>>>,
}

impl CaptureLayer {
    fn take(&self) -> Vec<Captured> {
        std::mem::take(&mut *self.events.lock().unwrap())
    }
}

struct FieldMap<'a>(&'a mut HashMap<String, String>);

impl Visit for FieldMap<'_> {
    fn record_str(&mut self, field: &Field, value: &str) {
        self.0.insert(field.name().to_string(), value.to_string());
    }

    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        self.0.insert(field.name().to_string(), format!("{:?}", value));
    }
}

impl<S: Subscriber> Layer<S> for CaptureLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let mut fields = HashMap::new();
        event.record(&mut FieldMap(&mut fields));
        self.events.lock().unwrap().push(Captured {
            level: *event.metadata().level(),
            fields,
        });
    }
}

/// Run `f` with events on this thread going to a fresh `CaptureLayer`
fn capture<T>(f: impl FnOnce() -> T) -> (T, Vec<Captured>) {
    let layer = CaptureLayer::default();
    let subscriber = tracing_subscriber::registry().with(layer.clone());
    let out = tracing::subscriber::with_default(subscriber, f);
    (out, layer.take())
}

/// The single decision event `should_retry` logs
fn decision_event(events: Vec<Captured>) -> Captured {
    let mut decisions: Vec<_> = events
        .into_iter()
        .filter(|e| e.fields.contains_key("attempt"))
        .collect();
    assert_eq!(decisions.len(), 1, "unexpected events {:?}", decisions);
    decisions.remove(0)
}

struct FlakyStore {
    inner: MemoryObjectStore,
    failures_left: AtomicU32,
    error: CloudError,
    calls: AtomicU32,
}

impl FlakyStore {
    fn new(failures: u32, error: CloudError) -> Self {
        let inner = MemoryObjectStore::new();
        inner.create_bucket("bucket").unwrap();
        FlakyStore {
            inner,
            failures_left: AtomicU32::new(failures),
            error,
            calls: AtomicU32::new(0),
        }
    }

    fn gate(&self) -> Result<(), CloudError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0
            && self
                .failures_left
                .compare_exchange(left, left - 1, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            return Err(self.error.clone());
        }
        Ok(())
    }
}

impl ObjectStore for FlakyStore {
    fn create_bucket(&self, bucket: &str) -> Result<(), CloudError> {
        self.inner.create_bucket(bucket)
    }

    fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> Result<(), CloudError> {
        self.gate()?;
        self.inner.put_object(bucket, key, data)
    }

    fn get_object(&self, bucket: &str, key: &str) -> Result<Vec<u8>, CloudError> {
        self.gate()?;
        self.inner.get_object(bucket, key)
    }

    fn head_object(&self, bucket: &str, key: &str) -> Result<ObjectMeta, CloudError> {
        self.gate()?;
        self.inner.head_object(bucket, key)
    }

    fn list_objects(&self, bucket: &str, prefix: &str) -> Result<Vec<ObjectMeta>, CloudError> {
        self.gate()?;
        self.inner.list_objects(bucket, prefix)
    }

    fn delete_object(&self, bucket: &str, key: &str) -> Result<(), CloudError> {
        self.gate()?;
        self.inner.delete_object(bucket, key)
    }
}

fn fast_policy(limit: u32) -> Arc<dyn BackoffPolicy> {
    Arc::new(CloudRetryStrategy::new(
        Arc::new(
            ExponentialBackoff::new()
                .without_jitter()
                .with_scale_factor(Duration::from_micros(10)),
        ),
        limit,
    ))
}

// ============================================================================
// Tests
// ============================================================================

#[test]
fn test_try_again_message_is_retried() {
    init_tracing();
    let store = Arc::new(FlakyStore::new(
        5,
        CloudError::new(CloudErrorCode::Throttling, "Reduce your request rate and try again")
            .with_retryable(false)
            .with_exception("SlowDown")
            .with_http_status(503),
    ));
    let client = RetryingClient::new(store.clone(), fast_policy(10));

    client.put_object("bucket", "k", b"v").unwrap();
    assert_eq!(store.calls.load(Ordering::SeqCst), 6);
    assert_eq!(store.inner.get_object("bucket", "k").unwrap(), b"v");
}

#[test]
fn test_exhaustion_reports_attempts_and_class() {
    init_tracing();
    let store = Arc::new(FlakyStore::new(
        u32::MAX,
        CloudError::new(CloudErrorCode::Unknown, "connection reset"),
    ));
    let client = RetryingClient::new(store.clone(), fast_policy(2));

    let err = client.get_object("bucket", "k").unwrap_err();
    match err {
        Error::IoFatal {
            class,
            attempts,
            message,
        } => {
            assert_eq!(class, ErrorClass::TransientInternal);
            assert_eq!(attempts, 4);
            assert!(message.contains("connection reset"));
        }
        other => panic!("unexpected {:?}", other),
    }
    assert_eq!(store.calls.load(Ordering::SeqCst), 4);
}

#[test]
fn test_from_config_uses_internal_limit() {
    init_tracing();
    let config = CloudConfig::default().with_internal_failure_limit(0);
    let store = Arc::new(FlakyStore::new(
        u32::MAX,
        CloudError::new(CloudErrorCode::InternalFailure, "boom"),
    ));
    let client = RetryingClient::from_config(store.clone(), &config);

    // Limit 0: the first failure (attempt 0) is retried, the second is not
    assert!(client.delete_object("bucket", "k").is_err());
    assert_eq!(store.calls.load(Ordering::SeqCst), 2);
}

#[test]
fn test_parallel_uploads_share_flaky_store() {
    init_tracing();
    const THREADS: usize = 8;
    let store = Arc::new(FlakyStore::new(
        THREADS as u32,
        CloudError::new(CloudErrorCode::InternalFailure, "busy"),
    ));
    let client = RetryingClient::new(store.clone(), fast_policy(10));
    let barrier = Arc::new(Barrier::new(THREADS));

    let handles: Vec<_> = (0..THREADS)
        .map(|i| {
            let client = client.clone();
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                client.put_object("bucket", &format!("obj-{}", i), &[i as u8])
            })
        })
        .collect();

    for h in handles {
        h.join().unwrap().unwrap();
    }
    assert_eq!(store.inner.object_count("bucket"), THREADS);
    assert_eq!(store.calls.load(Ordering::SeqCst), 2 * THREADS as u32);
}

#[test]
fn test_internal_failure_decision_logged_at_info() {
    let strategy = CloudRetryStrategy::new(Arc::new(ExponentialBackoff::new()), 4);
    let error = CloudError::new(CloudErrorCode::InternalFailure, "We encountered an internal error")
        .with_exception("InternalError")
        .with_http_status(500);

    let (retry, events) = capture(|| strategy.should_retry(&error, 2));
    assert!(retry);
    let event = decision_event(events);
    assert_eq!(event.level, Level::INFO);
    assert_eq!(event.field("attempt"), Some("2"));
    assert_eq!(event.field("limit"), Some("4"));
    assert_eq!(event.field("http_status"), Some("500"));
    assert_eq!(event.field("exception"), Some("InternalError"));
    assert_eq!(
        event.field("error_message"),
        Some("We encountered an internal error")
    );
    assert_eq!(
        event.field("message"),
        Some("Encountered retriable failure, retrying")
    );

    let (retry, events) = capture(|| strategy.should_retry(&error, 5));
    assert!(!retry);
    let event = decision_event(events);
    assert_eq!(event.level, Level::INFO);
    assert_eq!(event.field("attempt"), Some("5"));
    assert_eq!(
        event.field("message"),
        Some("Encountered retriable failure, retry budget exhausted")
    );
}

#[test]
fn test_delegated_decision_logged_at_warn() {
    let strategy = CloudRetryStrategy::new(Arc::new(ExponentialBackoff::new()), 4);
    for error in [
        CloudError::new(CloudErrorCode::AccessDenied, "denied").with_http_status(403),
        CloudError::new(CloudErrorCode::InvalidArgument, "bad").with_http_status(400),
    ] {
        let (_, events) = capture(|| strategy.should_retry(&error, 1));
        let event = decision_event(events);
        assert_eq!(event.level, Level::WARN, "{:?}", error);
        assert_eq!(event.field("attempt"), Some("1"));
        assert_eq!(event.field("limit"), Some("4"));
        assert_eq!(
            event.field("http_status"),
            Some(error.http_status.to_string().as_str())
        );
        assert_eq!(
            event.field("message"),
            Some("Encountered remote failure, using default retry policy")
        );
    }
}
