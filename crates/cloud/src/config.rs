//! Cloud configuration
//!
//! Bucket locations, credentials and client timeouts. Everything here is an
//! immutable value handed to the database at construction; nothing reads
//! process-wide state except the explicit `from_env` helpers.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use cumulus_core::{Error, Result};

use crate::retry::DEFAULT_INTERNAL_FAILURE_LIMIT;

/// Region used when neither the bucket nor `AWS_DEFAULT_REGION` names one
pub const DEFAULT_REGION: &str = "us-west-2";

/// Location of a database inside an object store
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketOptions {
    /// Bucket name
    pub bucket_name: String,
    /// Object key prefix; every object lives under `<path_prefix>/`
    pub path_prefix: String,
    /// Bucket region; empty means "resolve from the environment"
    pub region: String,
}

impl BucketOptions {
    /// Bucket location
    pub fn new(
        bucket_name: impl Into<String>,
        path_prefix: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        BucketOptions {
            bucket_name: bucket_name.into(),
            path_prefix: path_prefix.into(),
            region: region.into(),
        }
    }

    /// Bucket named `prefix` + `suffix`
    ///
    /// Bucket names are global, so deployments share a prefix and append a
    /// per-user or per-environment suffix.
    pub fn with_prefix(
        prefix: &str,
        suffix: &str,
        path_prefix: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        BucketOptions::new(format!("{}{}", prefix, suffix), path_prefix, region)
    }

    /// True if a bucket is named
    pub fn is_valid(&self) -> bool {
        !self.bucket_name.is_empty()
    }

    /// Full object key for `name` under the path prefix
    pub fn object_key(&self, name: &str) -> String {
        let prefix = self.path_prefix.trim_matches('/');
        if prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    /// Region, falling back to `fallback` when unset
    pub fn region_or<'a>(&'a self, fallback: &'a str) -> &'a str {
        if self.region.is_empty() {
            fallback
        } else {
            &self.region
        }
    }
}

impl fmt::Display for BucketOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.bucket_name, self.path_prefix.trim_matches('/'))
    }
}

/// Options for one `checkpoint_to_cloud` call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointToCloudOptions {
    /// Run a savepoint before taking the manifest cut
    pub flush_before_checkpoint: bool,
    /// Maximum concurrent uploads
    pub thread_count: usize,
}

impl Default for CheckpointToCloudOptions {
    fn default() -> Self {
        CheckpointToCloudOptions {
            flush_before_checkpoint: true,
            thread_count: 8,
        }
    }
}

impl CheckpointToCloudOptions {
    /// Set whether to flush first
    pub fn with_flush(mut self, flush: bool) -> Self {
        self.flush_before_checkpoint = flush;
        self
    }

    /// Set upload parallelism
    pub fn with_thread_count(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    /// Reject a zero thread count
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(Error::InvalidArgument(
                "checkpoint thread_count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// How the client obtains credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AccessType {
    /// Not chosen; resolved from the other credential fields
    #[default]
    Undefined,
    /// Explicit access key id and secret
    Simple,
    /// Instance metadata service
    Instance,
    /// `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
    Environment,
    /// Shared config/profile file
    Config,
    /// No credentials
    Anonymous,
    /// Container task role (rejected)
    TaskRole,
}

impl FromStr for AccessType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "undefined" => Ok(AccessType::Undefined),
            "simple" => Ok(AccessType::Simple),
            "instance" | "EC2" => Ok(AccessType::Instance),
            "environment" => Ok(AccessType::Environment),
            "config" => Ok(AccessType::Config),
            "anonymous" => Ok(AccessType::Anonymous),
            "task_role" => Ok(AccessType::TaskRole),
            other => Err(Error::InvalidArgument(format!("unknown access type {}", other))),
        }
    }
}

/// Credentials for the object store client
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// Requested access type
    pub access_type: AccessType,
    /// Access key id for `Simple`
    pub access_key_id: String,
    /// Secret key for `Simple`
    pub secret_key: String,
    /// Profile file for `Config`
    pub config_file: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("access_type", &self.access_type)
            .field("access_key_id", &self.access_key_id)
            .field("secret_key", &"<redacted>")
            .field("config_file", &self.config_file)
            .finish()
    }
}

impl Credentials {
    /// Explicit key pair
    pub fn simple(access_key_id: impl Into<String>, secret_key: impl Into<String>) -> Self {
        Credentials {
            access_type: AccessType::Simple,
            access_key_id: access_key_id.into(),
            secret_key: secret_key.into(),
            config_file: String::new(),
        }
    }

    /// Profile file
    pub fn config(config_file: impl Into<String>) -> Self {
        Credentials {
            access_type: AccessType::Config,
            config_file: config_file.into(),
            ..Default::default()
        }
    }

    /// No credentials
    pub fn anonymous() -> Self {
        Credentials {
            access_type: AccessType::Anonymous,
            ..Default::default()
        }
    }

    /// Simple credentials from `AWS_ACCESS_KEY_ID` / `AWS_SECRET_ACCESS_KEY`
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Simple credentials read through `lookup`
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        Credentials::simple(
            lookup("AWS_ACCESS_KEY_ID").unwrap_or_default(),
            lookup("AWS_SECRET_ACCESS_KEY").unwrap_or_default(),
        )
    }

    /// Effective access type, resolving `Undefined` from the other fields
    pub fn effective_access_type(&self, lookup: impl Fn(&str) -> Option<String>) -> AccessType {
        if self.access_type != AccessType::Undefined {
            self.access_type
        } else if !self.config_file.is_empty() {
            AccessType::Config
        } else if !self.access_key_id.is_empty() || !self.secret_key.is_empty() {
            AccessType::Simple
        } else if lookup("AWS_ACCESS_KEY_ID").is_some() && lookup("AWS_SECRET_ACCESS_KEY").is_some()
        {
            AccessType::Environment
        } else {
            AccessType::Undefined
        }
    }

    /// Validate against the process environment
    pub fn check(&self) -> Result<()> {
        self.check_with(|name| std::env::var(name).ok())
    }

    /// Validate, reading environment variables through `lookup`
    ///
    /// `Simple` needs both halves of the key pair, each either set here or
    /// in the environment. `TaskRole` is not supported.
    pub fn check_with(&self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        match self.effective_access_type(&lookup) {
            AccessType::Simple => {
                let has_id = !self.access_key_id.is_empty() || lookup("AWS_ACCESS_KEY_ID").is_some();
                let has_secret =
                    !self.secret_key.is_empty() || lookup("AWS_SECRET_ACCESS_KEY").is_some();
                if !has_id || !has_secret {
                    return Err(Error::InvalidArgument(
                        "credentials require both access key id and secret key".to_string(),
                    ));
                }
                Ok(())
            }
            AccessType::TaskRole => Err(Error::InvalidArgument(
                "task role access is not supported".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

/// Settings handed to the transport client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Region requests are sent to
    pub region: String,
    /// Connection establishment timeout
    pub connect_timeout: Duration,
    /// Whole-request timeout
    pub request_timeout: Duration,
}

/// Remote storage configuration for a database
#[derive(Debug, Clone)]
pub struct CloudConfig {
    /// Where an existing database is read from
    pub source: BucketOptions,
    /// Where checkpoints are written
    pub destination: BucketOptions,
    /// Client credentials
    pub credentials: Credentials,
    /// Request timeout override in milliseconds; 0 keeps the default
    pub request_timeout_ms: u64,
    /// Retries allowed for internal failures
    pub internal_failure_limit: u32,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            source: BucketOptions::default(),
            destination: BucketOptions::default(),
            credentials: Credentials::default(),
            request_timeout_ms: 0,
            internal_failure_limit: DEFAULT_INTERNAL_FAILURE_LIMIT,
        }
    }
}

impl CloudConfig {
    /// Default connect timeout
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
    /// Default request timeout
    pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(600);

    /// Same bucket as source and destination
    pub fn new(bucket: BucketOptions) -> Self {
        CloudConfig {
            source: bucket.clone(),
            destination: bucket,
            ..Default::default()
        }
    }

    /// Set credentials
    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    /// Set the source bucket
    pub fn with_source(mut self, source: BucketOptions) -> Self {
        self.source = source;
        self
    }

    /// Set the destination bucket
    pub fn with_destination(mut self, destination: BucketOptions) -> Self {
        self.destination = destination;
        self
    }

    /// Set the request timeout override
    pub fn with_request_timeout_ms(mut self, ms: u64) -> Self {
        self.request_timeout_ms = ms;
        self
    }

    /// Set the internal-failure retry budget
    pub fn with_internal_failure_limit(mut self, limit: u32) -> Self {
        self.internal_failure_limit = limit;
        self
    }

    /// True if source and destination name the same location
    pub fn same_bucket(&self) -> bool {
        self.source.is_valid() && self.destination.is_valid() && self.source == self.destination
    }

    /// Fill empty bucket regions from the process environment
    pub fn prepare(self) -> Self {
        self.prepare_with(|name| std::env::var(name).ok())
    }

    /// Fill empty bucket regions from `AWS_DEFAULT_REGION` read through
    /// `lookup`, else `DEFAULT_REGION`
    pub fn prepare_with(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if self.source.region.is_empty() || self.destination.region.is_empty() {
            let region = lookup("AWS_DEFAULT_REGION")
                .filter(|r| !r.is_empty())
                .unwrap_or_else(|| DEFAULT_REGION.to_string());
            if self.source.region.is_empty() {
                self.source.region = region.clone();
            }
            if self.destination.region.is_empty() {
                self.destination.region = region;
            }
        }
        self
    }

    /// Client settings for requests against `bucket`
    pub fn client_config(&self, bucket: &BucketOptions) -> ClientConfig {
        let request_timeout = if self.request_timeout_ms != 0 {
            Duration::from_millis(self.request_timeout_ms)
        } else {
            Self::REQUEST_TIMEOUT
        };
        ClientConfig {
            region: bucket.region_or(DEFAULT_REGION).to_string(),
            connect_timeout: Self::CONNECT_TIMEOUT,
            request_timeout,
        }
    }

    /// Validate buckets and credentials
    pub fn validate(&self) -> Result<()> {
        if !self.source.is_valid() && !self.destination.is_valid() {
            return Err(Error::InvalidArgument(
                "cloud config names neither a source nor a destination bucket".to_string(),
            ));
        }
        self.credentials.check()
    }
}
