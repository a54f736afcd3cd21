use crate::{TransferError, TransferResult};

const MIB: u64 = 1024 * 1024;

/// Block size used when the caller doesn't pick one
pub const DEFAULT_BLOCK_SIZE: u64 = 4 * MIB;

/// Largest payload sent as a single request by default
pub const DEFAULT_MAX_SINGLE_UPLOAD_SIZE: u64 = 256 * MIB;

/// Block transfers in flight per upload by default
pub const DEFAULT_MAX_CONCURRENCY: usize = 8;

/// Maximum number of committed blocks in a block blob
pub const MAX_BLOCK_COUNT: u32 = 10_000;

/// Page blobs are written in 512-byte pages
pub const PAGE_SIZE: u64 = 512;

/// Largest single page write
pub const MAX_PAGE_WRITE_SIZE: u64 = 4 * MIB;

/// Service API version; determines block and single-shot ceilings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(non_camel_case_types)]
pub enum ServiceVersion {
    V2016_05_31,
    #[default]
    V2019_12_12,
}

impl ServiceVersion {
    /// Largest block the service accepts in one stage call
    pub fn max_block_size(&self) -> u64 {
        match self {
            Self::V2016_05_31 => 100 * MIB,
            Self::V2019_12_12 => 4000 * MIB,
        }
    }

    /// Largest payload the service accepts in one put
    pub fn max_single_upload_size(&self) -> u64 {
        match self {
            Self::V2016_05_31 => 256 * MIB,
            Self::V2019_12_12 => 5000 * MIB,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::V2016_05_31 => "2016-05-31",
            Self::V2019_12_12 => "2019-12-12",
        }
    }
}

/// Application-level resume policy for downloads
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DownloadRetryOptions {
    /// Ranged re-requests allowed per download (not per chunk)
    pub max_retry_requests: u32,
}

impl Default for DownloadRetryOptions {
    fn default() -> Self {
        Self {
            max_retry_requests: 5,
        }
    }
}

/// Configuration for transfers. Immutable once handed to a client.
#[derive(Debug, Clone)]
pub struct TransferConfig {
    /// Fixed block size. `None` picks one from the payload size.
    pub block_size: Option<u64>,

    /// Payloads up to this size go out as one request
    pub max_single_upload_size: u64,

    /// Upper bound on concurrent block transfers
    pub max_concurrency: usize,

    /// Upper bound on blocks per blob
    pub max_block_count: u32,

    /// API version the service speaks
    pub service_version: ServiceVersion,

    /// Resume policy for downloads
    pub download_retry: DownloadRetryOptions,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            block_size: None,
            max_single_upload_size: DEFAULT_MAX_SINGLE_UPLOAD_SIZE,
            max_concurrency: DEFAULT_MAX_CONCURRENCY,
            max_block_count: MAX_BLOCK_COUNT,
            service_version: ServiceVersion::default(),
            download_retry: DownloadRetryOptions::default(),
        }
    }
}

impl TransferConfig {
    /// Create a new config with defaults
    pub fn new() -> Self {
        Self::default()
    }

    /// Load overrides from `{PREFIX}__BLOCK_SIZE`, `{PREFIX}__MAX_CONCURRENCY`,
    /// `{PREFIX}__MAX_SINGLE_UPLOAD_SIZE` and `{PREFIX}__MAX_RETRY_REQUESTS`.
    pub fn from_env(prefix: &str) -> TransferResult<Self> {
        Self::from_lookup(prefix, |key| std::env::var(key).ok())
    }

    fn from_lookup<F>(prefix: &str, lookup: F) -> TransferResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();
        let key = |name: &str| format!("{}__{}", prefix, name);

        if let Some(v) = lookup(&key("BLOCK_SIZE")) {
            config.block_size = Some(parse_var(&key("BLOCK_SIZE"), &v)?);
        }
        if let Some(v) = lookup(&key("MAX_CONCURRENCY")) {
            config.max_concurrency = parse_var(&key("MAX_CONCURRENCY"), &v)?;
        }
        if let Some(v) = lookup(&key("MAX_SINGLE_UPLOAD_SIZE")) {
            config.max_single_upload_size = parse_var(&key("MAX_SINGLE_UPLOAD_SIZE"), &v)?;
        }
        if let Some(v) = lookup(&key("MAX_RETRY_REQUESTS")) {
            config.download_retry.max_retry_requests = parse_var(&key("MAX_RETRY_REQUESTS"), &v)?;
        }

        config.validate()?;
        Ok(config)
    }

    /// Set a fixed block size
    pub fn with_block_size(mut self, bytes: u64) -> Self {
        self.block_size = Some(bytes);
        self
    }

    /// Set the single-shot threshold
    pub fn with_max_single_upload_size(mut self, bytes: u64) -> Self {
        self.max_single_upload_size = bytes;
        self
    }

    /// Set max concurrent block transfers
    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    /// Set max blocks per blob
    pub fn with_max_block_count(mut self, max: u32) -> Self {
        self.max_block_count = max;
        self
    }

    /// Target a specific service version
    pub fn with_service_version(mut self, version: ServiceVersion) -> Self {
        self.service_version = version;
        self
    }

    /// Set download retry budget
    pub fn with_max_retry_requests(mut self, max: u32) -> Self {
        self.download_retry.max_retry_requests = max;
        self
    }

    /// Check that the values make sense for the configured service version
    pub fn validate(&self) -> TransferResult<()> {
        if self.max_concurrency == 0 {
            return Err(TransferError::configuration("max_concurrency must be at least 1"));
        }
        if self.max_block_count == 0 {
            return Err(TransferError::configuration("max_block_count must be at least 1"));
        }
        if let Some(block_size) = self.block_size {
            if block_size == 0 {
                return Err(TransferError::configuration("block_size must be at least 1 byte"));
            }
            let max = self.service_version.max_block_size();
            if block_size > max {
                return Err(TransferError::configuration(format!(
                    "block_size {} exceeds the {} maximum of {}",
                    block_size,
                    self.service_version.as_str(),
                    max
                )));
            }
        }
        let ceiling = self.service_version.max_single_upload_size();
        if self.max_single_upload_size > ceiling {
            return Err(TransferError::configuration(format!(
                "max_single_upload_size {} exceeds the {} maximum of {}",
                self.max_single_upload_size,
                self.service_version.as_str(),
                ceiling
            )));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(key: &str, value: &str) -> TransferResult<T> {
    value
        .trim()
        .parse()
        .map_err(|_| TransferError::configuration(format!("{} has invalid value {:?}", key, value)))
}
