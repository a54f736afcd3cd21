//! Resumable downloads.
//!
//! A download is driven by one sequential loop that owns a
//! [`DownloadCursor`]. When the response body fails with a retryable error
//! the loop re-requests exactly the bytes it has not yet delivered, pinned to
//! the etag of the first response, until the retry budget runs out.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use tracing::{debug, info, instrument, warn};

use crate::progress::{ProgressReceiver, ProgressTracker};
use crate::store::{DownloadResponse, ReadOptions};
use crate::stream::BlobInputStream;
use crate::{
    AccessConditions, BlobService, ByteRange, ByteStream, CustomerProvidedKey, DownloadRetryOptions,
    TransferError, TransferResult,
};

/// Position of an in-flight download.
///
/// `offset + remaining` always equals the end of the requested range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadCursor {
    offset: u64,
    remaining: u64,
    etag: String,
    last_modified: DateTime<Utc>,
}

impl DownloadCursor {
    /// Cursor at the start of `response`
    pub fn from_response(response: &DownloadResponse) -> Self {
        Self {
            offset: response.content_range.start,
            remaining: response.content_range.content_length(),
            etag: response.properties.etag.clone(),
            last_modified: response.properties.last_modified,
        }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn remaining(&self) -> u64 {
        self.remaining
    }

    pub fn etag(&self) -> &str {
        &self.etag
    }

    pub fn last_modified(&self) -> DateTime<Utc> {
        self.last_modified
    }

    /// Account for `len` delivered bytes
    pub fn advance(&mut self, len: u64) {
        let len = len.min(self.remaining);
        self.offset += len;
        self.remaining -= len;
    }

    /// Range covering everything not yet delivered
    pub fn resume_range(&self) -> ByteRange {
        ByteRange::with_count(self.offset, self.remaining)
    }

    pub fn is_complete(&self) -> bool {
        self.remaining == 0
    }
}

/// Options for a single download
#[derive(Clone)]
pub struct DownloadOptions {
    /// Part of the blob to read; `None` reads all of it
    pub range: Option<ByteRange>,

    /// Resume only while the blob keeps the etag of the first response.
    /// Without it a resume may splice bytes from a newer version.
    pub consistency_check: bool,

    pub customer_key: Option<CustomerProvidedKey>,

    /// Overrides the client's resume policy
    pub retry: Option<DownloadRetryOptions>,

    pub progress: Option<Arc<dyn ProgressReceiver>>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            range: None,
            consistency_check: true,
            customer_key: None,
            retry: None,
            progress: None,
        }
    }
}

impl DownloadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_range(mut self, range: ByteRange) -> Self {
        self.range = Some(range);
        self
    }

    pub fn with_consistency_check(mut self, enabled: bool) -> Self {
        self.consistency_check = enabled;
        self
    }

    pub fn with_customer_key(mut self, key: CustomerProvidedKey) -> Self {
        self.customer_key = Some(key);
        self
    }

    pub fn with_retry(mut self, retry: DownloadRetryOptions) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_progress(mut self, receiver: Arc<dyn ProgressReceiver>) -> Self {
        self.progress = Some(receiver);
        self
    }
}

impl std::fmt::Debug for DownloadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadOptions")
            .field("range", &self.range)
            .field("consistency_check", &self.consistency_check)
            .field("customer_key", &self.customer_key)
            .field("retry", &self.retry)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

enum CursorState {
    Streaming(ByteStream),
    Failed(TransferError),
    Retrying,
    Complete,
    Fatal(TransferError),
}

/// Issue the initial request and wrap its body in the resume loop.
///
/// Failures of the initial request are returned as they are; only failures
/// after the first byte of the response is available are resumed.
#[instrument(skip(service, options, default_retry), fields(range = ?options.range))]
pub(crate) async fn open_download(
    service: Arc<dyn BlobService>,
    key: &str,
    options: DownloadOptions,
    default_retry: DownloadRetryOptions,
) -> TransferResult<BlobInputStream> {
    let read = ReadOptions::new().with_customer_key(options.customer_key.clone());
    let response = service.download(key, options.range, &read).await?;
    let cursor = DownloadCursor::from_response(&response);
    debug!(offset = cursor.offset(), length = cursor.remaining(), etag = %cursor.etag(), "download opened");

    let properties = response.properties.clone();
    let content_range = response.content_range;
    let progress = options
        .progress
        .clone()
        .map(|receiver| ProgressTracker::sequential(receiver, Some(cursor.remaining())));

    let retry = options.retry.unwrap_or(default_retry);
    let consistency_check = options.consistency_check;
    let key = key.to_string();

    let stream = async_stream::stream! {
        let mut cursor = cursor;
        let mut attempts = 0u32;
        let mut state = CursorState::Streaming(response.body);

        loop {
            state = match state {
                CursorState::Streaming(mut body) => match body.next().await {
                    Some(Ok(chunk)) => {
                        let chunk = if chunk.len() as u64 > cursor.remaining() {
                            chunk.slice(..cursor.remaining() as usize)
                        } else {
                            chunk
                        };
                        if !chunk.is_empty() {
                            cursor.advance(chunk.len() as u64);
                            if let Some(unit) = &progress {
                                unit.advance(chunk.len() as u64);
                            }
                            yield Ok(chunk);
                        }
                        if cursor.is_complete() {
                            CursorState::Complete
                        } else {
                            CursorState::Streaming(body)
                        }
                    }
                    Some(Err(err)) => CursorState::Failed(TransferError::from(err)),
                    None if cursor.is_complete() => CursorState::Complete,
                    None => CursorState::Failed(TransferError::transient(format!(
                        "response body ended with {} bytes outstanding",
                        cursor.remaining()
                    ))),
                },
                CursorState::Failed(err) => {
                    if err.is_retryable() && attempts < retry.max_retry_requests {
                        warn!(
                            offset = cursor.offset(),
                            remaining = cursor.remaining(),
                            attempt = attempts + 1,
                            error = %err,
                            "download interrupted, resuming"
                        );
                        CursorState::Retrying
                    } else {
                        CursorState::Fatal(err)
                    }
                }
                CursorState::Retrying => {
                    attempts += 1;
                    let mut resume = read.clone();
                    if consistency_check {
                        resume = resume.with_conditions(AccessConditions::if_match(cursor.etag()));
                    }
                    match service.download(&key, Some(cursor.resume_range()), &resume).await {
                        Ok(response) if consistency_check && response.properties.etag != cursor.etag() => {
                            CursorState::Fatal(TransferError::precondition_failed(format!(
                                "etag changed from {} to {}",
                                cursor.etag(),
                                response.properties.etag
                            )))
                        }
                        Ok(response) if response.content_range.start != cursor.offset() => {
                            CursorState::Fatal(TransferError::service(
                                416,
                                "InvalidRange",
                                format!(
                                    "resume served offset {} instead of {}",
                                    response.content_range.start,
                                    cursor.offset()
                                ),
                            ))
                        }
                        Ok(response) => CursorState::Streaming(response.body),
                        Err(err) => CursorState::Failed(err),
                    }
                }
                CursorState::Complete => {
                    info!(bytes = cursor.offset(), retries = attempts, "download complete");
                    break;
                }
                CursorState::Fatal(err) => {
                    warn!(
                        offset = cursor.offset(),
                        remaining = cursor.remaining(),
                        attempts,
                        error = %err,
                        "download aborted"
                    );
                    yield Err(TransferError::DownloadAborted {
                        offset: cursor.offset(),
                        remaining: cursor.remaining(),
                        attempts,
                        source: Box::new(err),
                    });
                    break;
                }
            };
        }
    };

    Ok(BlobInputStream::new(properties, content_range, Box::pin(stream)))
}
