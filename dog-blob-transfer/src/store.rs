use async_trait::async_trait;

use crate::{
    AccessConditions, BlobProperties, BlockId, BlockResult, ByteRange, ByteStream,
    CustomerProvidedKey, ReplayableBody, TransferResult,
};

/// Wire operations the transfer engine needs from a blob service.
///
/// Implementations own HTTP transport, request signing, response parsing and
/// transport-level retry/backoff. Bodies are handed over as [`ReplayableBody`]
/// so a transport retry can resubscribe; every subscription rewinds the
/// attached progress unit. Service failures come back as
/// [`TransferError::service`](crate::TransferError::service) so that error
/// codes are classified consistently.
#[async_trait]
pub trait BlobService: Send + Sync {
    /// Read blob properties (HEAD)
    async fn get_properties(&self, key: &str, options: &ReadOptions) -> TransferResult<BlobProperties>;

    /// Write the whole blob in one request
    async fn put_blob(
        &self,
        key: &str,
        body: ReplayableBody,
        options: &WriteOptions,
    ) -> TransferResult<BlobProperties>;

    /// Stage one uncommitted block
    async fn stage_block(
        &self,
        key: &str,
        block_id: &BlockId,
        body: ReplayableBody,
        options: &WriteOptions,
    ) -> TransferResult<BlockResult>;

    /// Atomically replace the blob content with the listed staged blocks, in order
    async fn commit_block_list(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &WriteOptions,
    ) -> TransferResult<BlobProperties>;

    /// Create (or reset) a zero-filled page blob of `size` bytes
    async fn create_page_blob(
        &self,
        key: &str,
        size: u64,
        options: &WriteOptions,
    ) -> TransferResult<BlobProperties>;

    /// Write pages at `offset`; both offset and body length are page aligned
    async fn upload_pages(
        &self,
        key: &str,
        offset: u64,
        body: ReplayableBody,
        options: &WriteOptions,
    ) -> TransferResult<PageWriteResult>;

    /// Read the blob, or `range` of it
    async fn download(
        &self,
        key: &str,
        range: Option<ByteRange>,
        options: &ReadOptions,
    ) -> TransferResult<DownloadResponse>;
}

/// Per-request options for writes
#[derive(Debug, Clone, Default)]
pub struct WriteOptions {
    pub conditions: AccessConditions,
    pub customer_key: Option<CustomerProvidedKey>,
    pub content_type: Option<String>,
}

impl WriteOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conditions(mut self, conditions: AccessConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_customer_key(mut self, key: CustomerProvidedKey) -> Self {
        self.customer_key = Some(key);
        self
    }

    pub fn with_content_type<S: Into<String>>(mut self, content_type: S) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Same options without access conditions (used for staging and page writes)
    pub fn unconditional(&self) -> Self {
        Self {
            conditions: AccessConditions::default(),
            ..self.clone()
        }
    }
}

/// Per-request options for reads
#[derive(Debug, Clone, Default)]
pub struct ReadOptions {
    pub conditions: AccessConditions,
    pub customer_key: Option<CustomerProvidedKey>,
}

impl ReadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conditions(mut self, conditions: AccessConditions) -> Self {
        self.conditions = conditions;
        self
    }

    pub fn with_customer_key(mut self, key: Option<CustomerProvidedKey>) -> Self {
        self.customer_key = key;
        self
    }
}

/// Result of one page write
#[derive(Debug, Clone)]
pub struct PageWriteResult {
    pub etag: String,
    pub server_encrypted: bool,
    pub content_md5: Option<String>,
}

/// Byte range actually served, as reported by `Content-Range`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    /// Exclusive end
    pub end: u64,
    pub total_size: u64,
}

impl ContentRange {
    pub fn content_length(&self) -> u64 {
        self.end - self.start
    }
}

/// Response to a (ranged) GET
pub struct DownloadResponse {
    pub properties: BlobProperties,
    pub content_range: ContentRange,
    pub body: ByteStream,
}

impl std::fmt::Debug for DownloadResponse {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DownloadResponse")
            .field("properties", &self.properties)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}
