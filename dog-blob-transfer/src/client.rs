use std::sync::Arc;

use futures_util::StreamExt;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

use crate::config::{DEFAULT_BLOCK_SIZE, MAX_PAGE_WRITE_SIZE};
use crate::coordinator::{BlockBlobTarget, BlockReader, CommitTarget, PageBlobTarget, TransferCoordinator, UploadSource};
use crate::download::{open_download, DownloadOptions};
use crate::error::{BLOB_NOT_FOUND, CUSTOMER_KEY_REQUIRED};
use crate::plan::{plan, plan_pages};
use crate::progress::{ProgressReceiver, ProgressTracker};
use crate::store::{ReadOptions, WriteOptions};
use crate::stream::{BlobInputStream, BlobOutputStream, OutputLimits};
use crate::{
    AccessConditions, BlobItem, BlobProperties, BlobService, CustomerProvidedKey, TransferConfig,
    TransferError, TransferResult,
};

/// Options for one upload. Unset sizing fields fall back to the client's [`TransferConfig`].
#[derive(Clone, Default)]
pub struct UploadOptions {
    /// Total size of a stream source, when the caller knows it
    pub size_hint: Option<u64>,

    /// Replace an existing blob. When false the upload fails with
    /// [`TransferError::Conflict`] if the blob exists.
    pub overwrite: bool,

    pub block_size: Option<u64>,
    pub max_concurrency: Option<usize>,
    pub max_single_upload_size: Option<u64>,

    pub progress: Option<Arc<dyn ProgressReceiver>>,
    pub customer_key: Option<CustomerProvidedKey>,
    pub content_type: Option<String>,
    pub cancellation: Option<CancellationToken>,
}

impl UploadOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_size_hint(mut self, size: u64) -> Self {
        self.size_hint = Some(size);
        self
    }

    pub fn with_overwrite(mut self, overwrite: bool) -> Self {
        self.overwrite = overwrite;
        self
    }

    pub fn with_block_size(mut self, bytes: u64) -> Self {
        self.block_size = Some(bytes);
        self
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = Some(max);
        self
    }

    pub fn with_max_single_upload_size(mut self, bytes: u64) -> Self {
        self.max_single_upload_size = Some(bytes);
        self
    }

    pub fn with_progress(mut self, receiver: Arc<dyn ProgressReceiver>) -> Self {
        self.progress = Some(receiver);
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

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancellation = Some(token);
        self
    }

    fn effective_config(&self, base: &TransferConfig) -> TransferResult<TransferConfig> {
        let mut config = base.clone();
        if let Some(size) = self.block_size {
            config = config.with_block_size(size);
        }
        if let Some(max) = self.max_concurrency {
            config = config.with_max_concurrency(max);
        }
        if let Some(size) = self.max_single_upload_size {
            config = config.with_max_single_upload_size(size);
        }
        config.validate()?;
        Ok(config)
    }

    fn write_options(&self) -> WriteOptions {
        let mut options = WriteOptions::new();
        if !self.overwrite {
            options = options.with_conditions(AccessConditions::if_not_exists());
        }
        if let Some(key) = &self.customer_key {
            options = options.with_customer_key(key.clone());
        }
        if let Some(content_type) = &self.content_type {
            options = options.with_content_type(content_type.clone());
        }
        options
    }

    fn tracker(&self, total_size: Option<u64>) -> Option<ProgressTracker> {
        self.progress
            .clone()
            .map(|receiver| ProgressTracker::new(receiver, total_size))
    }

    fn cancellation_token(&self) -> CancellationToken {
        self.cancellation.clone().unwrap_or_default()
    }
}

impl std::fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UploadOptions")
            .field("size_hint", &self.size_hint)
            .field("overwrite", &self.overwrite)
            .field("block_size", &self.block_size)
            .field("max_concurrency", &self.max_concurrency)
            .field("max_single_upload_size", &self.max_single_upload_size)
            .field("progress", &self.progress.is_some())
            .field("customer_key", &self.customer_key)
            .field("content_type", &self.content_type)
            .finish()
    }
}

/// Entry point for chunked uploads and resumable downloads against one blob service
pub struct BlobClient {
    service: Arc<dyn BlobService>,
    config: TransferConfig,
}

impl BlobClient {
    /// Create a client. Fails if `config` is inconsistent.
    pub fn new<S: BlobService + 'static>(service: S, config: TransferConfig) -> TransferResult<Self> {
        Self::from_arc(Arc::new(service), config)
    }

    /// Create a client over a shared service
    pub fn from_arc(service: Arc<dyn BlobService>, config: TransferConfig) -> TransferResult<Self> {
        config.validate()?;
        Ok(Self { service, config })
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    pub fn service(&self) -> &Arc<dyn BlobService> {
        &self.service
    }

    /// Whether `key` exists. A blob that refuses to answer without its
    /// customer-provided key still exists.
    pub async fn exists(&self, key: &str) -> TransferResult<bool> {
        match self.service.get_properties(key, &ReadOptions::new()).await {
            Ok(_) => Ok(true),
            Err(err) if err.error_code() == Some(BLOB_NOT_FOUND) => Ok(false),
            Err(err) if err.error_code() == Some(CUSTOMER_KEY_REQUIRED) => Ok(true),
            Err(err) => Err(err),
        }
    }

    pub async fn get_properties(
        &self,
        key: &str,
        customer_key: Option<CustomerProvidedKey>,
    ) -> TransferResult<BlobProperties> {
        let options = ReadOptions::new().with_customer_key(customer_key);
        self.service.get_properties(key, &options).await
    }

    /// Upload `source` as a block blob.
    ///
    /// Sources of known size are planned up front. Streams without a size
    /// hint are buffered up to the single-shot threshold; if they end there
    /// they go out in one request, otherwise they continue as an output stream.
    #[instrument(skip(self, source, options), fields(overwrite = options.overwrite))]
    pub async fn upload<S: Into<UploadSource>>(
        &self,
        key: &str,
        source: S,
        options: UploadOptions,
    ) -> TransferResult<BlobItem> {
        let config = options.effective_config(&self.config)?;
        let source = source.into();
        let target: Arc<dyn CommitTarget> = Arc::new(BlockBlobTarget::new(
            self.service.clone(),
            key,
            options.write_options(),
        ));

        let total_size = match source.known_len().or(options.size_hint) {
            Some(total) => total,
            None => return self.upload_unsized(key, source, target, &config, &options).await,
        };

        let plan = plan(total_size, &config)?;
        info!(
            total_size,
            single_shot = plan.is_single_shot(),
            blocks = plan.block_count(),
            block_size = plan.block_size(),
            "upload planned"
        );
        if !options.overwrite && !plan.is_single_shot() && self.exists(key).await? {
            return Err(TransferError::conflict(key));
        }

        TransferCoordinator::new(target)
            .with_progress(options.tracker(Some(total_size)))
            .with_cancellation(options.cancellation_token())
            .execute(source, &plan, config.max_concurrency)
            .await
    }

    async fn upload_unsized(
        &self,
        key: &str,
        source: UploadSource,
        target: Arc<dyn CommitTarget>,
        config: &TransferConfig,
        options: &UploadOptions,
    ) -> TransferResult<BlobItem> {
        let window = usize::try_from(config.max_single_upload_size.saturating_add(1))
            .map_err(|_| TransferError::configuration("single-shot threshold does not fit in memory"))?;
        let mut reader = BlockReader::new(source);
        let cancel = options.cancellation_token();
        let head = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            head = reader.read_up_to(window) => head?,
        };

        if (head.len() as u64) <= config.max_single_upload_size {
            let plan = plan(head.len() as u64, config)?;
            info!(total_size = head.len(), "unsized upload fits a single put");
            return TransferCoordinator::new(target)
                .with_progress(options.tracker(Some(head.len() as u64)))
                .with_cancellation(options.cancellation_token())
                .execute(UploadSource::Bytes(head), &plan, config.max_concurrency)
                .await;
        }

        if !options.overwrite && self.exists(key).await? {
            return Err(TransferError::conflict(key));
        }
        info!(buffered = head.len(), "unsized upload continues as an output stream");
        let mut out = self.output_stream(target, config, options);
        out.write(&head).await?;
        let chunk_size = output_block_size(config) as usize;
        loop {
            let chunk = out.race_source(reader.read_up_to(chunk_size)).await?;
            if chunk.is_empty() {
                break;
            }
            out.write(&chunk).await?;
        }
        out.close().await
    }

    /// Upload `source` as a page blob of `total_size` bytes.
    ///
    /// `options.block_size` sets the page write size (default 4 MiB). Both
    /// sizes must be multiples of 512.
    #[instrument(skip(self, source, options), fields(overwrite = options.overwrite))]
    pub async fn upload_pages<S: Into<UploadSource>>(
        &self,
        key: &str,
        source: S,
        total_size: u64,
        options: UploadOptions,
    ) -> TransferResult<BlobItem> {
        let write_size = options.block_size.unwrap_or(MAX_PAGE_WRITE_SIZE);
        let plan = plan_pages(total_size, write_size)?;
        let config = options.effective_config(&self.config)?;
        let source = source.into();
        if let Some(len) = source.known_len() {
            if len != total_size {
                return Err(TransferError::configuration(format!(
                    "source holds {} bytes but the page blob is declared as {} bytes",
                    len, total_size
                )));
            }
        }
        if !options.overwrite && self.exists(key).await? {
            return Err(TransferError::conflict(key));
        }

        let write = options.write_options();
        self.service.create_page_blob(key, total_size, &write).await?;
        info!(total_size, writes = plan.block_count(), "page blob created");

        let target = Arc::new(PageBlobTarget::new(self.service.clone(), key, write.unconditional()));
        TransferCoordinator::new(target)
            .with_progress(options.tracker(Some(total_size)))
            .with_cancellation(options.cancellation_token())
            .execute(source, &plan, config.max_concurrency)
            .await
    }

    /// Open a buffered write handle. With `overwrite` unset the blob must not exist yet.
    pub async fn open_output_stream(&self, key: &str, options: UploadOptions) -> TransferResult<BlobOutputStream> {
        let config = options.effective_config(&self.config)?;
        if !options.overwrite && self.exists(key).await? {
            return Err(TransferError::conflict(key));
        }
        let target = Arc::new(BlockBlobTarget::new(
            self.service.clone(),
            key,
            options.write_options(),
        ));
        Ok(self.output_stream(target, &config, &options))
    }

    /// Start a resumable download
    pub async fn download(&self, key: &str, options: DownloadOptions) -> TransferResult<BlobInputStream> {
        open_download(self.service.clone(), key, options, self.config.download_retry).await
    }

    /// Download into `writer`. Returns the properties of the version read.
    pub async fn download_to<W>(
        &self,
        key: &str,
        writer: &mut W,
        options: DownloadOptions,
    ) -> TransferResult<BlobProperties>
    where
        W: AsyncWrite + Unpin + Send,
    {
        let mut stream = self.download(key, options).await?;
        let properties = stream.properties().clone();
        while let Some(chunk) = stream.next().await {
            writer.write_all(&chunk?).await?;
        }
        writer.flush().await?;
        Ok(properties)
    }

    fn output_stream(
        &self,
        target: Arc<dyn CommitTarget>,
        config: &TransferConfig,
        options: &UploadOptions,
    ) -> BlobOutputStream {
        let limits = OutputLimits {
            block_size: output_block_size(config),
            max_single_upload_size: config.max_single_upload_size,
            max_block_count: config.max_block_count,
            max_concurrency: config.max_concurrency,
        };
        BlobOutputStream::new(target, limits, options.tracker(None), options.cancellation_token())
    }
}

/// Block size when the total is not known up front
fn output_block_size(config: &TransferConfig) -> u64 {
    config.block_size.unwrap_or(DEFAULT_BLOCK_SIZE)
}
