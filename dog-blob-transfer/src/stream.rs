//! Stream adapters over the transfer engine.
//!
//! [`BlobOutputStream`] turns sequential writes into staged blocks and a
//! final commit. [`BlobInputStream`] is the byte stream of a resumable
//! download.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::{Bytes, BytesMut};
use futures_core::Stream;
use futures_util::StreamExt;
use tokio_util::io::StreamReader;
use tracing::{debug, info};

use crate::coordinator::{BlockDispatcher, CommitTarget};
use crate::plan::Block;
use crate::progress::ProgressTracker;
use crate::store::ContentRange;
use crate::{BlobItem, BlobProperties, BlockId, ReplayableBody, TransferError, TransferResult};

/// Sizing for an output stream
#[derive(Debug, Clone, Copy)]
pub(crate) struct OutputLimits {
    pub block_size: u64,
    pub max_single_upload_size: u64,
    pub max_block_count: u32,
    pub max_concurrency: usize,
}

enum OutputState {
    Open,
    Closed(BlobItem),
    Failed(TransferError),
}

/// Buffered write handle for one blob.
///
/// Nothing reaches the service until the buffer outgrows the single-shot
/// threshold or [`flush`](Self::flush) is called. From then on every full
/// block is staged as soon as it is buffered. [`close`](Self::close) publishes
/// the content; calling it again returns the first outcome without touching
/// the service.
pub struct BlobOutputStream {
    target: Arc<dyn CommitTarget>,
    dispatcher: Option<BlockDispatcher>,
    limits: OutputLimits,
    buffer: BytesMut,
    /// Offset of the first buffered byte
    offset: u64,
    progress: Option<ProgressTracker>,
    state: OutputState,
}

impl BlobOutputStream {
    pub(crate) fn new(
        target: Arc<dyn CommitTarget>,
        limits: OutputLimits,
        progress: Option<ProgressTracker>,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Self {
        let dispatcher = BlockDispatcher::new(target.clone(), limits.max_concurrency)
            .with_progress(progress.clone())
            .with_cancellation(cancel);
        Self {
            target,
            dispatcher: Some(dispatcher),
            limits,
            buffer: BytesMut::new(),
            offset: 0,
            progress,
            state: OutputState::Open,
        }
    }

    /// Bytes accepted so far
    pub fn position(&self) -> u64 {
        self.offset + self.buffer.len() as u64
    }

    /// Bytes accepted but not yet handed to a block transfer
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_closed(&self) -> bool {
        !matches!(self.state, OutputState::Open)
    }

    /// Buffer `data`, staging every block that fills up
    pub async fn write(&mut self, data: &[u8]) -> TransferResult<()> {
        self.ensure_open()?;
        self.buffer.extend_from_slice(data);
        if self.in_block_mode() {
            let result = self.stage_full_blocks().await;
            self.poison_on_error(result)?;
        }
        Ok(())
    }

    /// Stage whatever is buffered and wait for every staged block
    pub async fn flush(&mut self) -> TransferResult<()> {
        self.ensure_open()?;
        let result = self.flush_inner().await;
        self.poison_on_error(result)
    }

    /// Commit the blob. Idempotent: later calls return the stored outcome.
    pub async fn close(&mut self) -> TransferResult<BlobItem> {
        match &self.state {
            OutputState::Closed(item) => return Ok(item.clone()),
            OutputState::Failed(err) => return Err(err.clone()),
            OutputState::Open => {}
        }
        let result = self.commit().await;
        self.state = match &result {
            Ok(item) => OutputState::Closed(item.clone()),
            Err(err) => OutputState::Failed(err.clone()),
        };
        result
    }

    /// Await the next piece of input while the staged blocks stay watched.
    /// A failure here poisons the stream like a failed write.
    pub(crate) async fn race_source<T, F>(&mut self, source: F) -> TransferResult<T>
    where
        F: Future<Output = TransferResult<T>>,
    {
        self.ensure_open()?;
        let result = match self.dispatcher.as_mut() {
            Some(dispatcher) => dispatcher.race_source(source).await,
            None => Err(TransferError::StreamClosed),
        };
        if let Err(err) = &result {
            self.state = OutputState::Failed(err.clone());
        }
        result
    }

    fn ensure_open(&self) -> TransferResult<()> {
        match &self.state {
            OutputState::Open => Ok(()),
            OutputState::Closed(_) => Err(TransferError::StreamClosed),
            OutputState::Failed(err) => Err(err.clone()),
        }
    }

    fn poison_on_error(&mut self, result: TransferResult<()>) -> TransferResult<()> {
        if let Err(err) = &result {
            self.state = OutputState::Failed(err.clone());
        }
        result
    }

    fn dispatched(&self) -> usize {
        self.dispatcher.as_ref().map_or(0, |d| d.dispatched())
    }

    fn in_block_mode(&self) -> bool {
        self.dispatched() > 0 || self.buffer.len() as u64 > self.limits.max_single_upload_size
    }

    async fn stage_full_blocks(&mut self) -> TransferResult<()> {
        let block_size = self.limits.block_size as usize;
        while self.buffer.len() >= block_size {
            self.stage(block_size).await?;
        }
        Ok(())
    }

    async fn flush_inner(&mut self) -> TransferResult<()> {
        self.stage_full_blocks().await?;
        if !self.buffer.is_empty() {
            let len = self.buffer.len();
            self.stage(len).await?;
        }
        match self.dispatcher.as_mut() {
            Some(dispatcher) => dispatcher.drain().await,
            None => Err(TransferError::StreamClosed),
        }
    }

    async fn stage(&mut self, len: usize) -> TransferResult<()> {
        if self.dispatched() >= self.limits.max_block_count as usize {
            return Err(TransferError::configuration(format!(
                "blob would need more than {} blocks of {} bytes",
                self.limits.max_block_count, self.limits.block_size
            )));
        }
        let data = self.buffer.split_to(len).freeze();
        let block = Block {
            id: BlockId::new(),
            offset: self.offset,
            length: len as u32,
        };
        self.offset += len as u64;
        match self.dispatcher.as_mut() {
            Some(dispatcher) => dispatcher.submit(block, data).await,
            None => Err(TransferError::StreamClosed),
        }
    }

    async fn commit(&mut self) -> TransferResult<BlobItem> {
        if !self.in_block_mode() {
            let data = self.buffer.split().freeze();
            let mut body = ReplayableBody::new(data);
            if let Some(tracker) = &self.progress {
                body = body.with_progress(tracker.unit());
            }
            debug!(size = body.len(), "closing output stream with a single put");
            self.dispatcher = None;
            return self.target.put_whole(body).await;
        }

        self.flush_inner().await?;
        let dispatcher = self.dispatcher.take().ok_or(TransferError::StreamClosed)?;
        let (blocks, results) = dispatcher.finish().await?;
        let item = self.target.commit(&blocks, results).await?;
        info!(blocks = blocks.len(), size = self.offset, "output stream committed");
        Ok(item)
    }
}

impl std::fmt::Debug for BlobOutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobOutputStream")
            .field("position", &self.position())
            .field("buffered", &self.buffer.len())
            .field("dispatched", &self.dispatched())
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// Upper bound on what `read_to_end` reserves before the first chunk arrives
const READ_TO_END_PREALLOC: u64 = 8 * 1024 * 1024;

/// Byte stream of a download that resumes itself after transient failures
pub type ResumableStream = Pin<Box<dyn Stream<Item = TransferResult<Bytes>> + Send>>;

/// Readable side of a download
pub struct BlobInputStream {
    properties: BlobProperties,
    content_range: ContentRange,
    inner: ResumableStream,
}

impl BlobInputStream {
    pub(crate) fn new(properties: BlobProperties, content_range: ContentRange, inner: ResumableStream) -> Self {
        Self {
            properties,
            content_range,
            inner,
        }
    }

    /// Properties from the initial response
    pub fn properties(&self) -> &BlobProperties {
        &self.properties
    }

    /// Range being delivered
    pub fn content_range(&self) -> ContentRange {
        self.content_range
    }

    /// Read everything that is left
    pub async fn read_to_end(mut self) -> TransferResult<Bytes> {
        let expected = self.content_range.content_length().min(READ_TO_END_PREALLOC);
        let mut data = BytesMut::with_capacity(expected as usize);
        while let Some(chunk) = self.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data.freeze())
    }

    /// View as `AsyncRead`. Errors surface as `std::io::Error` wrapping the [`TransferError`].
    pub fn into_async_read(self) -> StreamReader<Self, Bytes> {
        StreamReader::new(self)
    }
}

impl Stream for BlobInputStream {
    type Item = TransferResult<Bytes>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.inner.as_mut().poll_next(cx)
    }
}

impl std::fmt::Debug for BlobInputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobInputStream")
            .field("properties", &self.properties)
            .field("content_range", &self.content_range)
            .finish_non_exhaustive()
    }
}
