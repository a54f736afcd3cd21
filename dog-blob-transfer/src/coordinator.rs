use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures_util::{FutureExt, StreamExt};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::plan::{Block, TransferPlan};
use crate::progress::ProgressTracker;
use crate::receipt::UploadInfo;
use crate::store::{ReadOptions, WriteOptions};
use crate::{BlobItem, BlobService, BlockResult, ByteStream, ReplayableBody, TransferError, TransferResult};

/// Where transferred blocks land and how they are made visible.
///
/// Block blobs stage blocks and publish them with one commit. Page blobs
/// write ranges in place, so their commit only reads back the final state.
#[async_trait]
pub trait CommitTarget: Send + Sync + 'static {
    /// Transfer one block
    async fn transfer(&self, block: &Block, body: ReplayableBody) -> TransferResult<BlockResult>;

    /// Make the transferred blocks the blob content. `blocks` and `results` are in plan order.
    async fn commit(&self, blocks: &[Block], results: Vec<BlockResult>) -> TransferResult<BlobItem>;

    /// Write the whole payload with one request
    async fn put_whole(&self, body: ReplayableBody) -> TransferResult<BlobItem>;
}

/// Block blob: stage blocks, then commit the block list
pub struct BlockBlobTarget {
    service: Arc<dyn BlobService>,
    key: String,
    options: WriteOptions,
}

impl BlockBlobTarget {
    /// Access conditions in `options` apply to the final write only
    pub fn new<K: Into<String>>(service: Arc<dyn BlobService>, key: K, options: WriteOptions) -> Self {
        Self {
            service,
            key: key.into(),
            options,
        }
    }
}

#[async_trait]
impl CommitTarget for BlockBlobTarget {
    async fn transfer(&self, block: &Block, body: ReplayableBody) -> TransferResult<BlockResult> {
        self.service
            .stage_block(&self.key, &block.id, body, &self.options.unconditional())
            .await
    }

    async fn commit(&self, blocks: &[Block], _results: Vec<BlockResult>) -> TransferResult<BlobItem> {
        let ids: Vec<_> = blocks.iter().map(|b| b.id.clone()).collect();
        let size_bytes = blocks.iter().map(|b| b.length as u64).sum();
        let properties = self
            .service
            .commit_block_list(&self.key, &ids, &self.options)
            .await?;
        Ok(properties.to_item(UploadInfo::Blocks {
            block_count: blocks.len() as u32,
            size_bytes,
        }))
    }

    async fn put_whole(&self, body: ReplayableBody) -> TransferResult<BlobItem> {
        let size_bytes = body.len();
        let properties = self.service.put_blob(&self.key, body, &self.options).await?;
        Ok(properties.to_item(UploadInfo::Single { size_bytes }))
    }
}

/// Page blob: each block is a page write at its own offset.
/// The blob must already exist with its final size.
pub struct PageBlobTarget {
    service: Arc<dyn BlobService>,
    key: String,
    options: WriteOptions,
}

impl PageBlobTarget {
    pub fn new<K: Into<String>>(service: Arc<dyn BlobService>, key: K, options: WriteOptions) -> Self {
        Self {
            service,
            key: key.into(),
            options,
        }
    }
}

#[async_trait]
impl CommitTarget for PageBlobTarget {
    async fn transfer(&self, block: &Block, body: ReplayableBody) -> TransferResult<BlockResult> {
        let written = self
            .service
            .upload_pages(&self.key, block.offset, body, &self.options.unconditional())
            .await?;
        let mut result = BlockResult::staged(block.id.clone())
            .with_etag(written.etag)
            .with_server_encrypted(written.server_encrypted)
            .committed();
        if let Some(md5) = written.content_md5 {
            result = result.with_content_md5(md5);
        }
        Ok(result)
    }

    async fn commit(&self, blocks: &[Block], _results: Vec<BlockResult>) -> TransferResult<BlobItem> {
        let read = ReadOptions::new().with_customer_key(self.options.customer_key.clone());
        let properties = self.service.get_properties(&self.key, &read).await?;
        Ok(properties.to_item(UploadInfo::Pages {
            write_count: blocks.len() as u32,
            size_bytes: properties.content_length,
        }))
    }

    async fn put_whole(&self, _body: ReplayableBody) -> TransferResult<BlobItem> {
        Err(TransferError::configuration(
            "page blobs are written with page writes, not a single put",
        ))
    }
}

/// Bounded pool of in-flight block transfers.
///
/// At most `max_concurrency` transfers run at once; submitting past the
/// bound waits for one to finish. The first failure aborts everything
/// still running and is returned wrapped with the failing block. Results
/// are kept by plan position, not completion order.
pub struct BlockDispatcher {
    target: Arc<dyn CommitTarget>,
    tasks: JoinSet<(usize, TransferResult<BlockResult>)>,
    blocks: Vec<Block>,
    results: Vec<Option<BlockResult>>,
    max_concurrency: usize,
    progress: Option<ProgressTracker>,
    cancel: CancellationToken,
}

impl BlockDispatcher {
    pub fn new(target: Arc<dyn CommitTarget>, max_concurrency: usize) -> Self {
        Self {
            target,
            tasks: JoinSet::new(),
            blocks: Vec::new(),
            results: Vec::new(),
            max_concurrency: max_concurrency.max(1),
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Give every block its own progress unit on `tracker`
    pub fn with_progress(mut self, tracker: Option<ProgressTracker>) -> Self {
        self.progress = tracker;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Blocks submitted so far
    pub fn dispatched(&self) -> usize {
        self.blocks.len()
    }

    pub fn in_flight(&self) -> usize {
        self.tasks.len()
    }

    /// Start transferring `block`, waiting for a free slot first
    pub async fn submit(&mut self, block: Block, data: Bytes) -> TransferResult<()> {
        while let Some(joined) = self.tasks.try_join_next() {
            if let Err(err) = self.settle(joined) {
                return Err(self.fail(err).await);
            }
        }
        while self.tasks.len() >= self.max_concurrency {
            self.reap_one().await?;
        }
        if self.cancel.is_cancelled() {
            return Err(self.fail(TransferError::Cancelled).await);
        }

        let index = self.blocks.len();
        let mut body = ReplayableBody::new(data);
        if let Some(tracker) = &self.progress {
            body = body.with_progress(tracker.unit());
        }
        debug!(block_id = %block.id, offset = block.offset, length = block.length, "dispatching block");

        let target = self.target.clone();
        let task_block = block.clone();
        self.blocks.push(block);
        self.results.push(None);
        self.tasks.spawn(async move {
            let result = AssertUnwindSafe(target.transfer(&task_block, body))
                .catch_unwind()
                .await
                .unwrap_or_else(|panic| Err(panicked(panic)));
            (index, result)
        });
        Ok(())
    }

    /// Await `source` while watching the transfers already in flight.
    ///
    /// A stalled source still sees cancellation and the first block
    /// failure. Either one, or a source error, aborts everything in flight.
    pub async fn race_source<T, F>(&mut self, source: F) -> TransferResult<T>
    where
        F: Future<Output = TransferResult<T>>,
    {
        tokio::pin!(source);
        let cancel = self.cancel.clone();
        loop {
            let idle = self.tasks.is_empty();
            let event = tokio::select! {
                biased;
                _ = cancel.cancelled() => SourceEvent::Cancelled,
                Some(joined) = self.tasks.join_next(), if !idle => SourceEvent::Joined(joined),
                read = &mut source => SourceEvent::Read(read),
            };
            match event {
                SourceEvent::Cancelled => return Err(self.fail(TransferError::Cancelled).await),
                SourceEvent::Joined(joined) => {
                    if let Err(err) = self.settle(joined) {
                        return Err(self.fail(err).await);
                    }
                }
                SourceEvent::Read(Ok(value)) => return Ok(value),
                SourceEvent::Read(Err(err)) => return Err(self.fail(err).await),
            }
        }
    }

    /// Wait until nothing is in flight
    pub async fn drain(&mut self) -> TransferResult<()> {
        while self.reap_one().await? {}
        Ok(())
    }

    /// Wait for every dispatched block. Returns blocks and results in plan order.
    pub async fn finish(mut self) -> TransferResult<(Vec<Block>, Vec<BlockResult>)> {
        self.drain().await?;
        let mut results = Vec::with_capacity(self.results.len());
        for (block, result) in self.blocks.iter().zip(self.results.drain(..)) {
            let result = result.ok_or_else(|| {
                TransferError::configuration(format!("block {} finished without a result", block.id))
            })?;
            results.push(result);
        }
        Ok((self.blocks, results))
    }

    /// Abort everything in flight and wait for the tasks to wind down
    pub async fn abort(&mut self) {
        self.tasks.abort_all();
        while self.tasks.join_next().await.is_some() {}
    }

    /// Wait for one transfer. `Ok(false)` once nothing is left.
    async fn reap_one(&mut self) -> TransferResult<bool> {
        let cancel = self.cancel.clone();
        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => None,
            joined = self.tasks.join_next() => Some(joined),
        };
        match joined {
            None => Err(self.fail(TransferError::Cancelled).await),
            Some(None) => Ok(false),
            Some(Some(joined)) => match self.settle(joined) {
                Ok(()) => Ok(true),
                Err(err) => Err(self.fail(err).await),
            },
        }
    }

    fn settle(&mut self, joined: Result<(usize, TransferResult<BlockResult>), JoinError>) -> TransferResult<()> {
        match joined {
            Ok((index, Ok(result))) => {
                self.results[index] = Some(result);
                Ok(())
            }
            Ok((index, Err(err))) => {
                let block = &self.blocks[index];
                warn!(block_id = %block.id, offset = block.offset, error = %err, "block transfer failed");
                Err(TransferError::partial_failure(
                    block.id.clone(),
                    block.offset,
                    block.length,
                    err,
                ))
            }
            Err(join_err) => Err(std::io::Error::new(std::io::ErrorKind::Other, join_err).into()),
        }
    }

    async fn fail(&mut self, err: TransferError) -> TransferError {
        if !self.tasks.is_empty() {
            warn!(in_flight = self.tasks.len(), "aborting in-flight block transfers");
        }
        self.abort().await;
        err
    }
}

fn panicked(panic: Box<dyn std::any::Any + Send>) -> TransferError {
    let message = panic
        .downcast_ref::<&str>()
        .map(|m| m.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    std::io::Error::new(std::io::ErrorKind::Other, format!("block transfer panicked: {message}")).into()
}

enum SourceEvent<T> {
    Cancelled,
    Joined(Result<(usize, TransferResult<BlockResult>), JoinError>),
    Read(TransferResult<T>),
}

/// Payload handed to an upload
pub enum UploadSource {
    Bytes(Bytes),
    Stream(ByteStream),
}

impl UploadSource {
    pub fn stream<S>(stream: S) -> Self
    where
        S: futures_core::Stream<Item = Result<Bytes, std::io::Error>> + Send + 'static,
    {
        Self::Stream(Box::pin(stream))
    }

    /// Length, when the source knows it
    pub fn known_len(&self) -> Option<u64> {
        match self {
            Self::Bytes(bytes) => Some(bytes.len() as u64),
            Self::Stream(_) => None,
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        Self::Bytes(bytes)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Bytes(Bytes::from(bytes))
    }
}

impl std::fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Bytes(bytes) => f.debug_tuple("Bytes").field(&bytes.len()).finish(),
            Self::Stream(_) => f.write_str("Stream"),
        }
    }
}

enum ReaderSource {
    /// Already in memory; blocks are slices of it
    Bytes(Bytes),
    Stream(ByteStream),
}

/// Reads a source one block at a time
pub struct BlockReader {
    source: ReaderSource,
    pending: BytesMut,
    consumed: u64,
    exhausted: bool,
}

impl BlockReader {
    pub fn new(source: UploadSource) -> Self {
        let source = match source {
            UploadSource::Bytes(bytes) => ReaderSource::Bytes(bytes),
            UploadSource::Stream(stream) => ReaderSource::Stream(stream),
        };
        Self {
            source,
            pending: BytesMut::new(),
            consumed: 0,
            exhausted: false,
        }
    }

    /// Bytes handed out so far
    pub fn consumed(&self) -> u64 {
        self.consumed
    }

    /// Next `len` bytes; fewer only when the source ends first
    pub async fn read_up_to(&mut self, len: usize) -> TransferResult<Bytes> {
        let stream = match &mut self.source {
            ReaderSource::Bytes(bytes) => {
                let take = len.min(bytes.len());
                self.consumed += take as u64;
                return Ok(bytes.split_to(take));
            }
            ReaderSource::Stream(stream) => stream,
        };
        while self.pending.len() < len && !self.exhausted {
            match stream.next().await {
                Some(chunk) => self.pending.extend_from_slice(&chunk?),
                None => self.exhausted = true,
            }
        }
        let take = len.min(self.pending.len());
        self.consumed += take as u64;
        Ok(self.pending.split_to(take).freeze())
    }

    /// Exactly the next `len` bytes
    pub async fn read_exact(&mut self, len: usize) -> TransferResult<Bytes> {
        let data = self.read_up_to(len).await?;
        if data.len() < len {
            return Err(TransferError::configuration(format!(
                "source ended after {} bytes, short of the declared size",
                self.consumed
            )));
        }
        Ok(data)
    }

    /// Fail if the source still has bytes
    pub async fn ensure_drained(&mut self) -> TransferResult<()> {
        let extra = self.read_up_to(1).await?;
        if !extra.is_empty() {
            return Err(TransferError::configuration(format!(
                "source is longer than the declared {} bytes",
                self.consumed - 1
            )));
        }
        Ok(())
    }
}

/// Runs a [`TransferPlan`] against a [`CommitTarget`]
pub struct TransferCoordinator {
    target: Arc<dyn CommitTarget>,
    progress: Option<ProgressTracker>,
    cancel: CancellationToken,
}

impl TransferCoordinator {
    pub fn new(target: Arc<dyn CommitTarget>) -> Self {
        Self {
            target,
            progress: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_progress(mut self, tracker: Option<ProgressTracker>) -> Self {
        self.progress = tracker;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Transfer `source` according to `plan` and commit it.
    ///
    /// Nothing is committed unless every block succeeded.
    #[instrument(skip(self, source, plan), fields(total_size = plan.total_size(), blocks = plan.block_count()))]
    pub async fn execute(
        &self,
        source: UploadSource,
        plan: &TransferPlan,
        max_concurrency: usize,
    ) -> TransferResult<BlobItem> {
        let mut reader = BlockReader::new(source);
        let mut dispatcher = BlockDispatcher::new(self.target.clone(), max_concurrency)
            .with_progress(self.progress.clone())
            .with_cancellation(self.cancel.clone());

        if plan.is_single_shot() {
            let len = usize::try_from(plan.total_size())
                .map_err(|_| TransferError::configuration("payload does not fit in memory"))?;
            let data = dispatcher.race_source(reader.read_exact(len)).await?;
            dispatcher.race_source(reader.ensure_drained()).await?;
            let mut body = ReplayableBody::new(data);
            if let Some(tracker) = &self.progress {
                body = body.with_progress(tracker.unit());
            }
            let item = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(TransferError::Cancelled),
                item = self.target.put_whole(body) => item?,
            };
            info!(etag = %item.etag, "single-shot upload complete");
            return Ok(item);
        }

        for block in plan.blocks() {
            let data = dispatcher.race_source(reader.read_exact(block.length as usize)).await?;
            dispatcher.submit(block.clone(), data).await?;
        }
        dispatcher.race_source(reader.ensure_drained()).await?;

        let (blocks, results) = dispatcher.finish().await?;
        if self.cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let item = self.target.commit(&blocks, results).await?;
        info!(etag = %item.etag, blocks = blocks.len(), "block upload committed");
        Ok(item)
    }
}
