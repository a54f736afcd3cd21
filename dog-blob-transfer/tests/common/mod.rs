#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::io::ErrorKind;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;

use dog_blob_transfer::{
    BlobProperties, BlobService, BlockId, BlockResult, ByteRange, ByteStream, DownloadResponse,
    MemoryBlobService, PageWriteResult, ReadOptions, RecordedRequest, ReplayableBody, TransferError,
    TransferResult, WriteOptions,
};

/// What happens to the body of the next download response
#[derive(Debug, Clone, Copy)]
pub enum BodyFault {
    /// Deliver `after` bytes, then fail with an I/O error of `kind`
    Error { after: u64, kind: ErrorKind },
    /// Deliver `after` bytes, then end the body early
    Truncate { after: u64 },
}

/// Wraps a [`MemoryBlobService`] and injects failures the way a flaky network would
pub struct FaultyService {
    inner: Arc<MemoryBlobService>,
    body_faults: Mutex<VecDeque<BodyFault>>,
    download_calls: AtomicUsize,
    download_failures: Mutex<HashMap<usize, TransferError>>,
    stage_calls: AtomicUsize,
    fail_stage_call: Mutex<Option<usize>>,
    fail_commit: Mutex<Option<TransferError>>,
    stage_delay: Mutex<Option<Box<dyn Fn(usize) -> Duration + Send + Sync>>>,
    replay_first_stage: Mutex<bool>,
}

impl FaultyService {
    pub fn new(inner: Arc<MemoryBlobService>) -> Self {
        Self {
            inner,
            body_faults: Mutex::new(VecDeque::new()),
            download_calls: AtomicUsize::new(0),
            download_failures: Mutex::new(HashMap::new()),
            stage_calls: AtomicUsize::new(0),
            fail_stage_call: Mutex::new(None),
            fail_commit: Mutex::new(None),
            stage_delay: Mutex::new(None),
            replay_first_stage: Mutex::new(false),
        }
    }

    /// Queue a fault for the next download response
    pub fn push_body_fault(&self, fault: BodyFault) {
        self.body_faults.lock().push_back(fault);
    }

    /// Reject the `n`th download request (0-based) with `err` before it reaches the service
    pub fn fail_download_call(&self, n: usize, err: TransferError) {
        self.download_failures.lock().insert(n, err);
    }

    /// Download requests issued so far, rejected ones included
    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    /// Fail the `n`th stage call (0-based) with a server error
    pub fn fail_stage_call(&self, n: usize) {
        *self.fail_stage_call.lock() = Some(n);
    }

    pub fn fail_commit(&self, err: TransferError) {
        *self.fail_commit.lock() = Some(err);
    }

    /// Delay each stage call by `delay(call_index)`
    pub fn delay_stages<F>(&self, delay: F)
    where
        F: Fn(usize) -> Duration + Send + Sync + 'static,
    {
        *self.stage_delay.lock() = Some(Box::new(delay));
    }

    /// Make the transport read half of the first staged body, drop the
    /// connection and send it again
    pub fn replay_first_stage(&self) {
        *self.replay_first_stage.lock() = true;
    }

    pub fn inner(&self) -> &Arc<MemoryBlobService> {
        &self.inner
    }
}

#[async_trait]
impl BlobService for FaultyService {
    async fn get_properties(&self, key: &str, options: &ReadOptions) -> TransferResult<BlobProperties> {
        self.inner.get_properties(key, options).await
    }

    async fn put_blob(&self, key: &str, body: ReplayableBody, options: &WriteOptions) -> TransferResult<BlobProperties> {
        self.inner.put_blob(key, body, options).await
    }

    async fn stage_block(
        &self,
        key: &str,
        block_id: &BlockId,
        body: ReplayableBody,
        options: &WriteOptions,
    ) -> TransferResult<BlockResult> {
        let call = self.stage_calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.stage_delay.lock().as_ref().map(|f| f(call));
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if *self.fail_stage_call.lock() == Some(call) {
            return Err(TransferError::service(500, "InternalError", "stage failed"));
        }
        let replay = call == 0 && *self.replay_first_stage.lock();
        if replay {
            let mut first = body.stream();
            let mut read = 0u64;
            while read < body.len() / 2 {
                match first.next().await {
                    Some(chunk) => read += chunk?.len() as u64,
                    None => break,
                }
            }
        }
        self.inner.stage_block(key, block_id, body, options).await
    }

    async fn commit_block_list(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &WriteOptions,
    ) -> TransferResult<BlobProperties> {
        let failure = self.fail_commit.lock().clone();
        if let Some(err) = failure {
            return Err(err);
        }
        self.inner.commit_block_list(key, block_ids, options).await
    }

    async fn create_page_blob(&self, key: &str, size: u64, options: &WriteOptions) -> TransferResult<BlobProperties> {
        self.inner.create_page_blob(key, size, options).await
    }

    async fn upload_pages(
        &self,
        key: &str,
        offset: u64,
        body: ReplayableBody,
        options: &WriteOptions,
    ) -> TransferResult<PageWriteResult> {
        self.inner.upload_pages(key, offset, body, options).await
    }

    async fn download(
        &self,
        key: &str,
        range: Option<ByteRange>,
        options: &ReadOptions,
    ) -> TransferResult<DownloadResponse> {
        let call = self.download_calls.fetch_add(1, Ordering::SeqCst);
        let failure = self.download_failures.lock().remove(&call);
        if let Some(err) = failure {
            return Err(err);
        }
        let mut response = self.inner.download(key, range, options).await?;
        let fault = self.body_faults.lock().pop_front();
        if let Some(fault) = fault {
            response.body = break_body(response.body, fault);
        }
        Ok(response)
    }
}

fn break_body(body: ByteStream, fault: BodyFault) -> ByteStream {
    let (limit, error) = match fault {
        BodyFault::Error { after, kind } => (after, Some(kind)),
        BodyFault::Truncate { after } => (after, None),
    };
    Box::pin(async_stream::stream! {
        let mut body = body;
        let mut sent = 0u64;
        while let Some(chunk) = body.next().await {
            let chunk = match chunk {
                Ok(chunk) => chunk,
                Err(err) => {
                    yield Err(err);
                    return;
                }
            };
            if sent + chunk.len() as u64 > limit {
                let keep = (limit - sent) as usize;
                if keep > 0 {
                    yield Ok(chunk.slice(..keep));
                }
                if let Some(kind) = error {
                    yield Err(std::io::Error::new(kind, "connection reset by peer"));
                }
                return;
            }
            sent += chunk.len() as u64;
            yield Ok(chunk);
        }
    })
}

/// Deterministic payload of `len` bytes
pub fn payload(len: usize) -> Bytes {
    Bytes::from((0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>())
}

/// Records every progress value it receives
pub fn progress_recorder() -> (Arc<Mutex<Vec<u64>>>, Arc<dyn dog_blob_transfer::ProgressReceiver>) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    (seen, Arc::new(move |value: u64| sink.lock().push(value)))
}

pub fn downloads(service: &MemoryBlobService) -> Vec<(Option<ByteRange>, Option<String>)> {
    service
        .requests()
        .into_iter()
        .filter_map(|r| match r {
            RecordedRequest::Download { range, if_match, .. } => Some((range, if_match)),
            _ => None,
        })
        .collect()
}

pub fn count(service: &MemoryBlobService, pred: fn(&RecordedRequest) -> bool) -> usize {
    service.requests().iter().filter(|r| pred(r)).count()
}

pub fn is_stage(r: &RecordedRequest) -> bool {
    matches!(r, RecordedRequest::StageBlock { .. })
}

pub fn is_commit(r: &RecordedRequest) -> bool {
    matches!(r, RecordedRequest::CommitBlockList { .. })
}

pub fn is_put(r: &RecordedRequest) -> bool {
    matches!(r, RecordedRequest::PutBlob { .. })
}
