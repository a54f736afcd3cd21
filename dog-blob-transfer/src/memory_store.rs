use std::collections::HashMap;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use futures_util::StreamExt;
use parking_lot::{Mutex, RwLock};
use uuid::Uuid;

use crate::config::PAGE_SIZE;
use crate::error::{BLOB_NOT_FOUND, CUSTOMER_KEY_REQUIRED};
use crate::store::{ContentRange, DownloadResponse, PageWriteResult, ReadOptions, WriteOptions};
use crate::{
    AccessConditions, BlobKind, BlobProperties, BlobService, BlockId, BlockResult, ByteRange,
    ReplayableBody, TransferError, TransferResult,
};

/// Request as seen by [`MemoryBlobService`], recorded in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedRequest {
    GetProperties { key: String },
    PutBlob { key: String, len: u64 },
    StageBlock { key: String, block_id: BlockId, len: u64 },
    CommitBlockList { key: String, block_ids: Vec<BlockId> },
    CreatePageBlob { key: String, size: u64 },
    UploadPages { key: String, offset: u64, len: u64 },
    Download { key: String, range: Option<ByteRange>, if_match: Option<String> },
}

#[derive(Debug, Clone)]
struct StoredBlob {
    kind: BlobKind,
    data: Vec<u8>,
    etag: String,
    last_modified: chrono::DateTime<Utc>,
    encryption_key_sha256: Option<String>,
}

impl StoredBlob {
    fn new(kind: BlobKind, data: Vec<u8>, options: &WriteOptions) -> Self {
        Self {
            kind,
            data,
            etag: new_etag(),
            last_modified: Utc::now(),
            encryption_key_sha256: options.customer_key.as_ref().map(|k| k.key_sha256().to_string()),
        }
    }

    fn properties(&self) -> BlobProperties {
        BlobProperties {
            kind: self.kind,
            content_length: self.data.len() as u64,
            etag: self.etag.clone(),
            last_modified: self.last_modified,
            server_encrypted: true,
            encryption_key_sha256: self.encryption_key_sha256.clone(),
        }
    }
}

/// In-process blob service for tests and local development
pub struct MemoryBlobService {
    blobs: RwLock<HashMap<String, StoredBlob>>,
    /// Uncommitted blocks: key -> block id -> data
    staged: RwLock<HashMap<String, HashMap<BlockId, Bytes>>>,
    requests: Mutex<Vec<RecordedRequest>>,
    download_chunk_size: usize,
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self {
            blobs: RwLock::new(HashMap::new()),
            staged: RwLock::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            download_chunk_size: 64 * 1024,
        }
    }

    /// Size of the chunks download bodies are split into
    pub fn with_download_chunk_size(mut self, size: usize) -> Self {
        self.download_chunk_size = size.max(1);
        self
    }

    /// Current committed content of `key`
    pub fn content(&self, key: &str) -> Option<Bytes> {
        self.blobs.read().get(key).map(|b| Bytes::copy_from_slice(&b.data))
    }

    /// Number of uncommitted blocks held for `key`
    pub fn staged_block_count(&self, key: &str) -> usize {
        self.staged.read().get(key).map_or(0, |blocks| blocks.len())
    }

    /// Every request received so far
    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().len()
    }

    fn record(&self, request: RecordedRequest) {
        self.requests.lock().push(request);
    }

    fn check_write(&self, key: &str, conditions: &AccessConditions) -> TransferResult<()> {
        let blobs = self.blobs.read();
        check_conditions(key, blobs.get(key), conditions)
    }

    fn check_read<'a>(
        key: &str,
        blob: Option<&'a StoredBlob>,
        options: &ReadOptions,
    ) -> TransferResult<&'a StoredBlob> {
        let blob = blob.ok_or_else(|| TransferError::service(404, BLOB_NOT_FOUND, key))?;
        check_conditions(key, Some(blob), &options.conditions)?;
        if let Some(expected) = &blob.encryption_key_sha256 {
            let presented = options.customer_key.as_ref().map(|k| k.key_sha256());
            if presented != Some(expected.as_str()) {
                return Err(TransferError::service(
                    409,
                    CUSTOMER_KEY_REQUIRED,
                    format!("{} is encrypted with a customer-provided key", key),
                ));
            }
        }
        Ok(blob)
    }
}

impl Default for MemoryBlobService {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlobService for MemoryBlobService {
    async fn get_properties(&self, key: &str, options: &ReadOptions) -> TransferResult<BlobProperties> {
        self.record(RecordedRequest::GetProperties { key: key.to_string() });
        let blobs = self.blobs.read();
        let blob = Self::check_read(key, blobs.get(key), options)?;
        Ok(blob.properties())
    }

    async fn put_blob(
        &self,
        key: &str,
        body: ReplayableBody,
        options: &WriteOptions,
    ) -> TransferResult<BlobProperties> {
        self.record(RecordedRequest::PutBlob {
            key: key.to_string(),
            len: body.len(),
        });
        self.check_write(key, &options.conditions)?;
        let data = read_body(&body).await?;

        let mut blobs = self.blobs.write();
        // Re-check: another writer may have landed while the body was read.
        check_conditions(key, blobs.get(key), &options.conditions)?;
        let blob = StoredBlob::new(BlobKind::Block, data.to_vec(), options);
        let properties = blob.properties();
        blobs.insert(key.to_string(), blob);
        Ok(properties)
    }

    async fn stage_block(
        &self,
        key: &str,
        block_id: &BlockId,
        body: ReplayableBody,
        options: &WriteOptions,
    ) -> TransferResult<BlockResult> {
        self.record(RecordedRequest::StageBlock {
            key: key.to_string(),
            block_id: block_id.clone(),
            len: body.len(),
        });
        let data = read_body(&body).await?;
        self.staged
            .write()
            .entry(key.to_string())
            .or_default()
            .insert(block_id.clone(), data);
        Ok(BlockResult::staged(block_id.clone()).with_server_encrypted(options.customer_key.is_some()))
    }

    async fn commit_block_list(
        &self,
        key: &str,
        block_ids: &[BlockId],
        options: &WriteOptions,
    ) -> TransferResult<BlobProperties> {
        self.record(RecordedRequest::CommitBlockList {
            key: key.to_string(),
            block_ids: block_ids.to_vec(),
        });

        let mut blobs = self.blobs.write();
        check_conditions(key, blobs.get(key), &options.conditions)?;

        let mut staged = self.staged.write();
        let pending = staged.get(key);
        let mut data = Vec::new();
        for id in block_ids {
            let block = pending.and_then(|blocks| blocks.get(id)).ok_or_else(|| {
                TransferError::service(400, "InvalidBlockList", format!("block {} is not staged for {}", id, key))
            })?;
            data.extend_from_slice(block);
        }
        // Committing discards every uncommitted block of the blob.
        staged.remove(key);

        let blob = StoredBlob::new(BlobKind::Block, data, options);
        let properties = blob.properties();
        blobs.insert(key.to_string(), blob);
        Ok(properties)
    }

    async fn create_page_blob(
        &self,
        key: &str,
        size: u64,
        options: &WriteOptions,
    ) -> TransferResult<BlobProperties> {
        self.record(RecordedRequest::CreatePageBlob {
            key: key.to_string(),
            size,
        });
        if size % PAGE_SIZE != 0 {
            return Err(TransferError::service(
                400,
                "InvalidHeaderValue",
                format!("page blob size {} is not 512-byte aligned", size),
            ));
        }
        let mut blobs = self.blobs.write();
        check_conditions(key, blobs.get(key), &options.conditions)?;
        let blob = StoredBlob::new(BlobKind::Page, vec![0u8; size as usize], options);
        let properties = blob.properties();
        blobs.insert(key.to_string(), blob);
        Ok(properties)
    }

    async fn upload_pages(
        &self,
        key: &str,
        offset: u64,
        body: ReplayableBody,
        options: &WriteOptions,
    ) -> TransferResult<PageWriteResult> {
        self.record(RecordedRequest::UploadPages {
            key: key.to_string(),
            offset,
            len: body.len(),
        });
        let data = read_body(&body).await?;

        let mut blobs = self.blobs.write();
        let blob = blobs
            .get_mut(key)
            .ok_or_else(|| TransferError::service(404, BLOB_NOT_FOUND, key))?;
        check_conditions(key, Some(&*blob), &options.conditions)?;
        let end = offset + data.len() as u64;
        if blob.kind != BlobKind::Page
            || offset % PAGE_SIZE != 0
            || data.len() as u64 % PAGE_SIZE != 0
            || end > blob.data.len() as u64
        {
            return Err(TransferError::service(
                416,
                "InvalidPageRange",
                format!("pages [{}, {}) do not fit {}", offset, end, key),
            ));
        }
        blob.data[offset as usize..end as usize].copy_from_slice(&data);
        blob.etag = new_etag();
        blob.last_modified = Utc::now();
        Ok(PageWriteResult {
            etag: blob.etag.clone(),
            server_encrypted: true,
            content_md5: None,
        })
    }

    async fn download(
        &self,
        key: &str,
        range: Option<ByteRange>,
        options: &ReadOptions,
    ) -> TransferResult<crate::store::DownloadResponse> {
        self.record(RecordedRequest::Download {
            key: key.to_string(),
            range,
            if_match: options.conditions.if_match.clone(),
        });

        let blobs = self.blobs.read();
        let blob = Self::check_read(key, blobs.get(key), options)?;
        let total = blob.data.len() as u64;
        let range = range.unwrap_or(ByteRange::from_start(0));
        if !range.is_valid(total) {
            return Err(TransferError::service(
                416,
                "InvalidRange",
                format!("{} is outside a {} byte blob", range.to_header(), total),
            ));
        }
        let start = range.start;
        let end = start + range.length(total);
        let content = Bytes::copy_from_slice(&blob.data[start as usize..end as usize]);
        let chunk_size = self.download_chunk_size;
        let chunks: Vec<Result<Bytes, std::io::Error>> = (0..content.len())
            .step_by(chunk_size)
            .map(|i| Ok(content.slice(i..(i + chunk_size).min(content.len()))))
            .collect();

        Ok(DownloadResponse {
            properties: blob.properties(),
            content_range: ContentRange {
                start,
                end,
                total_size: total,
            },
            body: Box::pin(futures_util::stream::iter(chunks)),
        })
    }
}

fn check_conditions(key: &str, blob: Option<&StoredBlob>, conditions: &AccessConditions) -> TransferResult<()> {
    if let Some(expected) = &conditions.if_match {
        match blob {
            Some(b) if &b.etag == expected => {}
            Some(b) => {
                return Err(TransferError::service(
                    412,
                    "ConditionNotMet",
                    format!("{} has etag {}, expected {}", key, b.etag, expected),
                ))
            }
            None => return Err(TransferError::service(404, BLOB_NOT_FOUND, key)),
        }
    }
    if let (Some(tag), Some(b)) = (&conditions.if_none_match, blob) {
        if tag == "*" {
            return Err(TransferError::service(409, crate::error::BLOB_ALREADY_EXISTS, key));
        }
        if &b.etag == tag {
            return Err(TransferError::service(412, "ConditionNotMet", key));
        }
    }
    Ok(())
}

async fn read_body(body: &ReplayableBody) -> TransferResult<Bytes> {
    let mut stream = body.stream();
    let mut data = BytesMut::with_capacity(body.len() as usize);
    while let Some(chunk) = stream.next().await {
        data.extend_from_slice(&chunk?);
    }
    Ok(data.freeze())
}

fn new_etag() -> String {
    format!("\"0x{}\"", Uuid::new_v4().simple().to_string().to_uppercase())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::CustomerProvidedKey;

    #[tokio::test]
    async fn commit_assembles_blocks_in_list_order() {
        let service = MemoryBlobService::new();
        let (a, b) = (BlockId::new(), BlockId::new());
        let opts = WriteOptions::new();
        service.stage_block("k", &a, ReplayableBody::new(Bytes::from_static(b"hello ")), &opts).await.unwrap();
        service.stage_block("k", &b, ReplayableBody::new(Bytes::from_static(b"world")), &opts).await.unwrap();
        assert!(service.content("k").is_none());

        service.commit_block_list("k", &[b.clone(), a.clone()], &opts).await.unwrap();
        assert_eq!(service.content("k").unwrap(), Bytes::from_static(b"worldhello "));
        assert_eq!(service.staged_block_count("k"), 0);

        // Staged blocks do not survive a commit.
        tokio_test::assert_err!(service.commit_block_list("k", &[a], &opts).await);
    }

    #[tokio::test]
    async fn if_none_match_star_rejects_existing_blob() {
        let service = MemoryBlobService::new();
        let opts = WriteOptions::new().with_conditions(AccessConditions::if_not_exists());
        service.put_blob("k", ReplayableBody::new(Bytes::from_static(b"v1")), &opts).await.unwrap();
        let err = service
            .put_blob("k", ReplayableBody::new(Bytes::from_static(b"v2")), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Conflict { .. }));
    }

    #[tokio::test]
    async fn ranged_download_honors_if_match() {
        let service = MemoryBlobService::new().with_download_chunk_size(4);
        let props = service
            .put_blob("k", ReplayableBody::new(Bytes::from_static(b"0123456789")), &WriteOptions::new())
            .await
            .unwrap();

        let opts = ReadOptions::new().with_conditions(AccessConditions::if_match(props.etag.clone()));
        let response = service.download("k", Some(ByteRange::with_count(3, 5)), &opts).await.unwrap();
        assert_eq!(response.content_range, ContentRange { start: 3, end: 8, total_size: 10 });
        let body: Vec<Bytes> = response.body.map(|c| c.unwrap()).collect().await;
        assert_eq!(body.concat(), b"34567".to_vec());

        let stale = ReadOptions::new().with_conditions(AccessConditions::if_match("\"0xSTALE\""));
        let err = service.download("k", None, &stale).await.unwrap_err();
        assert!(matches!(err, TransferError::PreconditionFailed { .. }));
    }

    #[tokio::test]
    async fn encrypted_blob_requires_its_key() {
        let service = MemoryBlobService::new();
        let cpk = CustomerProvidedKey::new(&[1u8; 32]);
        service
            .put_blob(
                "k",
                ReplayableBody::new(Bytes::from_static(b"secret")),
                &WriteOptions::new().with_customer_key(cpk.clone()),
            )
            .await
            .unwrap();

        let err = service.download("k", None, &ReadOptions::new()).await.unwrap_err();
        assert_eq!(err.error_code(), Some(CUSTOMER_KEY_REQUIRED));

        let props = service
            .get_properties("k", &ReadOptions::new().with_customer_key(Some(cpk.clone())))
            .await
            .unwrap();
        assert_eq!(props.encryption_key_sha256.as_deref(), Some(cpk.key_sha256()));
    }

    #[tokio::test]
    async fn page_writes_must_be_aligned_and_in_bounds() {
        let service = MemoryBlobService::new();
        let opts = WriteOptions::new();
        service.create_page_blob("p", 1024, &opts).await.unwrap();
        service
            .upload_pages("p", 512, ReplayableBody::new(Bytes::from(vec![9u8; 512])), &opts)
            .await
            .unwrap();
        assert!(service
            .upload_pages("p", 1024, ReplayableBody::new(Bytes::from(vec![9u8; 512])), &opts)
            .await
            .is_err());

        let content = service.content("p").unwrap();
        assert!(content[..512].iter().all(|b| *b == 0));
        assert!(content[512..].iter().all(|b| *b == 9));
    }
}
