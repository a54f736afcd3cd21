use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{BlobKind, BlockId};

/// Receipt returned after a blob has been written
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobItem {
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub server_encrypted: bool,
    pub encryption_key_sha256: Option<String>,
    pub upload: UploadInfo,
}

/// How the blob content reached the service
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UploadInfo {
    /// One put carrying the whole payload
    Single { size_bytes: u64 },
    /// Staged blocks committed as a block list
    Blocks { block_count: u32, size_bytes: u64 },
    /// Page ranges written in place
    Pages { write_count: u32, size_bytes: u64 },
}

impl UploadInfo {
    pub fn size_bytes(&self) -> u64 {
        match self {
            Self::Single { size_bytes }
            | Self::Blocks { size_bytes, .. }
            | Self::Pages { size_bytes, .. } => *size_bytes,
        }
    }
}

impl BlobItem {
    pub fn new<S: Into<String>>(etag: S, last_modified: DateTime<Utc>, upload: UploadInfo) -> Self {
        Self {
            etag: etag.into(),
            last_modified,
            server_encrypted: false,
            encryption_key_sha256: None,
            upload,
        }
    }

    pub fn with_server_encrypted(mut self, encrypted: bool) -> Self {
        self.server_encrypted = encrypted;
        self
    }

    pub fn with_encryption_key_sha256<S: Into<String>>(mut self, sha256: S) -> Self {
        self.encryption_key_sha256 = Some(sha256.into());
        self
    }
}

/// Outcome of one staged block (or one page write)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockResult {
    pub block_id: BlockId,
    pub committed: bool,
    pub server_encrypted: bool,
    pub etag: Option<String>,
    pub content_md5: Option<String>,
}

impl BlockResult {
    /// A block that is staged but not yet part of the blob
    pub fn staged(block_id: BlockId) -> Self {
        Self {
            block_id,
            committed: false,
            server_encrypted: false,
            etag: None,
            content_md5: None,
        }
    }

    pub fn with_server_encrypted(mut self, encrypted: bool) -> Self {
        self.server_encrypted = encrypted;
        self
    }

    pub fn with_etag<S: Into<String>>(mut self, etag: S) -> Self {
        self.etag = Some(etag.into());
        self
    }

    pub fn with_content_md5<S: Into<String>>(mut self, md5: S) -> Self {
        self.content_md5 = Some(md5.into());
        self
    }

    /// Mark as landed in the blob (page writes are committed on arrival)
    pub fn committed(mut self) -> Self {
        self.committed = true;
        self
    }
}

/// Blob metadata returned by property reads and download responses
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub kind: BlobKind,
    pub content_length: u64,
    pub etag: String,
    pub last_modified: DateTime<Utc>,
    pub server_encrypted: bool,
    pub encryption_key_sha256: Option<String>,
}

impl BlobProperties {
    /// Receipt view of these properties
    pub fn to_item(&self, upload: UploadInfo) -> BlobItem {
        let mut item = BlobItem::new(self.etag.clone(), self.last_modified, upload)
            .with_server_encrypted(self.server_encrypted);
        if let Some(sha) = &self.encryption_key_sha256 {
            item = item.with_encryption_key_sha256(sha.clone());
        }
        item
    }
}
