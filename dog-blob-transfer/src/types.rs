use base64::{engine::general_purpose::STANDARD, Engine as _};
use bytes::Bytes;
use futures_core::Stream;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::pin::Pin;
use uuid::Uuid;

/// Stream of bytes for blob content
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, std::io::Error>> + Send>>;

/// Opaque block identifier, unique within one upload.
///
/// The service requires every id of a block list to have the same encoded
/// length, so ids are always the base64 form of 16 random bytes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BlockId(String);

impl BlockId {
    /// Generate a new random block ID
    pub fn new() -> Self {
        Self(STANDARD.encode(Uuid::new_v4().as_bytes()))
    }

    /// Create from an id previously returned by the service
    pub fn from_string(id: String) -> Self {
        Self(id)
    }

    /// Get the encoded id
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for BlockId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Byte range for partial content requests
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: Option<u64>, // exclusive; None means "to end of blob"
}

impl ByteRange {
    pub fn new(start: u64, end: Option<u64>) -> Self {
        Self { start, end }
    }

    pub fn from_start(start: u64) -> Self {
        Self { start, end: None }
    }

    /// Range covering `count` bytes starting at `start`
    pub fn with_count(start: u64, count: u64) -> Self {
        Self {
            start,
            end: Some(start.saturating_add(count)),
        }
    }

    pub fn length(&self, total_size: u64) -> u64 {
        self.end
            .unwrap_or(total_size)
            .min(total_size)
            .saturating_sub(self.start)
    }

    pub fn is_valid(&self, total_size: u64) -> bool {
        if self.start > total_size || (self.start == total_size && total_size > 0) {
            return false;
        }
        match self.end {
            Some(end) => end > self.start,
            None => true,
        }
    }

    /// Value for an HTTP `Range` header (inclusive end)
    pub fn to_header(&self) -> String {
        match self.end {
            Some(end) => format!("bytes={}-{}", self.start, end.saturating_sub(1)),
            None => format!("bytes={}-", self.start),
        }
    }
}

/// Conditional headers attached to a request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AccessConditions {
    /// `If-Match`: only act if the blob's etag equals this value
    pub if_match: Option<String>,
    /// `If-None-Match`: `*` means "only if the blob does not exist"
    pub if_none_match: Option<String>,
}

impl AccessConditions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn if_match<S: Into<String>>(etag: S) -> Self {
        Self {
            if_match: Some(etag.into()),
            if_none_match: None,
        }
    }

    /// Condition that fails when the blob already exists
    pub fn if_not_exists() -> Self {
        Self {
            if_match: None,
            if_none_match: Some("*".to_string()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.if_match.is_none() && self.if_none_match.is_none()
    }
}

/// Customer-provided encryption key (CPK).
///
/// Only the key and its SHA-256 travel with requests; the service encrypts
/// at rest with it and refuses reads that don't present the same key.
#[derive(Clone, PartialEq, Eq)]
pub struct CustomerProvidedKey {
    key: String,
    key_sha256: String,
    algorithm: String,
}

impl CustomerProvidedKey {
    /// Build from a raw 256-bit AES key
    pub fn new(raw_key: &[u8]) -> Self {
        let digest = Sha256::digest(raw_key);
        Self {
            key: STANDARD.encode(raw_key),
            key_sha256: STANDARD.encode(digest),
            algorithm: "AES256".to_string(),
        }
    }

    /// Base64-encoded key (`x-ms-encryption-key`)
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Base64-encoded SHA-256 of the key (`x-ms-encryption-key-sha256`)
    pub fn key_sha256(&self) -> &str {
        &self.key_sha256
    }

    pub fn algorithm(&self) -> &str {
        &self.algorithm
    }
}

impl std::fmt::Debug for CustomerProvidedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CustomerProvidedKey")
            .field("key_sha256", &self.key_sha256)
            .field("algorithm", &self.algorithm)
            .finish_non_exhaustive()
    }
}

/// Blob type as reported by the service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlobKind {
    Block,
    Page,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn block_ids_are_unique_and_fixed_length() {
        let ids: Vec<BlockId> = (0..100).map(|_| BlockId::new()).collect();
        let unique: std::collections::HashSet<_> = ids.iter().collect();
        assert_eq!(unique.len(), ids.len());
        assert!(ids.iter().all(|id| id.as_str().len() == ids[0].as_str().len()));
    }

    #[test]
    fn byte_range_header_and_length() {
        let range = ByteRange::with_count(256, 768);
        assert_eq!(range.to_header(), "bytes=256-1023");
        assert_eq!(range.length(1024), 768);
        assert_eq!(ByteRange::from_start(10).to_header(), "bytes=10-");
        assert_eq!(ByteRange::from_start(10).length(30), 20);
        assert!(!ByteRange::from_start(40).is_valid(30));
        assert!(!ByteRange::new(5, Some(5)).is_valid(30));
    }

    #[test]
    fn customer_key_hashes_raw_key() {
        let cpk = CustomerProvidedKey::new(&[7u8; 32]);
        assert_eq!(cpk.algorithm(), "AES256");
        assert_eq!(STANDARD.decode(cpk.key()).unwrap(), vec![7u8; 32]);
        assert_eq!(STANDARD.decode(cpk.key_sha256()).unwrap().len(), 32);
        assert!(!format!("{:?}", cpk).contains(cpk.key()));
    }
}
