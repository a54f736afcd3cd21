//! # dog-blob-transfer: chunked, resumable blob transfers
//!
//! `dog-blob-transfer` moves large payloads to and from a block-based blob
//! service. It splits uploads into blocks, transfers them with bounded
//! concurrency, commits them in order, and resumes interrupted downloads from
//! the last delivered byte.
//!
//! ## Key Features
//!
//! - **Planned uploads**: payloads up to a threshold go out in one request, larger ones as ordered blocks
//! - **Bounded concurrency**: at most `max_concurrency` block transfers in flight, fail-fast on the first error
//! - **All-or-nothing commit**: the block list is committed only after every block landed
//! - **Resumable downloads**: ranged re-requests pinned to the original etag
//! - **Exact progress**: retried blocks never count twice
//! - **Transport agnostic**: anything implementing [`BlobService`] can carry the bytes
//!
//! ## Quick Start
//!
//! ```rust
//! use dog_blob_transfer::prelude::*;
//!
//! # #[tokio::main]
//! # async fn main() -> TransferResult<()> {
//! let client = BlobClient::new(MemoryBlobService::new(), TransferConfig::default())?;
//!
//! // Upload
//! let item = client
//!     .upload("reports/q3.csv", b"region,total\nwest,42\n".to_vec(), UploadOptions::new())
//!     .await?;
//! println!("stored {}", item.etag);
//!
//! // Download
//! let data = client
//!     .download("reports/q3.csv", DownloadOptions::new())
//!     .await?
//!     .read_to_end()
//!     .await?;
//! assert_eq!(&data[..], b"region,total\nwest,42\n");
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────┐
//! │      BlobClient      │  ← upload / output stream / download
//! ├──────────────────────┤
//! │ TransferCoordinator  │  ← plan execution, bounded block pool, commit
//! │  resumable download  │  ← cursor + retry loop
//! ├──────────────────────┤
//! │     BlobService      │  ← wire operations (HTTP transport lives here)
//! └──────────────────────┘
//! ```

pub mod client;
pub mod config;
pub mod coordinator;
pub mod download;
pub mod error;
pub mod memory_store;
pub mod plan;
pub mod progress;
mod receipt;
pub mod store;
pub mod stream;
mod types;

// Re-export main types for clean API
pub use client::{BlobClient, UploadOptions};
pub use config::{DownloadRetryOptions, ServiceVersion, TransferConfig};
pub use coordinator::{
    BlockBlobTarget, BlockDispatcher, CommitTarget, PageBlobTarget, TransferCoordinator, UploadSource,
};
pub use download::{DownloadCursor, DownloadOptions};
pub use error::{TransferError, TransferResult};
pub use memory_store::{MemoryBlobService, RecordedRequest};
pub use plan::{Block, TransferPlan};
pub use progress::{ProgressReceiver, ProgressTracker, ReplayableBody, UnitProgress};
pub use receipt::{BlobItem, BlobProperties, BlockResult, UploadInfo};
pub use store::{BlobService, ContentRange, DownloadResponse, PageWriteResult, ReadOptions, WriteOptions};
pub use stream::{BlobInputStream, BlobOutputStream};
pub use types::{AccessConditions, BlobKind, BlockId, ByteRange, ByteStream, CustomerProvidedKey};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        BlobClient, BlobItem, BlobService, ByteRange, DownloadOptions, MemoryBlobService, TransferConfig,
        TransferError, TransferResult, UploadOptions, UploadSource,
    };
}
