use std::sync::Arc;
use thiserror::Error;

use crate::BlockId;

/// Result type for transfer operations
pub type TransferResult<T> = Result<T, TransferError>;

/// Service error code returned when a write targets an existing blob without overwrite
pub const BLOB_ALREADY_EXISTS: &str = "BlobAlreadyExists";

/// Service error code returned when an access condition (If-Match / If-None-Match) fails
pub const CONDITION_NOT_MET: &str = "ConditionNotMet";

/// Service error code returned when a blob does not exist
pub const BLOB_NOT_FOUND: &str = "BlobNotFound";

/// Service error code returned when an encrypted blob is read without its key
pub const CUSTOMER_KEY_REQUIRED: &str = "BlobUsesCustomerSpecifiedEncryption";

/// Errors that can occur during block transfers and resumable downloads
#[derive(Error, Debug, Clone)]
pub enum TransferError {
    /// Invalid plan inputs. Raised locally, never sent to the network, never retried.
    #[error("Invalid transfer configuration: {message}")]
    Configuration { message: String },

    /// Network-level failure that may succeed on a later attempt
    #[error("Transient transport error: {message}")]
    TransientTransport { message: String },

    /// The blob changed underneath us (etag no longer matches)
    #[error("Precondition failed: {message}")]
    PreconditionFailed { message: String },

    /// Target blob already exists and overwrite was not requested
    #[error("Blob already exists: {key}")]
    Conflict { key: String },

    /// Structured error returned by the service
    #[error("Service error {status} ({code}): {message}")]
    Service {
        status: u16,
        code: String,
        message: String,
    },

    /// A block failed during a multi-block upload; remaining work was aborted
    #[error("Block {block_id} [{offset}, +{length}) failed: {source}")]
    PartialFailure {
        block_id: BlockId,
        offset: u64,
        length: u32,
        #[source]
        source: Box<TransferError>,
    },

    /// A download stopped for good; `offset` is the last byte position delivered
    #[error("Download aborted at offset {offset} ({remaining} bytes remaining) after {attempts} retries: {source}")]
    DownloadAborted {
        offset: u64,
        remaining: u64,
        attempts: u32,
        #[source]
        source: Box<TransferError>,
    },

    /// The caller cancelled the transfer
    #[error("Transfer cancelled")]
    Cancelled,

    /// Write or close on a stream that already reached a terminal state
    #[error("Stream is closed")]
    StreamClosed,

    #[error("I/O error: {source}")]
    Io {
        #[source]
        source: Arc<std::io::Error>,
    },
}

impl TransferError {
    /// Create a configuration error
    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a transient transport error
    pub fn transient<S: Into<String>>(message: S) -> Self {
        Self::TransientTransport {
            message: message.into(),
        }
    }

    /// Create a precondition failure
    pub fn precondition_failed<S: Into<String>>(message: S) -> Self {
        Self::PreconditionFailed {
            message: message.into(),
        }
    }

    /// Create a conflict error for `key`
    pub fn conflict<S: Into<String>>(key: S) -> Self {
        Self::Conflict { key: key.into() }
    }

    /// Classify a structured service error by its status and error code.
    pub fn service<C, M>(status: u16, code: C, message: M) -> Self
    where
        C: Into<String>,
        M: Into<String>,
    {
        let code = code.into();
        let message = message.into();
        if code == BLOB_ALREADY_EXISTS {
            return Self::Conflict { key: message };
        }
        if status == 412 || code == CONDITION_NOT_MET {
            return Self::PreconditionFailed { message };
        }
        Self::Service {
            status,
            code,
            message,
        }
    }

    /// Wrap a block failure with the block's identity and byte range
    pub fn partial_failure(block_id: BlockId, offset: u64, length: u32, source: TransferError) -> Self {
        Self::PartialFailure {
            block_id,
            offset,
            length,
            source: Box::new(source),
        }
    }

    /// Whether a later attempt of the same request could succeed
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::TransientTransport { .. } => true,
            Self::Io { source } => is_transient_io(source.kind()),
            _ => false,
        }
    }

    /// The innermost error, looking through block and download wrappers
    pub fn root_cause(&self) -> &TransferError {
        match self {
            Self::PartialFailure { source, .. } | Self::DownloadAborted { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }

    /// Service error code, when the root cause carries one
    pub fn error_code(&self) -> Option<&str> {
        match self.root_cause() {
            Self::Service { code, .. } => Some(code.as_str()),
            Self::Conflict { .. } => Some(BLOB_ALREADY_EXISTS),
            Self::PreconditionFailed { .. } => Some(CONDITION_NOT_MET),
            _ => None,
        }
    }
}

impl From<std::io::Error> for TransferError {
    fn from(source: std::io::Error) -> Self {
        Self::Io {
            source: Arc::new(source),
        }
    }
}

impl From<TransferError> for std::io::Error {
    fn from(err: TransferError) -> Self {
        let kind = match err.root_cause() {
            TransferError::Io { source } => source.kind(),
            TransferError::TransientTransport { .. } => std::io::ErrorKind::ConnectionReset,
            TransferError::Configuration { .. } => std::io::ErrorKind::InvalidInput,
            TransferError::Conflict { .. } => std::io::ErrorKind::AlreadyExists,
            TransferError::Cancelled => std::io::ErrorKind::Interrupted,
            _ => std::io::ErrorKind::Other,
        };
        std::io::Error::new(kind, err)
    }
}

/// I/O error kinds a body stream can hit on a healthy-but-flaky connection
pub(crate) fn is_transient_io(kind: std::io::ErrorKind) -> bool {
    use std::io::ErrorKind::*;
    matches!(
        kind,
        ConnectionReset | ConnectionAborted | BrokenPipe | TimedOut | UnexpectedEof | Interrupted
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_errors_are_classified_by_code() {
        let err = TransferError::service(409, BLOB_ALREADY_EXISTS, "photos/cat.png");
        assert!(matches!(err, TransferError::Conflict { ref key } if key == "photos/cat.png"));

        let err = TransferError::service(412, CONDITION_NOT_MET, "etag mismatch");
        assert!(matches!(err, TransferError::PreconditionFailed { .. }));

        let err = TransferError::service(404, BLOB_NOT_FOUND, "missing");
        assert_eq!(err.error_code(), Some(BLOB_NOT_FOUND));
        assert!(!err.is_retryable());
    }

    #[test]
    fn retryability() {
        assert!(TransferError::transient("reset").is_retryable());
        assert!(TransferError::from(std::io::Error::from(std::io::ErrorKind::ConnectionReset)).is_retryable());
        assert!(!TransferError::from(std::io::Error::from(std::io::ErrorKind::InvalidData)).is_retryable());
        assert!(!TransferError::precondition_failed("changed").is_retryable());
        assert!(!TransferError::configuration("bad").is_retryable());
    }

    #[test]
    fn root_cause_looks_through_wrappers() {
        let inner = TransferError::service(500, "InternalError", "boom");
        let wrapped = TransferError::partial_failure(BlockId::new(), 12, 4, inner);
        assert_eq!(wrapped.error_code(), Some("InternalError"));
        assert!(wrapped.to_string().contains("[12, +4)"));
    }
}
