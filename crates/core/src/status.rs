//! Error taxonomy shared by readers, writers, and the dispatcher.
//!
//! [`Error`] is the rich error type propagated through `Result`;
//! [`IoErrorCode`] is the frozen machine code extracted from it for
//! non-blocking status polling, and [`RequestStatus`] is the observable
//! state of one in-flight read request.
//!
//! ## Error Codes (Canonical)
//!
//! | Code | Description |
//! |------|-------------|
//! | FileOpenFailed | Container TOC or partition file could not be opened |
//! | CorruptToc | TOC failed structural validation |
//! | SignatureError | TOC signature or per-block digest mismatch |
//! | InvalidEncryptionKey | No key registered for the container's key GUID, or decryption failed |
//! | UnknownChunkId | Chunk id not present in any mounted container |
//! | InvalidParameter | Bad range, bad alignment, or unsupported operation |
//! | ReadError | File read failed |
//! | WriteError | File write failed |
//! | CompressionError | Codec failure or unknown codec index |
//! | Cancelled | Request cancelled before completion |
//! | Unknown | Still pending (never a terminal code) |

use crate::identity::ChunkId;
use thiserror::Error;
use uuid::Uuid;

/// Frozen machine codes for error conditions surfaced at the boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoErrorCode {
    /// Container TOC or partition file could not be opened
    FileOpenFailed,
    /// TOC failed structural validation
    CorruptToc,
    /// TOC signature or per-block digest mismatch
    SignatureError,
    /// Missing or wrong encryption key
    InvalidEncryptionKey,
    /// Chunk id not present in any mounted container
    UnknownChunkId,
    /// Bad range, bad alignment, or unsupported operation
    InvalidParameter,
    /// File read failed
    ReadError,
    /// File write failed
    WriteError,
    /// Codec failure or unknown codec index
    CompressionError,
    /// Request cancelled before completion
    Cancelled,
    /// Still pending; never terminal
    Unknown,
}

/// All iostore errors.
///
/// Structured variants carry enough context for higher layers to report
/// precisely (the dispatcher turns `BlockSignatureMismatch` into a
/// multicast event naming the container and block).
#[derive(Debug, Error)]
pub enum Error {
    /// Container TOC or partition file could not be opened
    #[error("file open failed: {0}")]
    FileOpenFailed(String),

    /// TOC failed structural validation
    #[error("corrupt TOC: {0}")]
    CorruptToc(String),

    /// The RSA signature over the TOC did not verify
    #[error("TOC signature invalid for container '{0}'")]
    TocSignatureInvalid(String),

    /// A block's on-disk bytes did not match the signed digest
    #[error("block signature mismatch in container '{container}' block {block_index}")]
    BlockSignatureMismatch {
        /// Name of the container holding the block
        container: String,
        /// Index of the failing block in the container's block array
        block_index: u32,
        /// Digest recorded in the signature section
        expected: [u8; 20],
        /// Digest computed from the on-disk bytes
        actual: [u8; 20],
    },

    /// No key registered for the container's key GUID, or decryption failed
    #[error("invalid encryption key for guid {guid}")]
    InvalidEncryptionKey {
        /// Key GUID from the container header
        guid: Uuid,
    },

    /// Chunk id not present in any mounted container
    #[error("unknown chunk id {0}")]
    UnknownChunkId(ChunkId),

    /// Bad range, bad alignment, or unsupported operation
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// File read failed
    #[error("read error: {0}")]
    ReadError(String),

    /// File write failed
    #[error("write error: {0}")]
    WriteError(String),

    /// Codec failure or unknown codec index
    #[error("compression error: {0}")]
    CompressionError(String),

    /// Request cancelled before completion
    #[error("cancelled")]
    Cancelled,

    /// Underlying I/O error on the read path
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for iostore operations.
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// The frozen machine code for this error.
    pub fn code(&self) -> IoErrorCode {
        match self {
            Error::FileOpenFailed(_) => IoErrorCode::FileOpenFailed,
            Error::CorruptToc(_) => IoErrorCode::CorruptToc,
            Error::TocSignatureInvalid(_) => IoErrorCode::SignatureError,
            Error::BlockSignatureMismatch { .. } => IoErrorCode::SignatureError,
            Error::InvalidEncryptionKey { .. } => IoErrorCode::InvalidEncryptionKey,
            Error::UnknownChunkId(_) => IoErrorCode::UnknownChunkId,
            Error::InvalidParameter(_) => IoErrorCode::InvalidParameter,
            Error::ReadError(_) => IoErrorCode::ReadError,
            Error::WriteError(_) => IoErrorCode::WriteError,
            Error::CompressionError(_) => IoErrorCode::CompressionError,
            Error::Cancelled => IoErrorCode::Cancelled,
            Error::Io(_) => IoErrorCode::ReadError,
        }
    }

    /// True for integrity failures (TOC or block signatures).
    pub fn is_signature_error(&self) -> bool {
        self.code() == IoErrorCode::SignatureError
    }
}

/// Observable state of one read request.
///
/// Exactly one transition out of `Pending` ever happens; after that the
/// status is frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestStatus {
    /// Not yet terminal; polling returns this until completion
    Pending,
    /// Completed successfully; the result buffer is available
    Ok,
    /// Cancelled before the result was produced
    Cancelled,
    /// Failed with the given code
    Failed(IoErrorCode),
}

impl RequestStatus {
    /// True once the request has reached its final state.
    pub fn is_terminal(self) -> bool {
        !matches!(self, RequestStatus::Pending)
    }

    /// True for successful completion.
    pub fn is_ok(self) -> bool {
        matches!(self, RequestStatus::Ok)
    }

    /// True for cancellation.
    pub fn is_cancelled(self) -> bool {
        matches!(self, RequestStatus::Cancelled)
    }

    /// The error code, if the request failed or was cancelled.
    pub fn error_code(self) -> Option<IoErrorCode> {
        match self {
            RequestStatus::Pending | RequestStatus::Ok => None,
            RequestStatus::Cancelled => Some(IoErrorCode::Cancelled),
            RequestStatus::Failed(code) => Some(code),
        }
    }
}
