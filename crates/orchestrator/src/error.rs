//! Orchestrator error types.

use std::fmt;

use seqxfer_blob::BlobError;
use seqxfer_catalog::CatalogError;
use seqxfer_protocol::{ProtocolError, Storage};
use seqxfer_transfer::TransferError;

/// Errors that abort a whole transfer batch.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    #[error("storage {0} not found")]
    StorageNotFound(String),

    #[error("no transfer strategy from {from} storage to {to} storage")]
    UnsupportedTransferKind { from: String, to: String },

    #[error("invalid storage: {0}")]
    InvalidStorage(ProtocolError),

    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    #[error("blob storage error: {0}")]
    Blob(#[from] BlobError),

    #[error("transfer error: {0}")]
    Transfer(#[from] TransferError),

    #[error("{failed} of {total} files in {tag} failed to transfer")]
    PartialFailure {
        tag: String,
        failed: usize,
        total: usize,
    },
}

impl OrchestratorError {
    /// No strategy moves objects from `from` to `to`.
    pub fn unsupported(from: &Storage, to: &Storage) -> Self {
        Self::UnsupportedTransferKind {
            from: from.kind.to_string(),
            to: to.kind.to_string(),
        }
    }

    /// Reads a descriptor error raised while resolving the `from` to `to` pair.
    pub(crate) fn from_descriptor(e: ProtocolError, from: &Storage, to: &Storage) -> Self {
        match e {
            ProtocolError::UnsupportedKind { .. } => Self::unsupported(from, to),
            other => Self::InvalidStorage(other),
        }
    }
}

/// Classification of a per-file failure in a batch report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    SourceMissing,
    DestinationConflict,
    VerificationFailed,
    FolderNotSupported,
    InvalidPath,
    Cancelled,
    CopyFailed,
    Blob,
    Io,
    Catalog,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::SourceMissing => "source_missing",
            Self::DestinationConflict => "destination_conflict",
            Self::VerificationFailed => "verification_failed",
            Self::FolderNotSupported => "folder_not_supported",
            Self::InvalidPath => "invalid_path",
            Self::Cancelled => "cancelled",
            Self::CopyFailed => "copy_failed",
            Self::Blob => "blob",
            Self::Io => "io",
            Self::Catalog => "catalog",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&TransferError> for ErrorKind {
    fn from(e: &TransferError) -> Self {
        match e {
            TransferError::SourceMissing(_) => Self::SourceMissing,
            TransferError::DestinationConflict(_) => Self::DestinationConflict,
            TransferError::VerificationFailed { .. } => Self::VerificationFailed,
            TransferError::FolderNotSupported(_) => Self::FolderNotSupported,
            TransferError::InvalidPath(_) => Self::InvalidPath,
            TransferError::Cancelled => Self::Cancelled,
            TransferError::Command(_) | TransferError::CopyFailed(_) => Self::CopyFailed,
            TransferError::Blob(_) => Self::Blob,
            TransferError::Io(_) => Self::Io,
        }
    }
}
