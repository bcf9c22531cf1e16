//! Transfer mechanics shared by every strategy.
//!
//! Rate-limited progress reporting, storage-relative path validation,
//! staged (temp + no-clobber commit) local copies, and the read-only
//! permission scheme applied to stored artifacts.

mod chunked;
mod local;
mod permissions;
mod progress;
mod validation;

pub use chunked::ChunkReader;
pub use local::{
    StagedTarget, commit_or_reconcile, copy_file, copy_tree, path_size, staging_path,
};
pub use permissions::{
    READ_ONLY_DIR_MODE, READ_ONLY_FILE_MODE, STAGING_DIR_MODE, ensure_dir, restrict_tree,
    set_read_only_file, unrestrict_tree,
};
pub use progress::{
    DEFAULT_PROGRESS_INTERVAL, ProgressReporter, ProgressSink, ProgressSnapshot, log_sink,
};
pub use validation::validate_relative_path;

/// Default chunk size for local copies and block uploads: 8 MiB.
pub const DEFAULT_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Errors produced while moving bytes between storages.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("source missing: {0}")]
    SourceMissing(String),

    #[error("destination conflict: {0}")]
    DestinationConflict(String),

    #[error("verification failed for {path}: expected {expected} bytes, found {actual}")]
    VerificationFailed {
        path: String,
        expected: u64,
        actual: u64,
    },

    #[error("folder resources are not supported by the {0} strategy")]
    FolderNotSupported(&'static str),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("cancelled")]
    Cancelled,

    #[error("copy command failed: {0}")]
    Command(String),

    #[error("blob storage error: {0}")]
    Blob(String),

    #[error("remote copy failed: {0}")]
    CopyFailed(String),
}
