//! Data types for the transfer flow.

use std::path::PathBuf;
use std::time::Duration;

use seqxfer_transfer::{DEFAULT_CHUNK_SIZE, DEFAULT_PROGRESS_INTERVAL, ProgressSink};
use seqxfer_task_poller::DEFAULT_POLL_INTERVAL;

use crate::error::{ErrorKind, OrchestratorError};

/// Lifetime of the read token a blob-to-blob copy reads its source with.
pub const SOURCE_TOKEN_TTL: Duration = Duration::from_secs(200 * 3600);

/// A fully resolved object on the strategy's source storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferSource {
    /// Storage-relative path.
    pub relative_path: String,
    /// Expected size in bytes, as recorded by the catalog.
    pub size: u64,
    pub is_folder: bool,
}

/// How a strategy satisfied a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    /// Bytes were moved.
    Copied,
    /// An identical object was already at the destination.
    AlreadyPresent,
}

/// Where the object now lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetLocation {
    pub storage: String,
    pub relative_path: String,
    pub size: u64,
    pub outcome: TransferOutcome,
}

/// Tunables handed to every strategy the dispatcher builds.
#[derive(Debug, Clone)]
pub struct StrategyOptions {
    /// rsync binary used for cross-host server copies.
    pub rsync_path: PathBuf,
    /// Chunk size of local copies.
    pub chunk_size: usize,
    /// Spacing between two status reads of a blob-to-blob copy.
    pub copy_poll_interval: Duration,
    /// Lifetime of the source read token of blob-to-blob copies.
    pub source_token_ttl: Duration,
}

impl Default for StrategyOptions {
    fn default() -> Self {
        Self {
            rsync_path: PathBuf::from("rsync"),
            chunk_size: DEFAULT_CHUNK_SIZE,
            copy_poll_interval: DEFAULT_POLL_INTERVAL,
            source_token_ttl: SOURCE_TOKEN_TTL,
        }
    }
}

/// Batch-level tunables.
#[derive(Clone)]
pub struct CoordinatorOptions {
    /// Files transferred at once.
    pub concurrency: usize,
    /// Minimum spacing of progress reports per file.
    pub progress_interval: Duration,
    /// Where progress reports go; `None` logs them.
    pub progress_sink: Option<ProgressSink>,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            concurrency: 1,
            progress_interval: DEFAULT_PROGRESS_INTERVAL,
            progress_sink: None,
        }
    }
}

impl std::fmt::Debug for CoordinatorOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoordinatorOptions")
            .field("concurrency", &self.concurrency)
            .field("progress_interval", &self.progress_interval)
            .finish_non_exhaustive()
    }
}

/// A file that could not be transferred.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileFailure {
    pub resource_id: i64,
    pub filename: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// Outcome of one [`Coordinator::transfer`](crate::Coordinator::transfer) call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub tag: String,
    /// Files whose bytes were moved during this run.
    pub transferred: usize,
    /// Files already at the destination, whether the catalog recorded them
    /// or an identical copy was found there.
    pub skipped: usize,
    pub failed: Vec<FileFailure>,
}

impl BatchReport {
    pub fn total(&self) -> usize {
        self.transferred + self.skipped + self.failed.len()
    }

    pub fn is_success(&self) -> bool {
        self.failed.is_empty()
    }

    /// Turns a report with failures into [`OrchestratorError::PartialFailure`].
    pub fn into_result(self) -> Result<Self, OrchestratorError> {
        if self.is_success() {
            Ok(self)
        } else {
            Err(OrchestratorError::PartialFailure {
                failed: self.failed.len(),
                total: self.total(),
                tag: self.tag,
            })
        }
    }
}

/// Event emitted while a batch runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransferEvent {
    /// A file's strategy started.
    Started { resource_id: i64, filename: String },
    /// The catalog already records the file at the destination.
    Skipped { resource_id: i64, filename: String },
    /// The file is at the destination and recorded in the catalog.
    Completed {
        resource_id: i64,
        filename: String,
        size: u64,
    },
    Failed {
        resource_id: i64,
        filename: String,
        kind: ErrorKind,
        error: String,
    },
}
