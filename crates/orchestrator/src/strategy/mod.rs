//! Transfer strategies, one per (source kind, destination kind) pair.
//!
//! Every strategy follows the same contract:
//!
//! 1. The source must exist, else [`TransferError::SourceMissing`].
//! 2. An object already at the destination path is compared by size
//!    (directories always match). Equal sizes succeed without copying,
//!    different sizes are a [`TransferError::DestinationConflict`].
//! 3. Otherwise the bytes are copied and the destination size is checked
//!    against the expected size.
//!
//! Strategies never touch the catalog.

mod blob_to_blob;
mod blob_to_server;
mod server_to_blob;
mod server_to_server;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use seqxfer_transfer::{ProgressReporter, TransferError, path_size};
use tokio_util::sync::CancellationToken;

use crate::types::{TargetLocation, TransferOutcome, TransferSource};

pub use blob_to_blob::{BlobCopyStatus, BlobToBlob};
pub use blob_to_server::BlobToServer;
pub use server_to_blob::ServerToBlob;
pub use server_to_server::ServerToServer;

/// Boxed future returned by [`TransferStrategy::transfer`].
pub type TransferFuture<'a> =
    Pin<Box<dyn Future<Output = Result<TargetLocation, TransferError>> + Send + 'a>>;

/// Moves one object from a source storage to a destination storage.
pub trait TransferStrategy: Send + Sync {
    /// Short name used in logs and errors, e.g. `server-to-blob`.
    fn name(&self) -> &'static str;

    /// Copies `source` to `destination_path` on the destination storage.
    fn transfer<'a>(
        &'a self,
        source: &'a TransferSource,
        destination_path: &'a str,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> TransferFuture<'a>;
}

/// What the destination holds at the target path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Existing {
    Absent,
    Identical,
}

/// Compares an object found at the destination with the expected one.
pub(crate) fn check_existing(
    location: &str,
    found: Option<u64>,
    is_dir: bool,
    expected: u64,
) -> Result<Existing, TransferError> {
    match found {
        None => Ok(Existing::Absent),
        Some(_) if is_dir => Ok(Existing::Identical),
        Some(size) if size == expected => Ok(Existing::Identical),
        Some(size) => Err(TransferError::DestinationConflict(format!(
            "{location} exists with {size} bytes, expected {expected}"
        ))),
    }
}

/// Size of whatever sits at a local path, `None` if nothing does.
pub(crate) fn local_existing(path: &Path) -> Result<Option<(u64, bool)>, TransferError> {
    match std::fs::metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(Some((0, true))),
        Ok(_) => Ok(Some((path_size(path)?, false))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

pub(crate) fn verify_size(location: &str, expected: u64, actual: u64) -> Result<(), TransferError> {
    if expected == actual {
        Ok(())
    } else {
        Err(TransferError::VerificationFailed {
            path: location.to_string(),
            expected,
            actual,
        })
    }
}

pub(crate) fn located(
    storage: &str,
    relative_path: &str,
    size: u64,
    outcome: TransferOutcome,
) -> TargetLocation {
    TargetLocation {
        storage: storage.to_string(),
        relative_path: relative_path.to_string(),
        size,
        outcome,
    }
}
