//! Object storage access for the blob strategies.
//!
//! [`BlobStore`] is the seam between the strategies and a storage account.
//! [`azure::AzureBlobStore`] talks to the Azure Blob REST API using
//! short-lived SAS tokens; [`memory::MemoryBlobService`] keeps blobs in
//! memory for tests and dry runs.

pub mod azure;
pub mod memory;
pub mod sas;

use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;

use seqxfer_protocol::BlobStorage;
use seqxfer_transfer::{ProgressReporter, TransferError};
use tokio_util::sync::CancellationToken;

pub use azure::{AzureBlobStore, AzureConnector, AzureOptions};
pub use memory::{MemoryBlobService, MemoryBlobStore};
pub use sas::{AccountKey, SasPermissions, SasToken};

/// Boxed future returned by [`BlobStore`] methods.
pub type BlobFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BlobError>> + Send + 'a>>;

/// Errors produced by blob storage access.
#[derive(Debug, thiserror::Error)]
pub enum BlobError {
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{method} {resource} returned {status}: {message}")]
    Status {
        method: &'static str,
        resource: String,
        status: u16,
        message: String,
    },

    #[error("invalid account key for {0}")]
    InvalidKey(String),

    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("cancelled")]
    Cancelled,

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl From<BlobError> for TransferError {
    fn from(e: BlobError) -> Self {
        match e {
            BlobError::Cancelled => TransferError::Cancelled,
            BlobError::Io(io) => TransferError::Io(io),
            other => TransferError::Blob(other.to_string()),
        }
    }
}

/// Server-side copy status as reported on the destination blob.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopyStatus {
    Pending,
    Success,
    Aborted,
    Failed,
}

impl CopyStatus {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "success" => Some(Self::Success),
            "aborted" => Some(Self::Aborted),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }

    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }
}

/// State of the most recent server-side copy into a blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyState {
    pub id: String,
    pub status: CopyStatus,
    pub description: String,
}

/// Properties of an existing blob.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlobProperties {
    pub size: u64,
}

/// One storage account.
pub trait BlobStore: Send + Sync {
    /// Storage account name.
    fn account(&self) -> &str;

    /// Returns the blob's properties, or `None` if it does not exist.
    fn properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BlobFuture<'a, Option<BlobProperties>>;

    /// Uploads a local file as a block blob. Returns the bytes sent.
    ///
    /// Nothing becomes visible at `blob` unless every block was staged.
    fn upload_file<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        source: &'a Path,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> BlobFuture<'a, u64>;

    /// Streams a blob into a local file. Returns the bytes received.
    fn download_file<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        dest: &'a Path,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> BlobFuture<'a, u64>;

    /// Issues a read-only token for a whole container.
    fn container_read_token(
        &self,
        container: &str,
        ttl: std::time::Duration,
    ) -> Result<SasToken, BlobError>;

    /// URL of a blob authorized by `token`.
    fn signed_url(&self, container: &str, blob: &str, token: &SasToken) -> String;

    /// Starts a server-side copy from `source_url` into `blob`.
    fn start_copy<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        source_url: &'a str,
    ) -> BlobFuture<'a, CopyState>;

    /// Reads the state of the last copy into `blob`.
    fn copy_state<'a>(&'a self, container: &'a str, blob: &'a str) -> BlobFuture<'a, CopyState>;

    /// Aborts a pending copy.
    fn abort_copy<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        copy_id: &'a str,
    ) -> BlobFuture<'a, ()>;

    /// Deletes a blob; deleting a missing blob succeeds.
    fn delete<'a>(&'a self, container: &'a str, blob: &'a str) -> BlobFuture<'a, ()>;
}

/// Builds [`BlobStore`] handles for blob storage descriptors.
pub trait BlobConnector: Send + Sync {
    fn connect(&self, storage: &BlobStorage) -> Result<Arc<dyn BlobStore>, BlobError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn copy_status_parses_azure_values() {
        assert_eq!(CopyStatus::parse("pending"), Some(CopyStatus::Pending));
        assert_eq!(CopyStatus::parse("success"), Some(CopyStatus::Success));
        assert_eq!(CopyStatus::parse("aborted"), Some(CopyStatus::Aborted));
        assert_eq!(CopyStatus::parse("failed"), Some(CopyStatus::Failed));
        assert_eq!(CopyStatus::parse("weird"), None);
        assert!(!CopyStatus::Pending.is_terminal());
        assert!(CopyStatus::Failed.is_terminal());
    }

    #[test]
    fn blob_error_maps_to_transfer_error() {
        assert!(matches!(
            TransferError::from(BlobError::Cancelled),
            TransferError::Cancelled
        ));
        assert!(matches!(
            TransferError::from(BlobError::Protocol("bad".into())),
            TransferError::Blob(_)
        ));
    }
}
