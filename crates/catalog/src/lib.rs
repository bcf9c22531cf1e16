//! Catalog access.
//!
//! The catalog is the system of record for storages, file resources and
//! file instances. [`Catalog`] is the narrow interface the transfer core
//! needs; [`JobCatalog`] adds the catalog-side background jobs.
//! [`RestCatalog`] talks to the REST API, [`MemoryCatalog`] keeps
//! everything in memory for tests.

pub mod jobs;
pub mod memory;
pub mod rest;

use std::future::Future;
use std::pin::Pin;

use seqxfer_protocol::{
    FileInstance, FileResource, FileTransferJob, NewFileTransfer, Storage, TaskStatus,
};
use seqxfer_task_poller::PollError;

pub use jobs::{SimpleTaskStatus, TransferJobStatus, run_remote_transfer, start_remote_transfer, wait_for_tasks};
pub use memory::MemoryCatalog;
pub use rest::RestCatalog;

/// Boxed future returned by catalog methods.
pub type CatalogFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, CatalogError>> + Send + 'a>>;

/// Errors produced by catalog access.
#[derive(Debug, thiserror::Error)]
pub enum CatalogError {
    #[error("{kind} {key} not found")]
    NotFound { kind: &'static str, key: String },

    #[error("{count} {kind} records match {key}")]
    Ambiguous {
        kind: &'static str,
        key: String,
        count: u64,
    },

    #[error("conflicting record: {0}")]
    Conflict(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("catalog returned {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("missing credentials: environment variable {0} is not set")]
    MissingCredentials(&'static str),

    #[error(
        "transfer job {name} ({id}) finished unsuccessfully: {state}; restart it before retrying"
    )]
    JobFailed { id: i64, name: String, state: String },

    #[error(transparent)]
    Poll(#[from] PollError),
}

/// Catalog operations used by the transfer coordinator.
pub trait Catalog: Send + Sync {
    /// Looks up a storage by its unique name.
    fn get_storage<'a>(&'a self, name: &'a str) -> CatalogFuture<'a, Storage>;

    /// Every resource belonging to a dataset carrying `tag`.
    ///
    /// A resource shared by several tagged datasets may be listed more
    /// than once.
    fn list_resources_for_tag<'a>(&'a self, tag: &'a str) -> CatalogFuture<'a, Vec<FileResource>>;

    /// Every known copy of `resource`.
    fn list_file_instances<'a>(
        &'a self,
        resource: &'a FileResource,
    ) -> CatalogFuture<'a, Vec<FileInstance>>;

    /// Records that `resource` now exists on `storage`.
    ///
    /// Returns the existing instance if one is already recorded with the
    /// same fields; a recorded instance with a different path is a
    /// [`CatalogError::Conflict`].
    fn get_or_create_file_instance<'a>(
        &'a self,
        resource: &'a FileResource,
        storage: &'a Storage,
        filepath: Option<&'a str>,
    ) -> CatalogFuture<'a, FileInstance>;
}

/// Catalog-side background jobs.
pub trait JobCatalog: Catalog {
    fn find_transfer_job<'a>(&'a self, name: &'a str) -> CatalogFuture<'a, Option<FileTransferJob>>;

    fn create_transfer_job<'a>(
        &'a self,
        job: &'a NewFileTransfer,
    ) -> CatalogFuture<'a, FileTransferJob>;

    fn transfer_job(&self, id: i64) -> CatalogFuture<'_, FileTransferJob>;

    fn simple_task(&self, id: i64) -> CatalogFuture<'_, TaskStatus>;
}

/// Checks a looked-up instance against the one about to be recorded.
pub(crate) fn reconcile_instance(
    existing: FileInstance,
    filepath: Option<&str>,
) -> Result<FileInstance, CatalogError> {
    match (existing.filepath.as_deref(), filepath) {
        (Some(have), Some(want)) if have != want => Err(CatalogError::Conflict(format!(
            "file instance {} of resource {} records path {have}, not {want}",
            existing.id, existing.file_resource
        ))),
        _ => Ok(existing),
    }
}
