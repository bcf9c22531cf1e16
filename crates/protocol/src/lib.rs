//! Catalog record types for the seqxfer transfer core.
//!
//! Every record the core reads from or writes to the catalog is declared
//! here as an explicit serde struct. The field names match the catalog's
//! JSON representation.

pub mod messages;
pub mod types;

pub use messages::{FileTransferJob, NewFileInstance, NewFileTransfer, Page, TaskStatus};
pub use types::{
    BlobStorage, FileInstance, FileResource, ServerStorage, Storage, StorageDescriptor,
    StorageKind,
};

/// Errors produced while interpreting catalog records.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("storage {name} is invalid: {reason}")]
    InvalidStorage { name: String, reason: String },

    #[error("storage {name} has unsupported kind {kind}")]
    UnsupportedKind { name: String, kind: String },
}
