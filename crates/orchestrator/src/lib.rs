//! Transfer orchestration between server and blob storages.
//!
//! This crate holds the **business logic** of a transfer. It has no CLI
//! or transport concerns of its own: the catalog and blob accounts come
//! in as trait objects.
//!
//! # Flow
//!
//! 1. **Resolve**: look up both storages in the catalog
//! 2. **Dispatch**: pick the strategy for the (source, destination) kinds
//! 3. **Transfer**: move each tagged file that is not yet at the destination
//! 4. **Record**: register the new copy in the catalog

pub mod coordinator;
pub mod dispatch;
pub mod error;
pub mod rsync;
pub mod strategy;
pub mod types;

pub use coordinator::Coordinator;
pub use dispatch::Dispatcher;
pub use error::{ErrorKind, OrchestratorError};
pub use rsync::{RemoteCopy, RemoteCopyRequest, Rsync};
pub use strategy::{
    BlobCopyStatus, BlobToBlob, BlobToServer, ServerToBlob, ServerToServer, TransferStrategy,
};
pub use types::{
    BatchReport, CoordinatorOptions, FileFailure, SOURCE_TOKEN_TTL, StrategyOptions,
    TargetLocation, TransferEvent, TransferOutcome, TransferSource,
};
