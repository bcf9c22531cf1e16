//! Strategy selection.

use std::sync::Arc;

use seqxfer_blob::BlobConnector;
use seqxfer_protocol::{Storage, StorageDescriptor, StorageKind};
use seqxfer_task_poller::TaskPoller;
use tracing::debug;

use crate::error::OrchestratorError;
use crate::rsync::{RemoteCopy, Rsync};
use crate::strategy::{BlobToBlob, BlobToServer, ServerToBlob, ServerToServer, TransferStrategy};
use crate::types::StrategyOptions;

/// Picks and builds the strategy for a (source, destination) storage pair.
pub struct Dispatcher {
    connector: Arc<dyn BlobConnector>,
    remote: Arc<dyn RemoteCopy>,
    options: StrategyOptions,
}

impl Dispatcher {
    /// Creates a dispatcher whose cross-host copies run `options.rsync_path`.
    pub fn new(connector: Arc<dyn BlobConnector>, options: StrategyOptions) -> Self {
        let remote: Arc<dyn RemoteCopy> = Arc::new(Rsync::new(options.rsync_path.clone()));
        Self {
            connector,
            remote,
            options,
        }
    }

    /// Replaces the remote copy runner.
    pub fn with_remote_copy(mut self, remote: Arc<dyn RemoteCopy>) -> Self {
        self.remote = remote;
        self
    }

    pub fn options(&self) -> &StrategyOptions {
        &self.options
    }

    /// Returns the strategy moving objects from `from` to `to`.
    ///
    /// Defined for every pair of server and blob storages; any other kind
    /// is [`OrchestratorError::UnsupportedTransferKind`]. Blob account
    /// handles are connected here, once per call.
    pub fn select(
        &self,
        from: &Storage,
        to: &Storage,
    ) -> Result<Box<dyn TransferStrategy>, OrchestratorError> {
        if !supported(&from.kind) || !supported(&to.kind) {
            return Err(OrchestratorError::unsupported(from, to));
        }

        let strategy: Box<dyn TransferStrategy> = match descriptors(from, to)? {
            (StorageDescriptor::Server(from), StorageDescriptor::Server(to)) => Box::new(
                ServerToServer::new(from, to, Arc::clone(&self.remote), self.options.chunk_size),
            ),
            (StorageDescriptor::Server(from), StorageDescriptor::Blob(to)) => {
                let store = self.connector.connect(&to)?;
                Box::new(ServerToBlob::new(from, to, store))
            }
            (StorageDescriptor::Blob(from), StorageDescriptor::Server(to)) => {
                let store = self.connector.connect(&from)?;
                Box::new(BlobToServer::new(from, to, store))
            }
            (StorageDescriptor::Blob(from), StorageDescriptor::Blob(to)) => {
                let source_store = self.connector.connect(&from)?;
                let dest_store = self.connector.connect(&to)?;
                let token =
                    source_store.container_read_token(&from.container, self.options.source_token_ttl)?;
                Box::new(BlobToBlob::new(
                    from,
                    to,
                    source_store,
                    dest_store,
                    token,
                    TaskPoller::new(self.options.copy_poll_interval),
                ))
            }
        };
        debug!(
            from = %from.name,
            to = %to.name,
            strategy = strategy.name(),
            "selected transfer strategy"
        );
        Ok(strategy)
    }
}

/// Resolves both descriptors, naming the whole pair on an unknown kind.
pub(crate) fn descriptors(
    from: &Storage,
    to: &Storage,
) -> Result<(StorageDescriptor, StorageDescriptor), OrchestratorError> {
    let resolve = |storage: &Storage| {
        storage
            .descriptor()
            .map_err(|e| OrchestratorError::from_descriptor(e, from, to))
    };
    Ok((resolve(from)?, resolve(to)?))
}

fn supported(kind: &StorageKind) -> bool {
    matches!(kind, StorageKind::Server | StorageKind::Blob)
}
