use std::sync::Arc;

use seqxfer_blob::BlobStore;
use seqxfer_protocol::{BlobStorage, ServerStorage};
use seqxfer_transfer::{
    ProgressReporter, StagedTarget, TransferError, commit_or_reconcile, set_read_only_file,
};
use tokio_util::sync::CancellationToken;
use tracing::info;

use super::{Existing, TransferFuture, TransferStrategy, check_existing, local_existing, located, verify_size};
use crate::types::{TargetLocation, TransferOutcome, TransferSource};

/// Blob container to local filesystem, streamed through a staging file.
pub struct BlobToServer {
    from: BlobStorage,
    to: ServerStorage,
    store: Arc<dyn BlobStore>,
}

impl BlobToServer {
    pub fn new(from: BlobStorage, to: ServerStorage, store: Arc<dyn BlobStore>) -> Self {
        Self { from, to, store }
    }

    async fn run(
        &self,
        source: &TransferSource,
        destination_path: &str,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<TargetLocation, TransferError> {
        if source.is_folder {
            return Err(TransferError::FolderNotSupported("blob-to-server"));
        }
        let container = &self.from.container;
        let blob = &source.relative_path;
        let source_location = format!("{}/{container}/{blob}", self.store.account());
        let Some(source_props) = self.store.properties(container, blob).await? else {
            return Err(TransferError::SourceMissing(source_location));
        };

        let target = self.to.local_path(destination_path);
        let location = format!("{}:{destination_path}", self.to.name);
        let found = local_existing(&target)?;
        let is_dir = found.is_some_and(|(_, dir)| dir);
        if check_existing(&location, found.map(|(size, _)| size), is_dir, source.size)?
            == Existing::Identical
        {
            info!(destination = %location, "already present with matching size");
            return Ok(located(
                &self.to.name,
                destination_path,
                source.size,
                TransferOutcome::AlreadyPresent,
            ));
        }

        verify_size(&source_location, source.size, source_props.size)?;

        info!(source = %blob, destination = %target.display(), "downloading");
        let stage = StagedTarget::new(&target)?;
        let received = self
            .store
            .download_file(container, blob, stage.path(), progress, cancel)
            .await?;
        verify_size(&location, source.size, received)?;
        set_read_only_file(stage.path())?;

        tokio::task::spawn_blocking(move || commit_or_reconcile(stage, received, false))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;

        Ok(located(
            &self.to.name,
            destination_path,
            source.size,
            TransferOutcome::Copied,
        ))
    }
}

impl TransferStrategy for BlobToServer {
    fn name(&self) -> &'static str {
        "blob-to-server"
    }

    fn transfer<'a>(
        &'a self,
        source: &'a TransferSource,
        destination_path: &'a str,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> TransferFuture<'a> {
        Box::pin(self.run(source, destination_path, progress, cancel))
    }
}
