use std::sync::Arc;

use seqxfer_blob::{BlobStore, CopyStatus, SasToken};
use seqxfer_protocol::{BlobStorage, TaskStatus};
use seqxfer_task_poller::{PollError, StatusFuture, TaskPoller, TaskStatusSource};
use seqxfer_transfer::{ProgressReporter, TransferError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Existing, TransferFuture, TransferStrategy, check_existing, located, verify_size};
use crate::types::{TargetLocation, TransferOutcome, TransferSource};

/// Server-side copy between two blob accounts.
///
/// The destination account pulls from a read-only container URL into the
/// source account. The copy is polled until it settles; a cancelled or
/// failed copy is aborted and its destination blob deleted.
pub struct BlobToBlob {
    from: BlobStorage,
    to: BlobStorage,
    source_store: Arc<dyn BlobStore>,
    dest_store: Arc<dyn BlobStore>,
    source_token: SasToken,
    poller: TaskPoller,
}

impl BlobToBlob {
    pub fn new(
        from: BlobStorage,
        to: BlobStorage,
        source_store: Arc<dyn BlobStore>,
        dest_store: Arc<dyn BlobStore>,
        source_token: SasToken,
        poller: TaskPoller,
    ) -> Self {
        Self {
            from,
            to,
            source_store,
            dest_store,
            source_token,
            poller,
        }
    }

    async fn run(
        &self,
        source: &TransferSource,
        destination_path: &str,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<TargetLocation, TransferError> {
        if source.is_folder {
            return Err(TransferError::FolderNotSupported("blob-to-blob"));
        }
        let blob = &source.relative_path;
        let source_location = format!(
            "{}/{}/{blob}",
            self.source_store.account(),
            self.from.container
        );
        let Some(source_props) = self
            .source_store
            .properties(&self.from.container, blob)
            .await?
        else {
            return Err(TransferError::SourceMissing(source_location));
        };

        let container = &self.to.container;
        let location = format!("{}/{container}/{destination_path}", self.dest_store.account());
        let found = self.dest_store.properties(container, destination_path).await?;
        if check_existing(&location, found.map(|p| p.size), false, source.size)?
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

        let url = self
            .source_store
            .signed_url(&self.from.container, blob, &self.source_token);
        let started = self.dest_store.start_copy(container, destination_path, &url).await?;
        info!(destination = %location, copy_id = %started.id, "server-side copy started");
        progress.report(0, source.size);

        if started.status != CopyStatus::Success {
            let status = BlobCopyStatus::new(self.dest_store.as_ref(), container);
            match self
                .poller
                .await_completion(&status, destination_path, &cancel)
                .await
            {
                Ok(_) => {}
                Err(PollError::Cancelled) => {
                    self.discard(destination_path, Some(&started.id)).await;
                    return Err(TransferError::Cancelled);
                }
                Err(PollError::TaskFailed { state, .. }) => {
                    self.discard(destination_path, None).await;
                    return Err(TransferError::CopyFailed(format!("{location}: {state}")));
                }
                Err(e @ PollError::Lookup { .. }) => {
                    return Err(TransferError::Blob(e.to_string()));
                }
            }
        }

        let copied = self
            .dest_store
            .properties(container, destination_path)
            .await?
            .map_or(0, |p| p.size);
        if let Err(e) = verify_size(&location, source.size, copied) {
            warn!(destination = %location, error = %e, "deleting copy of unexpected size");
            self.discard(destination_path, None).await;
            return Err(e);
        }
        progress.finish(copied, source.size);
        Ok(located(
            &self.to.name,
            destination_path,
            source.size,
            TransferOutcome::Copied,
        ))
    }

    /// Aborts a pending copy (if any) and removes whatever it left behind.
    async fn discard(&self, blob: &str, copy_id: Option<&str>) {
        let container = &self.to.container;
        if let Some(id) = copy_id
            && let Err(e) = self.dest_store.abort_copy(container, blob, id).await
        {
            warn!(blob, copy_id = id, error = %e, "failed to abort copy");
        }
        if let Err(e) = self.dest_store.delete(container, blob).await {
            warn!(blob, error = %e, "failed to delete incomplete copy");
        }
    }
}

impl TransferStrategy for BlobToBlob {
    fn name(&self) -> &'static str {
        "blob-to-blob"
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

/// Copy status of blobs in one container, as a pollable task keyed by
/// blob name.
pub struct BlobCopyStatus<'s> {
    store: &'s dyn BlobStore,
    container: &'s str,
}

impl<'s> BlobCopyStatus<'s> {
    pub fn new(store: &'s dyn BlobStore, container: &'s str) -> Self {
        Self { store, container }
    }
}

impl TaskStatusSource for BlobCopyStatus<'_> {
    type TaskId = str;

    fn task_status<'a>(&'a self, blob: &'a str) -> StatusFuture<'a> {
        Box::pin(async move {
            let state = self
                .store
                .copy_state(self.container, blob)
                .await
                .map_err(|e| PollError::Lookup {
                    task: blob.to_string(),
                    message: e.to_string(),
                })?;
            let state_text = if state.description.is_empty() {
                format!("{:?}", state.status).to_lowercase()
            } else {
                state.description
            };
            Ok(TaskStatus {
                id: 0,
                running: state.status == CopyStatus::Pending,
                finished: state.status.is_terminal(),
                success: state.status == CopyStatus::Success,
                state: state_text,
            })
        })
    }
}
