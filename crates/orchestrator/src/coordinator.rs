//! Batch transfers of every file carrying a tag.
//!
//! Per-file failures are recorded in the [`BatchReport`] and never stop
//! the other files; only storage resolution and strategy selection abort
//! a batch. Nothing is retried automatically: rerunning the batch is the
//! retry, and files already recorded at the destination are skipped.

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::StreamExt;
use futures_util::stream;
use seqxfer_catalog::{Catalog, CatalogError};
use seqxfer_protocol::{FileResource, Storage, StorageDescriptor};
use seqxfer_transfer::{ProgressReporter, validate_relative_path};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::dispatch::{Dispatcher, descriptors};
use crate::error::{ErrorKind, OrchestratorError};
use crate::strategy::TransferStrategy;
use crate::types::{
    BatchReport, CoordinatorOptions, FileFailure, TransferEvent, TransferOutcome, TransferSource,
};

/// Everything resolved once per batch.
struct Batch<'a> {
    tag: &'a str,
    from: StorageDescriptor,
    to: StorageDescriptor,
    to_storage: &'a Storage,
    strategy: &'a dyn TransferStrategy,
}

enum FileOutcome {
    Transferred,
    Skipped,
}

/// Transfers tagged batches between storages and records the results in
/// the catalog.
pub struct Coordinator {
    catalog: Arc<dyn Catalog>,
    dispatcher: Dispatcher,
    options: CoordinatorOptions,
    events_tx: mpsc::Sender<TransferEvent>,
    events_rx: Option<mpsc::Receiver<TransferEvent>>,
    cancel: CancellationToken,
}

impl Coordinator {
    pub fn new(catalog: Arc<dyn Catalog>, dispatcher: Dispatcher, options: CoordinatorOptions) -> Self {
        let (events_tx, events_rx) = mpsc::channel(256);
        Self {
            catalog,
            dispatcher,
            options,
            events_tx,
            events_rx: Some(events_rx),
            cancel: CancellationToken::new(),
        }
    }

    /// Takes the event receiver. Can only be called once.
    pub fn take_events(&mut self) -> Option<mpsc::Receiver<TransferEvent>> {
        self.events_rx.take()
    }

    /// Cancelling this token stops the batch; files not yet done are
    /// reported as cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Transfers every file tagged `tag` from storage `from` to storage `to`.
    ///
    /// Returns the report even when some files failed; use
    /// [`BatchReport::into_result`] to treat that as an error.
    pub async fn transfer(
        &self,
        tag: &str,
        from: &str,
        to: &str,
    ) -> Result<BatchReport, OrchestratorError> {
        let from_storage = self.storage(from).await?;
        let to_storage = self.storage(to).await?;
        let strategy = self.dispatcher.select(&from_storage, &to_storage)?;

        let (from_desc, to_desc) = descriptors(&from_storage, &to_storage)?;
        let batch = Batch {
            tag,
            from: from_desc,
            to: to_desc,
            to_storage: &to_storage,
            strategy: strategy.as_ref(),
        };

        let resources = unique(self.catalog.list_resources_for_tag(tag).await?);
        info!(
            tag,
            from,
            to,
            files = resources.len(),
            strategy = strategy.name(),
            "starting transfer"
        );

        let batch = &batch;
        let outcomes: Vec<Result<FileOutcome, FileFailure>> = stream::iter(&resources)
            .map(|resource| self.transfer_one(batch, resource))
            .buffer_unordered(self.options.concurrency.max(1))
            .collect()
            .await;

        let mut report = BatchReport {
            tag: tag.to_string(),
            ..Default::default()
        };
        for outcome in outcomes {
            match outcome {
                Ok(FileOutcome::Transferred) => report.transferred += 1,
                Ok(FileOutcome::Skipped) => report.skipped += 1,
                Err(failure) => report.failed.push(failure),
            }
        }
        report.failed.sort_by_key(|f| f.resource_id);

        if report.is_success() {
            info!(
                tag,
                transferred = report.transferred,
                skipped = report.skipped,
                "transfer finished"
            );
        } else {
            warn!(
                tag,
                transferred = report.transferred,
                skipped = report.skipped,
                failed = report.failed.len(),
                "transfer finished with failures"
            );
        }
        Ok(report)
    }

    async fn storage(&self, name: &str) -> Result<Storage, OrchestratorError> {
        match self.catalog.get_storage(name).await {
            Ok(storage) => Ok(storage),
            Err(CatalogError::NotFound { .. }) => {
                Err(OrchestratorError::StorageNotFound(name.to_string()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn transfer_one(
        &self,
        batch: &Batch<'_>,
        resource: &FileResource,
    ) -> Result<FileOutcome, FileFailure> {
        let result = self.try_transfer_one(batch, resource).await;
        match &result {
            Ok(FileOutcome::Skipped) => self.emit(TransferEvent::Skipped {
                resource_id: resource.id,
                filename: resource.filename.clone(),
            }),
            Ok(FileOutcome::Transferred) => {}
            Err(failure) => {
                error!(
                    tag = batch.tag,
                    file = %resource.filename,
                    kind = %failure.kind,
                    error = %failure.message,
                    "file transfer failed"
                );
                self.emit(TransferEvent::Failed {
                    resource_id: resource.id,
                    filename: resource.filename.clone(),
                    kind: failure.kind,
                    error: failure.message.clone(),
                });
            }
        }
        result
    }

    async fn try_transfer_one(
        &self,
        batch: &Batch<'_>,
        resource: &FileResource,
    ) -> Result<FileOutcome, FileFailure> {
        let fail = |kind: ErrorKind, message: String| FileFailure {
            resource_id: resource.id,
            filename: resource.filename.clone(),
            kind,
            message,
        };

        if self.cancel.is_cancelled() {
            return Err(fail(ErrorKind::Cancelled, "batch cancelled".into()));
        }

        let instances = self
            .catalog
            .list_file_instances(resource)
            .await
            .map_err(|e| fail(ErrorKind::Catalog, e.to_string()))?;

        if instances.iter().any(|i| i.is_on(&batch.to)) {
            info!(tag = batch.tag, file = %resource.filename, to = batch.to.name(), "already at destination, skipping");
            return Ok(FileOutcome::Skipped);
        }

        let Some(source_instance) = instances.iter().find(|i| i.is_on(&batch.from)) else {
            return Err(fail(
                ErrorKind::SourceMissing,
                format!(
                    "no instance of {} on {}",
                    resource.filename,
                    batch.from.name()
                ),
            ));
        };

        let relative_path = source_instance.relative_path(resource).to_string();
        validate_relative_path(&relative_path).map_err(|e| fail(ErrorKind::from(&e), e.to_string()))?;
        let source = TransferSource {
            relative_path: relative_path.clone(),
            size: resource.size,
            is_folder: resource.is_folder,
        };

        self.emit(TransferEvent::Started {
            resource_id: resource.id,
            filename: resource.filename.clone(),
        });
        info!(
            tag = batch.tag,
            file = %resource.filename,
            path = %relative_path,
            size = resource.size,
            "transferring"
        );

        let progress = Arc::new(self.progress_reporter(&resource.filename));
        let location = batch
            .strategy
            .transfer(&source, &relative_path, progress, self.cancel.child_token())
            .await
            .map_err(|e| fail(ErrorKind::from(&e), e.to_string()))?;

        self.catalog
            .get_or_create_file_instance(resource, batch.to_storage, Some(&location.relative_path))
            .await
            .map_err(|e| fail(ErrorKind::Catalog, e.to_string()))?;

        // Recorded, but nothing moved.
        if location.outcome == TransferOutcome::AlreadyPresent {
            debug!(file = %resource.filename, "identical copy found at destination");
            return Ok(FileOutcome::Skipped);
        }

        self.emit(TransferEvent::Completed {
            resource_id: resource.id,
            filename: resource.filename.clone(),
            size: location.size,
        });
        Ok(FileOutcome::Transferred)
    }

    fn progress_reporter(&self, label: &str) -> ProgressReporter {
        let reporter = ProgressReporter::new(label).with_interval(self.options.progress_interval);
        match &self.options.progress_sink {
            Some(sink) => reporter.with_sink(Arc::clone(sink)),
            None => reporter,
        }
    }

    fn emit(&self, event: TransferEvent) {
        // Nobody may be listening; events are best effort.
        if let Err(e) = self.events_tx.try_send(event) {
            debug!(error = %e, "transfer event dropped");
        }
    }
}

/// Drops repeated resources, keeping the first occurrence.
fn unique(resources: Vec<FileResource>) -> Vec<FileResource> {
    let mut seen = HashSet::new();
    resources
        .into_iter()
        .filter(|r| seen.insert(r.id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use seqxfer_blob::MemoryBlobService;
    use seqxfer_catalog::MemoryCatalog;
    use seqxfer_protocol::StorageKind;
    use crate::types::StrategyOptions;

    fn resource(id: i64, name: &str, size: u64) -> FileResource {
        FileResource {
            id,
            filename: name.into(),
            size,
            created: None,
            is_folder: false,
        }
    }

    fn coordinator(catalog: Arc<MemoryCatalog>) -> Coordinator {
        let dispatcher = Dispatcher::new(Arc::new(MemoryBlobService::new()), StrategyOptions::default());
        Coordinator::new(catalog, dispatcher, CoordinatorOptions::default())
    }

    #[test]
    fn repeated_resources_are_dropped() {
        let list = vec![resource(1, "a", 1), resource(2, "b", 1), resource(1, "a", 1)];
        let ids: Vec<_> = unique(list).into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1, 2]);
    }

    #[tokio::test]
    async fn unknown_storage_aborts_batch() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_storage(Storage::server(1, "shahlab", "/archive"));
        let err = coordinator(catalog)
            .transfer("run42", "shahlab", "nowhere")
            .await
            .unwrap_err();
        match err {
            OrchestratorError::StorageNotFound(name) => assert_eq!(name, "nowhere"),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn unsupported_kind_aborts_batch() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_storage(Storage::server(1, "shahlab", "/archive"));
        let mut tape = Storage::server(2, "vault", "/vault");
        tape.kind = StorageKind::Other("tape".into());
        catalog.add_storage(tape);

        let err = coordinator(catalog)
            .transfer("run42", "shahlab", "vault")
            .await
            .unwrap_err();
        assert!(matches!(err, OrchestratorError::UnsupportedTransferKind { .. }));
    }

    #[tokio::test]
    async fn missing_source_instance_is_recorded() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_storage(Storage::server(1, "shahlab", "/archive"));
        catalog.add_storage(Storage::blob(2, "singlecellblob", "singlecelldata", "data"));
        catalog.add_resource("run42", resource(7, "SA7.bam", 10));

        let mut c = coordinator(catalog.clone());
        let mut events = c.take_events().unwrap();
        let report = c.transfer("run42", "shahlab", "singlecellblob").await.unwrap();

        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].kind, ErrorKind::SourceMissing);
        assert_eq!(report.failed[0].resource_id, 7);
        assert!(matches!(
            events.try_recv().unwrap(),
            TransferEvent::Failed { kind: ErrorKind::SourceMissing, .. }
        ));
        assert_eq!(catalog.created_instances(), 0);
    }

    #[tokio::test]
    async fn cancelled_batch_marks_files_cancelled() {
        let catalog = Arc::new(MemoryCatalog::new());
        catalog.add_storage(Storage::server(1, "shahlab", "/archive"));
        catalog.add_storage(Storage::blob(2, "singlecellblob", "singlecelldata", "data"));
        catalog.add_resource("run42", resource(1, "a.bam", 10));
        catalog.add_resource("run42", resource(2, "b.bam", 10));

        let c = coordinator(catalog);
        c.cancel_token().cancel();
        let report = c.transfer("run42", "shahlab", "singlecellblob").await.unwrap();
        assert_eq!(report.failed.len(), 2);
        assert!(report.failed.iter().all(|f| f.kind == ErrorKind::Cancelled));
    }
}
