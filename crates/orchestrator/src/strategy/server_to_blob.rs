use std::sync::Arc;

use seqxfer_blob::BlobStore;
use seqxfer_protocol::{BlobStorage, ServerStorage};
use seqxfer_transfer::{ProgressReporter, TransferError};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Existing, TransferFuture, TransferStrategy, check_existing, local_existing, located, verify_size};
use crate::types::{TargetLocation, TransferOutcome, TransferSource};

/// Local filesystem to a blob container, as a block upload.
pub struct ServerToBlob {
    from: ServerStorage,
    to: BlobStorage,
    store: Arc<dyn BlobStore>,
}

impl ServerToBlob {
    pub fn new(from: ServerStorage, to: BlobStorage, store: Arc<dyn BlobStore>) -> Self {
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
            return Err(TransferError::FolderNotSupported("server-to-blob"));
        }
        let source_path = self.from.local_path(&source.relative_path);
        let local_size = match local_existing(&source_path)? {
            None => return Err(TransferError::SourceMissing(source_path.display().to_string())),
            Some((_, true)) => return Err(TransferError::FolderNotSupported("server-to-blob")),
            Some((size, false)) => size,
        };

        let container = &self.to.container;
        let location = format!("{}/{container}/{destination_path}", self.store.account());
        let found = self.store.properties(container, destination_path).await?;
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

        // A committed block list is visible at once; never upload the wrong size.
        verify_size(&source_path.display().to_string(), source.size, local_size)?;

        info!(source = %source_path.display(), destination = %location, "uploading");
        self.store
            .upload_file(container, destination_path, &source_path, progress, cancel)
            .await?;

        let uploaded = self
            .store
            .properties(container, destination_path)
            .await?
            .map_or(0, |p| p.size);
        if let Err(e) = verify_size(&location, source.size, uploaded) {
            warn!(destination = %location, error = %e, "deleting upload of unexpected size");
            self.store.delete(container, destination_path).await?;
            return Err(e);
        }
        Ok(located(
            &self.to.name,
            destination_path,
            source.size,
            TransferOutcome::Copied,
        ))
    }
}

impl TransferStrategy for ServerToBlob {
    fn name(&self) -> &'static str {
        "server-to-blob"
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

#[cfg(test)]
mod tests {
    use super::*;
    use seqxfer_blob::MemoryBlobService;
    use std::path::Path;

    fn strategy(root: &Path, service: &MemoryBlobService) -> ServerToBlob {
        let from = ServerStorage {
            id: 1,
            name: "shahlab".into(),
            directory: root.to_path_buf(),
            server_ip: None,
            username: None,
        };
        let to = BlobStorage {
            id: 2,
            name: "singlecellblob".into(),
            account: "singlecelldata".into(),
            container: "data".into(),
            credentials_env: "AZURE_STORAGE_KEY_SINGLECELLDATA".into(),
        };
        ServerToBlob::new(from, to, service.store("singlecelldata"))
    }

    fn source(path: &str, size: u64) -> TransferSource {
        TransferSource {
            relative_path: path.into(),
            size,
            is_folder: false,
        }
    }

    fn reporter() -> Arc<ProgressReporter> {
        Arc::new(ProgressReporter::new("test"))
    }

    #[tokio::test]
    async fn uploads_file() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("run42")).unwrap();
        std::fs::write(tmp.path().join("run42/SA1.bam"), b"0123456789").unwrap();
        let service = MemoryBlobService::new();
        let s = strategy(tmp.path(), &service);

        let loc = s
            .transfer(&source("run42/SA1.bam", 10), "run42/SA1.bam", reporter(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.outcome, TransferOutcome::Copied);
        assert_eq!(
            service.get("singlecelldata", "data", "run42/SA1.bam").unwrap(),
            b"0123456789"
        );
        assert_eq!(service.upload_count(), 1);
    }

    #[tokio::test]
    async fn identical_blob_is_not_uploaded_again() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bam"), b"0123456789").unwrap();
        let service = MemoryBlobService::new();
        service.put("singlecelldata", "data", "a.bam", b"0123456789".to_vec());
        let s = strategy(tmp.path(), &service);

        let loc = s
            .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.outcome, TransferOutcome::AlreadyPresent);
        assert_eq!(service.upload_count(), 0);
    }

    #[tokio::test]
    async fn different_blob_is_a_conflict() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bam"), b"0123456789").unwrap();
        let service = MemoryBlobService::new();
        service.put("singlecelldata", "data", "a.bam", b"012".to_vec());
        let s = strategy(tmp.path(), &service);

        let err = s
            .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DestinationConflict(_)));
        assert_eq!(service.get("singlecelldata", "data", "a.bam").unwrap(), b"012");
    }

    #[tokio::test]
    async fn missing_source_and_folders_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("lane1")).unwrap();
        let service = MemoryBlobService::new();
        let s = strategy(tmp.path(), &service);

        let err = s
            .transfer(&source("none.bam", 10), "none.bam", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceMissing(_)));

        let folder = TransferSource {
            relative_path: "lane1".into(),
            size: 0,
            is_folder: true,
        };
        let err = s
            .transfer(&folder, "lane1", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::FolderNotSupported("server-to-blob")));
    }

    #[tokio::test]
    async fn source_of_unexpected_size_is_not_uploaded() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bam"), b"012").unwrap();
        let service = MemoryBlobService::new();
        let s = strategy(tmp.path(), &service);

        for _ in 0..2 {
            let err = s
                .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                TransferError::VerificationFailed { expected: 10, actual: 3, .. }
            ));
            assert!(!service.contains("singlecelldata", "data", "a.bam"));
        }
        assert_eq!(service.upload_count(), 0);
    }

    #[tokio::test]
    async fn short_upload_is_deleted_and_retried() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bam"), b"0123456789").unwrap();
        let service = MemoryBlobService::new();
        service.truncate_writes(Some(4));
        let s = strategy(tmp.path(), &service);

        let err = s
            .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::VerificationFailed { expected: 10, actual: 4, .. }
        ));
        assert!(!service.contains("singlecelldata", "data", "a.bam"));

        service.truncate_writes(None);
        let loc = s
            .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.outcome, TransferOutcome::Copied);
    }

    #[tokio::test]
    async fn cancelled_upload_exposes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("a.bam"), b"0123456789").unwrap();
        let service = MemoryBlobService::new();
        let s = strategy(tmp.path(), &service);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = s
            .transfer(&source("a.bam", 10), "a.bam", reporter(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Cancelled));
        assert!(!service.contains("singlecelldata", "data", "a.bam"));
    }
}
