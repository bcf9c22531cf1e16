use std::path::PathBuf;
use std::sync::Arc;

use seqxfer_protocol::ServerStorage;
use seqxfer_transfer::{
    ProgressReporter, StagedTarget, TransferError, commit_or_reconcile, copy_file, copy_tree,
    path_size,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::{
    Existing, TransferFuture, TransferStrategy, check_existing, local_existing, located,
    verify_size,
};
use crate::rsync::{RemoteCopy, RemoteCopyRequest};
use crate::types::{TargetLocation, TransferOutcome, TransferSource};

/// Filesystem to filesystem.
///
/// Runs on the destination host. Storages behind the same address are
/// copied locally; otherwise the source is pulled with [`RemoteCopy`].
pub struct ServerToServer {
    from: ServerStorage,
    to: ServerStorage,
    remote: Arc<dyn RemoteCopy>,
    chunk_size: usize,
}

impl ServerToServer {
    pub fn new(
        from: ServerStorage,
        to: ServerStorage,
        remote: Arc<dyn RemoteCopy>,
        chunk_size: usize,
    ) -> Self {
        Self {
            from,
            to,
            remote,
            chunk_size,
        }
    }

    async fn run(
        &self,
        source: &TransferSource,
        destination_path: &str,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<TargetLocation, TransferError> {
        let target = self.to.local_path(destination_path);
        let location = format!("{}:{destination_path}", self.to.name);
        let local = self.from.same_host(&self.to);
        let source_path = self.from.local_path(&source.relative_path);

        if local {
            if local_existing(&source_path)?.is_none() {
                return Err(TransferError::SourceMissing(source_path.display().to_string()));
            }
        } else {
            let remote_source = self.from.remote_location(&source.relative_path);
            if !self.remote.exists(&remote_source, cancel.clone()).await? {
                return Err(TransferError::SourceMissing(remote_source));
            }
        }

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

        if local {
            debug!(source = %source_path.display(), target = %target.display(), "local copy");
            self.copy_local(source_path, target.clone(), source, progress, cancel)
                .await?;
        } else {
            self.copy_remote(source, target.clone(), &location, progress, cancel)
                .await?;
        }

        if !source.is_folder {
            verify_size(&location, source.size, path_size(&target)?)?;
        }
        Ok(located(
            &self.to.name,
            destination_path,
            source.size,
            TransferOutcome::Copied,
        ))
    }

    async fn copy_local(
        &self,
        source_path: PathBuf,
        target: PathBuf,
        source: &TransferSource,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<u64, TransferError> {
        let chunk_size = self.chunk_size;
        let (is_folder, expected) = (source.is_folder, source.size);
        tokio::task::spawn_blocking(move || {
            if is_folder {
                copy_tree(&source_path, &target, chunk_size, &progress, &cancel)
            } else {
                copy_file(&source_path, &target, expected, chunk_size, &progress, &cancel)
            }
        })
        .await
        .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
    }

    async fn copy_remote(
        &self,
        source: &TransferSource,
        target: PathBuf,
        location: &str,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        let stage = StagedTarget::new(&target)?;
        let request = RemoteCopyRequest {
            source: self.from.remote_location(&source.relative_path),
            destination: stage.path().to_path_buf(),
            recursive: source.is_folder,
            expected_size: source.size,
        };
        self.remote.copy(&request, progress, cancel).await?;

        let copied = path_size(stage.path())?;
        if !source.is_folder {
            verify_size(location, source.size, copied)?;
        }
        tokio::task::spawn_blocking(move || commit_or_reconcile(stage, copied, request.recursive))
            .await
            .map_err(|e| TransferError::Io(std::io::Error::other(e)))??;
        Ok(())
    }
}

impl TransferStrategy for ServerToServer {
    fn name(&self) -> &'static str {
        "server-to-server"
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
    use crate::rsync::{CopyFuture, ExistsFuture};
    use std::path::Path;
    use std::sync::Mutex;

    /// Copies the file named after the host prefix, recording each request.
    #[derive(Default)]
    struct MockRemote {
        requests: Mutex<Vec<RemoteCopyRequest>>,
    }

    impl RemoteCopy for MockRemote {
        fn exists<'a>(&'a self, source: &'a str, _cancel: CancellationToken) -> ExistsFuture<'a> {
            Box::pin(async move {
                let (_, path) = source.split_once(':').unwrap();
                Ok(Path::new(path).exists())
            })
        }

        fn copy<'a>(
            &'a self,
            request: &'a RemoteCopyRequest,
            _progress: Arc<ProgressReporter>,
            _cancel: CancellationToken,
        ) -> CopyFuture<'a> {
            Box::pin(async move {
                self.requests.lock().unwrap().push(request.clone());
                let (_, path) = request.source.split_once(':').unwrap();
                if !Path::new(path).exists() {
                    return Err(TransferError::SourceMissing(request.source.clone()));
                }
                std::fs::copy(path, &request.destination)?;
                Ok(())
            })
        }
    }

    fn storages(root: &Path, remote_source: bool) -> (ServerStorage, ServerStorage) {
        let from = ServerStorage {
            id: 1,
            name: "shahlab".into(),
            directory: root.join("src"),
            server_ip: remote_source.then(|| "10.0.0.5".to_string()),
            username: remote_source.then(|| "jngo".to_string()),
        };
        let to = ServerStorage {
            id: 2,
            name: "juno".into(),
            directory: root.join("dst"),
            server_ip: None,
            username: None,
        };
        (from, to)
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

    fn strategy(root: &Path, remote_source: bool, remote: Arc<MockRemote>) -> ServerToServer {
        let (from, to) = storages(root, remote_source);
        ServerToServer::new(from, to, remote, 4)
    }

    #[tokio::test]
    async fn local_copy() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/run42")).unwrap();
        std::fs::write(tmp.path().join("src/run42/SA1.bam"), b"0123456789").unwrap();
        let remote = Arc::new(MockRemote::default());
        let s = strategy(tmp.path(), false, remote.clone());

        let loc = s
            .transfer(&source("run42/SA1.bam", 10), "run42/SA1.bam", reporter(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(loc.outcome, TransferOutcome::Copied);
        assert_eq!(loc.storage, "juno");
        assert_eq!(
            std::fs::read(tmp.path().join("dst/run42/SA1.bam")).unwrap(),
            b"0123456789"
        );
        assert!(remote.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn local_folder_copy() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/run42/lane1")).unwrap();
        std::fs::write(tmp.path().join("src/run42/lane1/a.fq"), b"abc").unwrap();
        let s = strategy(tmp.path(), false, Arc::new(MockRemote::default()));
        let folder = TransferSource {
            relative_path: "run42/lane1".into(),
            size: 0,
            is_folder: true,
        };

        let loc = s
            .transfer(&folder, "run42/lane1", reporter(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.outcome, TransferOutcome::Copied);
        assert_eq!(
            std::fs::read(tmp.path().join("dst/run42/lane1/a.fq")).unwrap(),
            b"abc"
        );

        // A second copy finds the directory in place.
        let again = s
            .transfer(&folder, "run42/lane1", reporter(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(again.outcome, TransferOutcome::AlreadyPresent);
    }

    #[tokio::test]
    async fn missing_local_source() {
        let tmp = tempfile::tempdir().unwrap();
        let s = strategy(tmp.path(), false, Arc::new(MockRemote::default()));
        let err = s
            .transfer(&source("run42/none.bam", 10), "run42/none.bam", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn existing_destination_is_compared() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::create_dir_all(tmp.path().join("dst")).unwrap();
        std::fs::write(tmp.path().join("src/a.bam"), b"0123456789").unwrap();
        std::fs::write(tmp.path().join("dst/a.bam"), b"0123456789").unwrap();
        std::fs::write(tmp.path().join("src/b.bam"), b"0123456789").unwrap();
        std::fs::write(tmp.path().join("dst/b.bam"), b"01234").unwrap();
        let s = strategy(tmp.path(), false, Arc::new(MockRemote::default()));

        let same = s
            .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(same.outcome, TransferOutcome::AlreadyPresent);

        let err = s
            .transfer(&source("b.bam", 10), "b.bam", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::DestinationConflict(_)));
        assert_eq!(std::fs::read(tmp.path().join("dst/b.bam")).unwrap(), b"01234");
    }

    #[tokio::test]
    async fn remote_copy_goes_through_staging() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src/run42")).unwrap();
        std::fs::write(tmp.path().join("src/run42/SA1.bam"), b"0123456789").unwrap();
        let remote = Arc::new(MockRemote::default());
        let s = strategy(tmp.path(), true, remote.clone());

        let loc = s
            .transfer(&source("run42/SA1.bam", 10), "run42/SA1.bam", reporter(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(loc.outcome, TransferOutcome::Copied);

        let requests = remote.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].source.starts_with("jngo@10.0.0.5:"));
        assert!(requests[0].source.ends_with("src/run42/SA1.bam"));
        let staged = requests[0].destination.file_name().unwrap().to_string_lossy();
        assert!(staged.starts_with(".SA1.bam.partial-"));
        assert!(!requests[0].destination.exists());
        assert_eq!(
            std::fs::read(tmp.path().join("dst/run42/SA1.bam")).unwrap(),
            b"0123456789"
        );
    }

    #[tokio::test]
    async fn remote_size_mismatch_fails_verification() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/a.bam"), b"012").unwrap();
        let s = strategy(tmp.path(), true, Arc::new(MockRemote::default()));

        let err = s
            .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::VerificationFailed { expected: 10, actual: 3, .. }
        ));
        assert!(!tmp.path().join("dst/a.bam").exists());
    }

    #[tokio::test]
    async fn remote_missing_source_is_not_copied() {
        let tmp = tempfile::tempdir().unwrap();
        let remote = Arc::new(MockRemote::default());
        let s = strategy(tmp.path(), true, remote.clone());

        let err = s
            .transfer(&source("run42/x.bam", 10), "run42/x.bam", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceMissing(_)));
        assert!(remote.requests.lock().unwrap().is_empty());
        assert!(!tmp.path().join("dst/run42").exists());
    }

    #[tokio::test]
    async fn remote_missing_source_fails_even_with_matching_destination() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("dst")).unwrap();
        std::fs::write(tmp.path().join("dst/a.bam"), b"0123456789").unwrap();
        let s = strategy(tmp.path(), true, Arc::new(MockRemote::default()));

        let err = s
            .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::SourceMissing(_)));
    }

    #[tokio::test]
    async fn local_size_mismatch_leaves_destination_absent() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("src")).unwrap();
        std::fs::write(tmp.path().join("src/a.bam"), b"012").unwrap();
        let s = strategy(tmp.path(), false, Arc::new(MockRemote::default()));

        for _ in 0..2 {
            let err = s
                .transfer(&source("a.bam", 10), "a.bam", reporter(), CancellationToken::new())
                .await
                .unwrap_err();
            assert!(matches!(
                err,
                TransferError::VerificationFailed { expected: 10, actual: 3, .. }
            ));
            assert!(!tmp.path().join("dst/a.bam").exists());
        }
    }
}
