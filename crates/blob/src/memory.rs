//! In-memory blob accounts.
//!
//! All stores handed out by one [`MemoryBlobService`] share a namespace, so
//! a server-side copy from one account into another resolves its source
//! URL against the same map. Counters record how often bytes actually
//! moved, which lets tests assert that a repeated run was a no-op.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::Utc;
use seqxfer_protocol::BlobStorage;
use seqxfer_transfer::ProgressReporter;
use tokio_util::sync::CancellationToken;

use crate::sas::{SasPermissions, SasToken, clamp_ttl};
use crate::{
    BlobConnector, BlobError, BlobFuture, BlobProperties, BlobStore, CopyState, CopyStatus,
};

const SCHEME: &str = "memory://";

type BlobKey = (String, String, String);

struct PendingCopy {
    id: String,
    polls_left: u32,
    data: Vec<u8>,
}

#[derive(Default)]
struct Inner {
    blobs: HashMap<BlobKey, Vec<u8>>,
    pending: HashMap<BlobKey, PendingCopy>,
    finished: HashMap<BlobKey, CopyState>,
    uploads: usize,
    downloads: usize,
    copies: usize,
    copy_polls: u32,
    fail_copies: bool,
    truncate_writes: Option<usize>,
    next_copy_id: u64,
}

/// Shared namespace of in-memory accounts.
#[derive(Clone, Default)]
pub struct MemoryBlobService {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self::default()
    }

    /// A store for `account`.
    pub fn store(&self, account: &str) -> Arc<MemoryBlobStore> {
        Arc::new(MemoryBlobStore {
            account: account.to_string(),
            service: self.clone(),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn put(&self, account: &str, container: &str, blob: &str, data: impl Into<Vec<u8>>) {
        self.lock().blobs.insert(key(account, container, blob), data.into());
    }

    pub fn get(&self, account: &str, container: &str, blob: &str) -> Option<Vec<u8>> {
        self.lock().blobs.get(&key(account, container, blob)).cloned()
    }

    pub fn contains(&self, account: &str, container: &str, blob: &str) -> bool {
        self.lock().blobs.contains_key(&key(account, container, blob))
    }

    /// Number of completed uploads.
    pub fn upload_count(&self) -> usize {
        self.lock().uploads
    }

    /// Number of completed downloads.
    pub fn download_count(&self) -> usize {
        self.lock().downloads
    }

    /// Number of server-side copies started.
    pub fn copy_count(&self) -> usize {
        self.lock().copies
    }

    /// Number of copy state reads that report `pending` before a copy
    /// completes.
    pub fn set_copy_polls(&self, polls: u32) {
        self.lock().copy_polls = polls;
    }

    /// Makes every subsequent server-side copy end in `failed`.
    pub fn fail_copies(&self, fail: bool) {
        self.lock().fail_copies = fail;
    }

    /// Cuts every later upload, download and server-side copy to at most
    /// `len` bytes, as a connection that silently lost data would.
    pub fn truncate_writes(&self, len: Option<usize>) {
        self.lock().truncate_writes = len;
    }

    /// True if a copy into the blob is still pending.
    pub fn copy_pending(&self, account: &str, container: &str, blob: &str) -> bool {
        self.lock().pending.contains_key(&key(account, container, blob))
    }
}

impl BlobConnector for MemoryBlobService {
    fn connect(&self, storage: &BlobStorage) -> Result<Arc<dyn BlobStore>, BlobError> {
        Ok(self.store(&storage.account))
    }
}

/// One in-memory account.
pub struct MemoryBlobStore {
    account: String,
    service: MemoryBlobService,
}

impl MemoryBlobStore {
    fn key(&self, container: &str, blob: &str) -> BlobKey {
        key(&self.account, container, blob)
    }
}

impl BlobStore for MemoryBlobStore {
    fn account(&self) -> &str {
        &self.account
    }

    fn properties<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
    ) -> BlobFuture<'a, Option<BlobProperties>> {
        Box::pin(async move {
            let key = self.key(container, blob);
            let inner = self.service.lock();
            if inner.pending.contains_key(&key) {
                return Ok(Some(BlobProperties { size: 0 }));
            }
            Ok(inner.blobs.get(&key).map(|data| BlobProperties {
                size: data.len() as u64,
            }))
        })
    }

    fn upload_file<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        source: &'a Path,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> BlobFuture<'a, u64> {
        Box::pin(async move {
            let mut data = tokio::fs::read(source).await?;
            if cancel.is_cancelled() {
                return Err(BlobError::Cancelled);
            }
            let total = data.len() as u64;
            progress.finish(total, total);
            let mut inner = self.service.lock();
            if let Some(len) = inner.truncate_writes {
                data.truncate(len);
            }
            inner.blobs.insert(self.key(container, blob), data);
            inner.uploads += 1;
            Ok(total)
        })
    }

    fn download_file<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        dest: &'a Path,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> BlobFuture<'a, u64> {
        Box::pin(async move {
            let (data, truncate) = {
                let inner = self.service.lock();
                let data = inner.blobs.get(&self.key(container, blob)).cloned();
                (data, inner.truncate_writes)
            };
            let mut data = data.ok_or_else(|| BlobError::Status {
                method: "GET",
                resource: format!("{container}/{blob}"),
                status: 404,
                message: "BlobNotFound".into(),
            })?;
            if cancel.is_cancelled() {
                return Err(BlobError::Cancelled);
            }
            if let Some(len) = truncate {
                data.truncate(len);
            }
            tokio::fs::write(dest, &data).await?;
            let total = data.len() as u64;
            progress.finish(total, total);
            self.service.lock().downloads += 1;
            Ok(total)
        })
    }

    fn container_read_token(&self, container: &str, ttl: Duration) -> Result<SasToken, BlobError> {
        let ttl = clamp_ttl(ttl);
        let expires_at = Utc::now() + chrono::Duration::seconds(ttl.as_secs() as i64);
        Ok(SasToken::opaque(
            format!("sr=c&sp=r&container={container}"),
            expires_at,
            SasPermissions::READ,
        ))
    }

    fn signed_url(&self, container: &str, blob: &str, token: &SasToken) -> String {
        format!("{SCHEME}{}/{container}/{blob}?{}", self.account, token.query())
    }

    fn start_copy<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        source_url: &'a str,
    ) -> BlobFuture<'a, CopyState> {
        Box::pin(async move {
            let source = parse_url(source_url)
                .ok_or_else(|| BlobError::Protocol(format!("unsupported source URL {source_url}")))?;
            let mut inner = self.service.lock();
            let mut data = inner.blobs.get(&source).cloned().ok_or_else(|| BlobError::Status {
                method: "PUT",
                resource: format!("{container}/{blob}"),
                status: 404,
                message: "CannotVerifyCopySource".into(),
            })?;
            if let Some(len) = inner.truncate_writes {
                data.truncate(len);
            }

            inner.copies += 1;
            inner.next_copy_id += 1;
            let id = format!("copy-{}", inner.next_copy_id);
            let dest = self.key(container, blob);
            inner.finished.remove(&dest);

            let polls = inner.copy_polls;
            if polls == 0 && !inner.fail_copies {
                inner.blobs.insert(dest.clone(), data);
                let state = CopyState {
                    id,
                    status: CopyStatus::Success,
                    description: String::new(),
                };
                inner.finished.insert(dest, state.clone());
                return Ok(state);
            }

            inner.pending.insert(
                dest,
                PendingCopy {
                    id: id.clone(),
                    polls_left: polls,
                    data,
                },
            );
            Ok(CopyState {
                id,
                status: CopyStatus::Pending,
                description: String::new(),
            })
        })
    }

    fn copy_state<'a>(&'a self, container: &'a str, blob: &'a str) -> BlobFuture<'a, CopyState> {
        Box::pin(async move {
            let dest = self.key(container, blob);
            let mut inner = self.service.lock();
            let fail = inner.fail_copies;

            if let Some(pending) = inner.pending.get_mut(&dest) {
                if pending.polls_left > 0 {
                    pending.polls_left -= 1;
                    return Ok(CopyState {
                        id: pending.id.clone(),
                        status: CopyStatus::Pending,
                        description: String::new(),
                    });
                }
                let Some(done) = inner.pending.remove(&dest) else {
                    return Err(BlobError::Protocol("pending copy vanished".into()));
                };
                let state = if fail {
                    CopyState {
                        id: done.id,
                        status: CopyStatus::Failed,
                        description: "500 InternalError: copy source unreachable".into(),
                    }
                } else {
                    inner.blobs.insert(dest.clone(), done.data);
                    CopyState {
                        id: done.id,
                        status: CopyStatus::Success,
                        description: String::new(),
                    }
                };
                inner.finished.insert(dest, state.clone());
                return Ok(state);
            }

            inner.finished.get(&dest).cloned().ok_or_else(|| BlobError::Status {
                method: "HEAD",
                resource: format!("{container}/{blob}"),
                status: 404,
                message: "BlobNotFound".into(),
            })
        })
    }

    fn abort_copy<'a>(
        &'a self,
        container: &'a str,
        blob: &'a str,
        copy_id: &'a str,
    ) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let dest = self.key(container, blob);
            let mut inner = self.service.lock();
            let pending = inner.pending.get(&dest).is_some_and(|p| p.id == copy_id);
            if !pending {
                return Err(BlobError::Status {
                    method: "PUT",
                    resource: format!("{container}/{blob}"),
                    status: 409,
                    message: "NoPendingCopyOperation".into(),
                });
            }
            inner.pending.remove(&dest);
            inner.finished.insert(
                dest,
                CopyState {
                    id: copy_id.to_string(),
                    status: CopyStatus::Aborted,
                    description: String::new(),
                },
            );
            Ok(())
        })
    }

    fn delete<'a>(&'a self, container: &'a str, blob: &'a str) -> BlobFuture<'a, ()> {
        Box::pin(async move {
            let dest = self.key(container, blob);
            let mut inner = self.service.lock();
            inner.blobs.remove(&dest);
            inner.pending.remove(&dest);
            inner.finished.remove(&dest);
            Ok(())
        })
    }
}

fn key(account: &str, container: &str, blob: &str) -> BlobKey {
    (account.to_string(), container.to_string(), blob.to_string())
}

fn parse_url(url: &str) -> Option<BlobKey> {
    let rest = url.strip_prefix(SCHEME)?;
    let path = rest.split('?').next()?;
    let (account, rest) = path.split_once('/')?;
    let (container, blob) = rest.split_once('/')?;
    if blob.is_empty() {
        return None;
    }
    Some(key(account, container, blob))
}
