//! Cross-host copies with rsync.
//!
//! rsync runs on the destination host and pulls from `user@host:path`.
//! Progress is scraped from `--progress` output.

use std::ffi::OsString;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;
use std::sync::Arc;

use seqxfer_transfer::{ProgressReporter, TransferError};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Boxed future returned by [`RemoteCopy::copy`].
pub type CopyFuture<'a> = Pin<Box<dyn Future<Output = Result<(), TransferError>> + Send + 'a>>;

/// Boxed future returned by [`RemoteCopy::exists`].
pub type ExistsFuture<'a> = Pin<Box<dyn Future<Output = Result<bool, TransferError>> + Send + 'a>>;

/// Exit status rsync uses when the source vanished or was never there.
const PARTIAL_TRANSFER_EXIT: i32 = 23;

/// One remote copy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteCopyRequest {
    /// rsync location, e.g. `user@10.0.0.5:/archive/run42/SA1.bam`.
    pub source: String,
    /// Local path the copy is written to.
    pub destination: PathBuf,
    pub recursive: bool,
    /// Expected size, used as the progress total.
    pub expected_size: u64,
}

/// Runs remote copies. Mocked in tests.
pub trait RemoteCopy: Send + Sync {
    /// Whether `source` (`user@host:path`) is there to be copied.
    fn exists<'a>(&'a self, source: &'a str, cancel: CancellationToken) -> ExistsFuture<'a>;

    fn copy<'a>(
        &'a self,
        request: &'a RemoteCopyRequest,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> CopyFuture<'a>;
}

/// Spawns the rsync binary.
#[derive(Debug, Clone)]
pub struct Rsync {
    binary: PathBuf,
}

impl Rsync {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    /// Command-line arguments for `request`.
    ///
    /// Files end up 0444, directories 0555; symlinks are copied as the
    /// files they point to.
    pub fn args(request: &RemoteCopyRequest) -> Vec<OsString> {
        let mut args: Vec<OsString> = [
            "--progress",
            "--chmod=D555",
            "--chmod=F444",
            "--times",
            "--copy-links",
        ]
        .into_iter()
        .map(OsString::from)
        .collect();

        if request.recursive {
            args.push("-r".into());
            args.push(with_trailing_slash(&request.source).into());
            let mut dest = request.destination.clone().into_os_string();
            dest.push("/");
            args.push(dest);
        } else {
            args.push(request.source.clone().into());
            args.push(request.destination.clone().into_os_string());
        }
        args
    }

    /// `rsync --list-only`: exit 0 means the source is there.
    async fn list(&self, source: &str, cancel: CancellationToken) -> Result<bool, TransferError> {
        debug!(source, "listing remote source");
        let listing = Command::new(&self.binary)
            .arg("--list-only")
            .arg(source)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(TransferError::Cancelled),
            output = listing => output.map_err(|e| self.start_failed(e))?,
        };
        if output.status.success() {
            return Ok(true);
        }
        let message = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if is_missing_source(output.status.code(), &message) {
            return Ok(false);
        }
        Err(self.exit_failed(output.status, &message))
    }

    fn start_failed(&self, e: std::io::Error) -> TransferError {
        TransferError::Command(format!("failed to start {}: {e}", self.binary.display()))
    }

    fn exit_failed(&self, status: std::process::ExitStatus, message: &str) -> TransferError {
        TransferError::Command(format!(
            "{} exited with {status}: {message}",
            self.binary.display()
        ))
    }

    async fn run(
        &self,
        request: &RemoteCopyRequest,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> Result<(), TransferError> {
        info!(
            source = %request.source,
            destination = %request.destination.display(),
            recursive = request.recursive,
            "starting rsync"
        );
        let mut child = Command::new(&self.binary)
            .args(Self::args(request))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| self.start_failed(e))?;

        let stdout = child.stdout.take();
        let stderr = child.stderr.take();
        let total = request.expected_size;
        let progress_for_output = Arc::clone(&progress);

        let finished = async move {
            let (pumped, errors, status) = tokio::join!(
                pump_progress(stdout, &progress_for_output, total, !request.recursive),
                read_all(stderr),
                child.wait()
            );
            if let Err(e) = pumped {
                debug!(error = %e, "failed to read rsync output");
            }
            (errors, status)
        };

        // Dropping the child on cancel kills rsync.
        let (stderr, status) = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                warn!(source = %request.source, "rsync cancelled");
                return Err(TransferError::Cancelled);
            }
            done = finished => done,
        };
        let status = status?;

        if status.success() {
            progress.finish(total, total);
            return Ok(());
        }

        let message = stderr.trim();
        if is_missing_source(status.code(), message) {
            return Err(TransferError::SourceMissing(request.source.clone()));
        }
        Err(self.exit_failed(status, message))
    }
}

impl Default for Rsync {
    fn default() -> Self {
        Self::new("rsync")
    }
}

impl RemoteCopy for Rsync {
    fn exists<'a>(&'a self, source: &'a str, cancel: CancellationToken) -> ExistsFuture<'a> {
        Box::pin(self.list(source, cancel))
    }

    fn copy<'a>(
        &'a self,
        request: &'a RemoteCopyRequest,
        progress: Arc<ProgressReporter>,
        cancel: CancellationToken,
    ) -> CopyFuture<'a> {
        Box::pin(self.run(request, progress, cancel))
    }
}

fn is_missing_source(code: Option<i32>, stderr: &str) -> bool {
    code == Some(PARTIAL_TRANSFER_EXIT) && stderr.contains("No such file or directory")
}

fn with_trailing_slash(path: &str) -> String {
    if path.ends_with('/') {
        path.to_string()
    } else {
        format!("{path}/")
    }
}

/// Bytes transferred so far, from one `--progress` line such as
/// `  1,234,567  45%  10.00MB/s    0:00:12`.
pub fn parse_progress_line(line: &str) -> Option<u64> {
    let mut fields = line.split_whitespace();
    let bytes = fields.next()?;
    if !fields.next()?.ends_with('%') {
        return None;
    }
    bytes.replace(',', "").parse().ok()
}

async fn pump_progress<R: AsyncRead + Unpin>(
    output: Option<R>,
    progress: &ProgressReporter,
    total: u64,
    report: bool,
) -> std::io::Result<()> {
    let Some(mut output) = output else {
        return Ok(());
    };
    let mut line = Vec::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = output.read(&mut buf).await?;
        if n == 0 {
            return Ok(());
        }
        for &b in &buf[..n] {
            if b != b'\r' && b != b'\n' {
                line.push(b);
                continue;
            }
            // Folder copies report per file; only the overall finish counts.
            if report && let Some(bytes) = parse_progress_line(&String::from_utf8_lossy(&line)) {
                progress.report(bytes, total);
            }
            line.clear();
        }
    }
}

async fn read_all<R: AsyncRead + Unpin>(output: Option<R>) -> String {
    let mut text = String::new();
    if let Some(mut output) = output
        && let Err(e) = output.read_to_string(&mut text).await
    {
        debug!(error = %e, "failed to read rsync stderr");
    }
    text
}
