//! Staged local copies.
//!
//! Bytes are written to a hidden sibling of the target and moved into
//! place only once complete, so an interrupted copy never leaves a partial
//! object at the target path. The final move never replaces an existing
//! target.

use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::chunked::ChunkReader;
use crate::permissions::{ensure_dir, restrict_tree, set_read_only_file, unrestrict_tree};
use crate::progress::ProgressReporter;
use crate::TransferError;

/// Hidden, unique sibling path used to stage `target`.
pub fn staging_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(
        ".{name}.partial-{}",
        uuid::Uuid::new_v4().simple()
    ))
}

/// Total size of a file, or of every file below a directory.
///
/// Symlinks are followed.
pub fn path_size(path: &Path) -> io::Result<u64> {
    let meta = std::fs::metadata(path)?;
    if !meta.is_dir() {
        return Ok(meta.len());
    }
    let mut total = 0;
    for entry in std::fs::read_dir(path)? {
        total += path_size(&entry?.path())?;
    }
    Ok(total)
}

/// A staging location for `target`; removed on drop unless committed.
pub struct StagedTarget {
    target: PathBuf,
    temp: PathBuf,
    committed: bool,
}

impl StagedTarget {
    /// Reserves a staging path next to `target`, creating parent
    /// directories as needed.
    pub fn new(target: &Path) -> io::Result<Self> {
        if let Some(parent) = target.parent() {
            ensure_dir(parent)?;
        }
        Ok(Self {
            target: target.to_path_buf(),
            temp: staging_path(target),
            committed: false,
        })
    }

    /// Where the bytes should be written.
    pub fn path(&self) -> &Path {
        &self.temp
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    /// Moves the staged object into place.
    ///
    /// Fails with [`io::ErrorKind::AlreadyExists`] if something already
    /// occupies the target.
    pub fn commit(mut self) -> io::Result<()> {
        if self.temp.is_dir() {
            if self.target.exists() {
                return Err(already_exists(&self.target));
            }
            std::fs::rename(&self.temp, &self.target)?;
            self.committed = true;
            return Ok(());
        }

        match std::fs::hard_link(&self.temp, &self.target) {
            Ok(()) => {
                self.committed = true;
                if let Err(e) = std::fs::remove_file(&self.temp) {
                    warn!(path = %self.temp.display(), error = %e, "failed to remove staging link");
                }
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => Err(e),
            Err(e) => {
                // Filesystems without hard links: check, then rename.
                debug!(error = %e, "hard link unavailable, falling back to rename");
                if self.target.exists() {
                    return Err(already_exists(&self.target));
                }
                std::fs::rename(&self.temp, &self.target)?;
                self.committed = true;
                Ok(())
            }
        }
    }
}

impl Drop for StagedTarget {
    fn drop(&mut self) {
        if self.committed {
            return;
        }
        let result = if self.temp.is_dir() {
            // rsync may already have restricted the staged tree.
            std::fs::remove_dir_all(&self.temp).or_else(|_| {
                unrestrict_tree(&self.temp)?;
                std::fs::remove_dir_all(&self.temp)
            })
        } else if self.temp.exists() {
            std::fs::remove_file(&self.temp)
        } else {
            Ok(())
        };
        match result {
            Ok(()) => debug!(path = %self.temp.display(), "discarded staged copy"),
            Err(e) => warn!(path = %self.temp.display(), error = %e, "failed to discard staged copy"),
        }
    }
}

fn already_exists(path: &Path) -> io::Error {
    io::Error::new(
        io::ErrorKind::AlreadyExists,
        format!("{} already exists", path.display()),
    )
}

/// Copies one regular file of `expected` bytes to `target` through a
/// staging file.
///
/// A source of any other size fails with
/// [`TransferError::VerificationFailed`] before anything is staged, and a
/// staged copy of the wrong size is discarded instead of committed. The
/// copy is left read-only. Returns the number of bytes copied. If a
/// concurrent writer committed the same target first with the same size,
/// that copy is accepted; a different size is a conflict.
pub fn copy_file(
    source: &Path,
    target: &Path,
    expected: u64,
    chunk_size: usize,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let mut reader = ChunkReader::new(source, chunk_size)?;
    let total = reader.file_size();
    if total != expected {
        return Err(size_mismatch(source, expected, total));
    }
    let stage = StagedTarget::new(target)?;

    let mut copied = 0;
    write_chunks(&mut reader, stage.path(), &mut copied, total, progress, cancel)?;
    let staged = std::fs::metadata(stage.path())?.len();
    if staged != expected {
        return Err(size_mismatch(target, expected, staged));
    }
    set_read_only_file(stage.path())?;
    progress.finish(copied, total);

    commit_or_reconcile(stage, copied, false)?;
    Ok(copied)
}

/// Copies a directory tree to `target` through a staging directory.
///
/// Symlinks are copied as the files they point to. Files end up read-only
/// and directories restricted once the tree is in place.
pub fn copy_tree(
    source: &Path,
    target: &Path,
    chunk_size: usize,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<u64, TransferError> {
    let total = path_size(source)?;
    let stage = StagedTarget::new(target)?;
    std::fs::create_dir(stage.path())?;

    let mut copied = 0;
    copy_dir_contents(
        source,
        stage.path(),
        chunk_size,
        &mut copied,
        total,
        progress,
        cancel,
    )?;
    progress.finish(copied, total);

    if commit_or_reconcile(stage, copied, true)? {
        restrict_tree(target)?;
    }
    Ok(copied)
}

fn copy_dir_contents(
    source: &Path,
    dest: &Path,
    chunk_size: usize,
    copied: &mut u64,
    total: u64,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    for entry in std::fs::read_dir(source)? {
        let entry = entry?;
        let from = entry.path();
        let to = dest.join(entry.file_name());
        if std::fs::metadata(&from)?.is_dir() {
            std::fs::create_dir(&to)?;
            copy_dir_contents(&from, &to, chunk_size, copied, total, progress, cancel)?;
        } else {
            let mut reader = ChunkReader::new(&from, chunk_size)?;
            write_chunks(&mut reader, &to, copied, total, progress, cancel)?;
            set_read_only_file(&to)?;
        }
    }
    Ok(())
}

fn write_chunks(
    reader: &mut ChunkReader,
    dest: &Path,
    copied: &mut u64,
    total: u64,
    progress: &ProgressReporter,
    cancel: &CancellationToken,
) -> Result<(), TransferError> {
    let mut out = File::create(dest)?;
    while let Some(chunk) = reader.next_chunk()? {
        if cancel.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        out.write_all(chunk)?;
        *copied += chunk.len() as u64;
        progress.report(*copied, total);
    }
    out.sync_all()?;
    Ok(())
}

fn size_mismatch(path: &Path, expected: u64, actual: u64) -> TransferError {
    TransferError::VerificationFailed {
        path: path.display().to_string(),
        expected,
        actual,
    }
}

/// Commits `stage`; on a lost race, accepts an equal-size winner.
///
/// Returns `true` if this copy is the one now at the target.
pub fn commit_or_reconcile(
    stage: StagedTarget,
    copied: u64,
    is_dir: bool,
) -> Result<bool, TransferError> {
    let target = stage.target().to_path_buf();
    match stage.commit() {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
            let existing = std::fs::metadata(&target)?;
            if is_dir || existing.len() == copied {
                debug!(path = %target.display(), "target committed concurrently with identical size");
                Ok(false)
            } else {
                Err(TransferError::DestinationConflict(format!(
                    "{} appeared during copy with {} bytes, expected {copied}",
                    target.display(),
                    existing.len()
                )))
            }
        }
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn reporter() -> ProgressReporter {
        ProgressReporter::new("test")
    }

    #[test]
    fn staging_path_is_hidden_sibling() {
        let p = staging_path(Path::new("/data/run42/SA1.bam"));
        assert_eq!(p.parent(), Some(Path::new("/data/run42")));
        let name = p.file_name().unwrap().to_string_lossy();
        assert!(name.starts_with(".SA1.bam.partial-"));
    }

    #[test]
    fn copy_file_places_read_only_copy() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.bam");
        std::fs::write(&src, b"0123456789").unwrap();
        let dst = tmp.path().join("dest").join("run42").join("src.bam");

        let n = copy_file(&src, &dst, 10, 3, &reporter(), &CancellationToken::new()).unwrap();
        assert_eq!(n, 10);
        assert_eq!(std::fs::read(&dst).unwrap(), b"0123456789");

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
            assert_eq!(mode, 0o444);
        }

        // No staging leftovers.
        let leftovers: Vec<_> = std::fs::read_dir(dst.parent().unwrap())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(leftovers.len(), 1);
    }

    #[test]
    fn cancelled_copy_leaves_nothing_behind() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.bam");
        std::fs::write(&src, b"0123456789").unwrap();
        let dest_dir = tmp.path().join("dest");
        let dst = dest_dir.join("src.bam");

        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = copy_file(&src, &dst, 10, 3, &reporter(), &cancel);
        assert!(matches!(result, Err(TransferError::Cancelled)));
        assert!(!dst.exists());
        assert_eq!(std::fs::read_dir(&dest_dir).unwrap().count(), 0);
    }

    #[test]
    fn source_of_unexpected_size_is_not_staged() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.bam");
        std::fs::write(&src, b"012").unwrap();
        let dest_dir = tmp.path().join("dest");
        let dst = dest_dir.join("src.bam");

        let result = copy_file(&src, &dst, 10, 4, &reporter(), &CancellationToken::new());
        assert!(matches!(
            result,
            Err(TransferError::VerificationFailed { expected: 10, actual: 3, .. })
        ));
        assert!(!dst.exists());
        assert!(!dest_dir.exists() || std::fs::read_dir(&dest_dir).unwrap().count() == 0);
    }

    #[test]
    fn commit_refuses_to_replace_different_size() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.bam");
        std::fs::write(&src, b"0123456789").unwrap();
        let dst = tmp.path().join("dst.bam");
        std::fs::write(&dst, b"other").unwrap();

        let result = copy_file(&src, &dst, 10, 4, &reporter(), &CancellationToken::new());
        assert!(matches!(result, Err(TransferError::DestinationConflict(_))));
        assert_eq!(std::fs::read(&dst).unwrap(), b"other");
    }

    #[test]
    fn commit_accepts_equal_size_winner() {
        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("src.bam");
        std::fs::write(&src, b"0123456789").unwrap();
        let dst = tmp.path().join("dst.bam");
        std::fs::write(&dst, b"9876543210").unwrap();

        let n = copy_file(&src, &dst, 10, 4, &reporter(), &CancellationToken::new()).unwrap();
        assert_eq!(n, 10);
        assert_eq!(std::fs::read(&dst).unwrap(), b"9876543210");
    }

    #[cfg(unix)]
    #[test]
    fn copy_tree_follows_symlinks_and_restricts_dirs() {
        use std::os::unix::fs::PermissionsExt;

        let tmp = tempfile::tempdir().unwrap();
        let src = tmp.path().join("lane_folder");
        std::fs::create_dir_all(src.join("sub")).unwrap();
        std::fs::write(src.join("a.fastq"), b"ACGT").unwrap();
        std::fs::write(tmp.path().join("outside.txt"), b"linked").unwrap();
        std::os::unix::fs::symlink(tmp.path().join("outside.txt"), src.join("sub").join("link.txt"))
            .unwrap();

        let dst = tmp.path().join("dest").join("lane_folder");
        let n = copy_tree(&src, &dst, 2, &reporter(), &CancellationToken::new()).unwrap();
        assert_eq!(n, 10);

        let link_copy = dst.join("sub").join("link.txt");
        assert!(!std::fs::symlink_metadata(&link_copy).unwrap().file_type().is_symlink());
        assert_eq!(std::fs::read(&link_copy).unwrap(), b"linked");

        let dir_mode = std::fs::metadata(&dst).unwrap().permissions().mode() & 0o777;
        assert_eq!(dir_mode, 0o555);

        // Restore write access so the temp dir can be cleaned up.
        for d in [dst.join("sub"), dst.clone()] {
            std::fs::set_permissions(&d, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
    }

    #[test]
    fn path_size_sums_tree() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("x/y")).unwrap();
        std::fs::write(tmp.path().join("x/a"), b"123").unwrap();
        std::fs::write(tmp.path().join("x/y/b"), b"45").unwrap();
        assert_eq!(path_size(&tmp.path().join("x")).unwrap(), 5);
    }
}
