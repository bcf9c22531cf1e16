//! Permission scheme for stored artifacts.
//!
//! Instanced files are immutable: regular files end up `0444`, directories
//! of a folder resource `0555`. Parent directories created on the way are
//! group-writable (`0775`) so other operators can add siblings.

use std::io;
use std::path::Path;

/// Mode of a stored regular file.
pub const READ_ONLY_FILE_MODE: u32 = 0o444;

/// Mode of a directory inside a stored folder resource.
pub const READ_ONLY_DIR_MODE: u32 = 0o555;

/// Mode of parent directories created to hold new artifacts.
pub const STAGING_DIR_MODE: u32 = 0o775;

/// Creates `path` and any missing ancestors with [`STAGING_DIR_MODE`].
pub fn ensure_dir(path: &Path) -> io::Result<()> {
    if path.is_dir() {
        return Ok(());
    }
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        ensure_dir(parent)?;
    }
    match std::fs::create_dir(path) {
        Ok(()) => set_mode(path, STAGING_DIR_MODE),
        Err(e) if e.kind() == io::ErrorKind::AlreadyExists && path.is_dir() => Ok(()),
        Err(e) => Err(e),
    }
}

/// Makes a regular file read-only for everyone.
pub fn set_read_only_file(path: &Path) -> io::Result<()> {
    set_mode(path, READ_ONLY_FILE_MODE)
}

/// Restricts every directory under (and including) `root` to
/// [`READ_ONLY_DIR_MODE`], children first.
pub fn restrict_tree(root: &Path) -> io::Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            restrict_tree(&entry.path())?;
        }
    }
    set_mode(root, READ_ONLY_DIR_MODE)
}

/// Makes every directory under (and including) `root` writable again,
/// parents first. Used to discard restricted staging trees.
pub fn unrestrict_tree(root: &Path) -> io::Result<()> {
    if !root.is_dir() {
        return Ok(());
    }
    set_mode(root, STAGING_DIR_MODE)?;
    for entry in std::fs::read_dir(root)? {
        let entry = entry?;
        if entry.file_type()?.is_dir() {
            unrestrict_tree(&entry.path())?;
        }
    }
    Ok(())
}

fn set_mode(path: &Path, mode: u32) -> io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
    }
    #[cfg(not(unix))]
    {
        let mut perms = std::fs::metadata(path)?.permissions();
        perms.set_readonly(mode & 0o222 == 0);
        std::fs::set_permissions(path, perms)
    }
}
