use std::path::{Component, Path};

use crate::TransferError;

/// Checks that a catalog-supplied path stays under its storage root.
///
/// The same string addresses a file under a server directory and a blob
/// name inside a container, so it must be relative, free of `..` and
/// free of NUL bytes. `./` segments are harmless and allowed.
pub fn validate_relative_path(path: &str) -> Result<(), TransferError> {
    let invalid = |why: &str| Err(TransferError::InvalidPath(format!("{why}: {path:?}")));

    if path.is_empty() {
        return invalid("empty path");
    }
    if path.contains('\0') {
        return invalid("NUL byte in path");
    }

    for component in Path::new(path).components() {
        match component {
            Component::Normal(_) | Component::CurDir => {}
            Component::ParentDir => return invalid("path leaves the storage root"),
            Component::RootDir | Component::Prefix(_) => {
                return invalid("path must be relative to the storage root");
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_dataset_paths() {
        for path in [
            "SA123.bam",
            "single_cell_indexing/bam/A90553C/SA1.bam.bai",
            "./SA123_R1.fastq.gz",
            "run42/lane1/",
        ] {
            assert!(validate_relative_path(path).is_ok(), "{path}");
        }
    }

    #[test]
    fn rejects_escaping_paths() {
        for path in ["", "..", "../../../etc/passwd", "run42/../../escape.bam", "/archive/SA123.bam"] {
            assert!(
                matches!(validate_relative_path(path), Err(TransferError::InvalidPath(_))),
                "{path}"
            );
        }
    }

    #[test]
    fn rejects_nul_byte() {
        let err = validate_relative_path("run42/SA1\0.bam").unwrap_err();
        assert!(err.to_string().contains("NUL"));
    }
}
