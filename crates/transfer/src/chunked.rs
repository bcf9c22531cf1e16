use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::{DEFAULT_CHUNK_SIZE, TransferError};

/// Reads a file front to back through one reused buffer.
///
/// Source files are immutable, so the size seen at open time is the size
/// that must be read. A file that ends early fails with
/// [`TransferError::VerificationFailed`] instead of yielding a short copy.
pub struct ChunkReader {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    offset: u64,
    file_size: u64,
}

impl ChunkReader {
    /// Opens `path`. A `chunk_size` of 0 means [`DEFAULT_CHUNK_SIZE`].
    pub fn new(path: &Path, chunk_size: usize) -> Result<Self, TransferError> {
        let file = File::open(path)?;
        let file_size = file.metadata()?.len();
        let chunk_size = match chunk_size {
            0 => DEFAULT_CHUNK_SIZE,
            n => n,
        };
        // No point holding more than the whole file.
        let buf_len = (file_size.min(chunk_size as u64) as usize).max(1);
        Ok(Self {
            file,
            path: path.to_path_buf(),
            buf: vec![0; buf_len],
            offset: 0,
            file_size,
        })
    }

    /// Next slice of the file, or `None` once `file_size` bytes were read.
    pub fn next_chunk(&mut self) -> Result<Option<&[u8]>, TransferError> {
        let want = self.remaining().min(self.buf.len() as u64) as usize;
        if want == 0 {
            return Ok(None);
        }

        let mut filled = 0;
        while filled < want {
            match self.file.read(&mut self.buf[filled..want])? {
                0 => {
                    return Err(TransferError::VerificationFailed {
                        path: self.path.display().to_string(),
                        expected: self.file_size,
                        actual: self.offset + filled as u64,
                    });
                }
                n => filled += n,
            }
        }
        self.offset += filled as u64;
        Ok(Some(&self.buf[..filled]))
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size at open time.
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    pub fn remaining(&self) -> u64 {
        self.file_size.saturating_sub(self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn fixture(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, data).unwrap();
        path
    }

    #[test]
    fn reads_whole_file_in_chunks() {
        let dir = TempDir::new().unwrap();
        let path = fixture(dir.path(), "SA1.bam", b"AABBCCDDEE");

        let mut reader = ChunkReader::new(&path, 4).unwrap();
        assert_eq!(reader.file_size(), 10);

        let mut chunks = Vec::new();
        while let Some(chunk) = reader.next_chunk().unwrap() {
            chunks.push(chunk.to_vec());
        }
        assert_eq!(chunks, vec![b"AABB".to_vec(), b"CCDD".to_vec(), b"EE".to_vec()]);
        assert_eq!(reader.offset(), 10);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn empty_file_has_no_chunks() {
        let dir = TempDir::new().unwrap();
        let path = fixture(dir.path(), "empty.bam", b"");
        let mut reader = ChunkReader::new(&path, 4).unwrap();
        assert!(reader.next_chunk().unwrap().is_none());
    }

    #[test]
    fn zero_chunk_size_uses_default() {
        let dir = TempDir::new().unwrap();
        let path = fixture(dir.path(), "SA1.bam", b"x");
        let mut reader = ChunkReader::new(&path, 0).unwrap();
        assert_eq!(reader.next_chunk().unwrap().unwrap(), b"x");
    }

    #[test]
    fn truncated_source_fails_verification() {
        let dir = TempDir::new().unwrap();
        let path = fixture(dir.path(), "SA1.bam", b"0123456789");
        let mut reader = ChunkReader::new(&path, 4).unwrap();
        assert_eq!(reader.next_chunk().unwrap().unwrap(), b"0123");

        std::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .unwrap()
            .set_len(6)
            .unwrap();

        match reader.next_chunk() {
            Err(TransferError::VerificationFailed {
                expected, actual, ..
            }) => assert_eq!((expected, actual), (10, 6)),
            other => panic!("unexpected result: {:?}", other.map(|c| c.map(<[u8]>::len))),
        }
    }

    #[test]
    fn missing_file_is_io_error() {
        let dir = TempDir::new().unwrap();
        let result = ChunkReader::new(&dir.path().join("nope"), 4);
        assert!(matches!(result, Err(TransferError::Io(_))));
    }
}
