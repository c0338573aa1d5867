//! File access primitives: positional reads and memory-mapped regions.

use iostore_core::{buffer::ExternalBytes, Error, Result};
use std::fs::File;
use std::path::Path;

/// Thread-safe positional file handle.
///
/// All reads are positional (`pread`-style), so one handle serves
/// concurrent readers without seek coordination.
#[derive(Debug)]
pub struct FileHandle {
    file: File,
    len: u64,
}

impl FileHandle {
    /// Open a file for positional reads.
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::FileOpenFailed(format!("{}: {}", path.display(), e)))?;
        let len = file
            .metadata()
            .map_err(|e| Error::FileOpenFailed(format!("{}: {}", path.display(), e)))?
            .len();
        Ok(FileHandle { file, len })
    }

    /// File length in bytes.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True for an empty file.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Fill `buf` from the given byte offset.
    #[cfg(unix)]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::unix::fs::FileExt;
        self.file
            .read_exact_at(buf, offset)
            .map_err(|e| Error::ReadError(format!("read {} bytes at {}: {}", buf.len(), offset, e)))
    }

    /// Fill `buf` from the given byte offset.
    #[cfg(windows)]
    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<()> {
        use std::os::windows::fs::FileExt;
        let mut filled = 0usize;
        while filled < buf.len() {
            let n = self
                .file
                .seek_read(&mut buf[filled..], offset + filled as u64)
                .map_err(|e| {
                    Error::ReadError(format!("read {} bytes at {}: {}", buf.len(), offset, e))
                })?;
            if n == 0 {
                return Err(Error::ReadError(format!(
                    "unexpected end of file at {}",
                    offset + filled as u64
                )));
            }
            filled += n;
        }
        Ok(())
    }

    /// Read `len` bytes at `offset` into a fresh buffer.
    pub fn read_vec(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; len];
        self.read_at(offset, &mut buf)?;
        Ok(buf)
    }
}

/// Shared memory-mapped view of a whole file.
///
/// Implements [`ExternalBytes`] so `IoBuffer` views can wrap sub-ranges
/// of the mapping without copying; the buffers keep the mapping alive.
pub struct MappedRegion {
    mmap: memmap2::Mmap,
}

impl MappedRegion {
    /// Map an entire file read-only.
    pub fn map(path: &Path) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::FileOpenFailed(format!("{}: {}", path.display(), e)))?;
        // Safety: the mapping is read-only and partition files are
        // immutable once published
        let mmap = unsafe { memmap2::Mmap::map(&file) }
            .map_err(|e| Error::ReadError(format!("mmap {}: {}", path.display(), e)))?;
        Ok(MappedRegion { mmap })
    }

    /// Length of the mapped file.
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True for an empty mapping.
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }
}

impl ExternalBytes for MappedRegion {
    fn bytes(&self) -> &[u8] {
        &self.mmap
    }
}
