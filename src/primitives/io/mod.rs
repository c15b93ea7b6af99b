#![forbid(unsafe_code)]

use std::{
    fs::{File, OpenOptions},
    io::{self, ErrorKind},
    path::Path,
    sync::Arc,
};

use parking_lot::Mutex;
use tracing::trace;

use crate::types::{Result, StrataError};

/// Positioned file I/O used to load and persist committed images.
pub trait FileIo: Send + Sync + 'static {
    /// Reads exactly `dst.len()` bytes at `off`.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes all of `src` at `off`, extending the file as needed.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Flushes data and metadata to stable storage.
    fn sync_all(&self) -> Result<()>;
    /// Current length in bytes.
    fn len(&self) -> Result<u64>;
    /// Returns true if the file is empty.
    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
    /// Truncates or extends the file to `len` bytes.
    fn truncate(&self, len: u64) -> Result<()>;
}

#[cfg(unix)]
mod positioned {
    use std::{fs::File, io, os::unix::fs::FileExt};

    pub fn read_at(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.read_at(dst, off)
    }

    pub fn write_at(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.write_at(src, off)
    }
}

#[cfg(windows)]
mod positioned {
    use std::{fs::File, io, os::windows::fs::FileExt};

    pub fn read_at(file: &File, dst: &mut [u8], off: u64) -> io::Result<usize> {
        file.seek_read(dst, off)
    }

    pub fn write_at(file: &File, src: &[u8], off: u64) -> io::Result<usize> {
        file.seek_write(src, off)
    }
}

/// File-backed [`FileIo`].
#[derive(Clone)]
pub struct StdFileIo {
    inner: Arc<File>,
}

impl StdFileIo {
    /// Wraps an open file handle.
    pub fn new(file: File) -> Self {
        Self {
            inner: Arc::new(file),
        }
    }

    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        Ok(Self::new(file))
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, mut off: u64, mut dst: &mut [u8]) -> Result<()> {
        trace!(off, len = dst.len(), "io.read_at");
        while !dst.is_empty() {
            let read = positioned::read_at(&self.inner, dst, off)?;
            if read == 0 {
                return Err(io::Error::new(ErrorKind::UnexpectedEof, "read_at reached EOF").into());
            }
            dst = &mut dst[read..];
            off += read as u64;
        }
        Ok(())
    }

    fn write_at(&self, mut off: u64, mut src: &[u8]) -> Result<()> {
        trace!(off, len = src.len(), "io.write_at");
        while !src.is_empty() {
            let written = positioned::write_at(&self.inner, src, off)?;
            if written == 0 {
                return Err(io::Error::new(ErrorKind::WriteZero, "write_at wrote zero bytes").into());
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all().map_err(StrataError::from)
    }

    fn len(&self) -> Result<u64> {
        Ok(self.inner.metadata()?.len())
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.set_len(len).map_err(StrataError::from)
    }
}

/// In-memory [`FileIo`] for tests and transient stores.
#[derive(Clone, Default)]
pub struct MemFileIo {
    data: Arc<Mutex<Vec<u8>>>,
}

impl MemFileIo {
    /// Creates an empty file.
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of the current content.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl FileIo for MemFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        let data = self.data.lock();
        let start = usize::try_from(off).map_err(|_| StrataError::Invalid("offset overflow"))?;
        let src = data
            .get(start..start + dst.len())
            .ok_or_else(|| io::Error::new(ErrorKind::UnexpectedEof, "read past end"))?;
        dst.copy_from_slice(src);
        Ok(())
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        let mut data = self.data.lock();
        let start = usize::try_from(off).map_err(|_| StrataError::Invalid("offset overflow"))?;
        let end = start + src.len();
        if data.len() < end {
            data.resize(end, 0);
        }
        data[start..end].copy_from_slice(src);
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        Ok(self.data.lock().len() as u64)
    }

    fn truncate(&self, len: u64) -> Result<()> {
        let len = usize::try_from(len).map_err(|_| StrataError::Invalid("length overflow"))?;
        self.data.lock().resize(len, 0);
        Ok(())
    }
}
