use std::fs::{File, OpenOptions};
use std::path::Path;

use crate::util::checked_range;
use crate::{DiskError, Result};

/// Byte-addressed, resizable storage underneath a disk image.
///
/// Implementations must treat reads past `len()` as [`DiskError::OutOfBounds`] and let writes
/// past `len()` grow the backend.
pub trait StorageBackend {
    fn len(&mut self) -> Result<u64>;
    fn set_len(&mut self, len: u64) -> Result<()>;
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;
    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()>;
    fn flush(&mut self) -> Result<()>;

    fn is_empty(&mut self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Whether growing the backend with [`StorageBackend::set_len`] guarantees that the new
    /// bytes read back as zero.
    ///
    /// Image code uses this as its zero-fill-on-grow primitive: when it returns `false`, newly
    /// allocated payload blocks are zeroed with explicit writes instead.
    fn grows_zeroed(&self) -> bool {
        false
    }
}

impl<B: StorageBackend + ?Sized> StorageBackend for Box<B> {
    fn len(&mut self) -> Result<u64> {
        (**self).len()
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        (**self).set_len(len)
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        (**self).read_at(offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        (**self).write_at(offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        (**self).flush()
    }

    fn grows_zeroed(&self) -> bool {
        (**self).grows_zeroed()
    }
}

/// In-memory backend, mostly used by tests and for building images in RAM.
#[derive(Clone, Debug, Default)]
pub struct MemBackend {
    data: Vec<u8>,
}

impl MemBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_len(len: u64) -> Result<Self> {
        let mut backend = Self::new();
        backend.set_len(len)?;
        Ok(backend)
    }

    pub fn from_vec(data: Vec<u8>) -> Self {
        Self { data }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn into_vec(self) -> Vec<u8> {
        self.data
    }
}

impl StorageBackend for MemBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.data.len() as u64)
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        let len: usize = len
            .try_into()
            .map_err(|_| DiskError::OutOfMemory("in-memory backend"))?;
        if len > self.data.len() {
            self.data
                .try_reserve(len - self.data.len())
                .map_err(|_| DiskError::OutOfMemory("in-memory backend"))?;
        }
        self.data.resize(len, 0);
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        checked_range(offset, buf.len(), self.data.len() as u64)?;
        let start = offset as usize;
        buf.copy_from_slice(&self.data[start..start + buf.len()]);
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        let end = offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        if end > self.data.len() as u64 {
            self.set_len(end)?;
        }
        let start = offset as usize;
        self.data[start..start + buf.len()].copy_from_slice(buf);
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }

    fn grows_zeroed(&self) -> bool {
        true
    }
}

/// Host file backend using positional I/O.
///
/// Reads and writes never move the file cursor, so a caller can hand a file over and take it
/// back with its position intact.
#[derive(Debug)]
pub struct StdFileBackend {
    file: File,
}

impl StdFileBackend {
    pub fn from_file(file: File) -> Self {
        Self { file }
    }

    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn open_read_only(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new().read(true).open(path)?;
        Ok(Self { file })
    }

    /// Create (or truncate) a file at `path`.
    pub fn create(path: impl AsRef<Path>) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn into_file(self) -> File {
        self.file
    }

    #[cfg(unix)]
    fn pread(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.read_exact_at(buf, offset)
    }

    #[cfg(unix)]
    fn pwrite(&self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        use std::os::unix::fs::FileExt;
        self.file.write_all_at(buf, offset)
    }

    #[cfg(not(unix))]
    fn pread(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<()> {
        use std::io::{Read, Seek, SeekFrom};
        let mut file = &self.file;
        let saved = file.stream_position()?;
        file.seek(SeekFrom::Start(offset))?;
        let res = file.read_exact(buf);
        file.seek(SeekFrom::Start(saved))?;
        res
    }

    #[cfg(not(unix))]
    fn pwrite(&self, offset: u64, buf: &[u8]) -> std::io::Result<()> {
        use std::io::{Seek, SeekFrom, Write};
        let mut file = &self.file;
        let saved = file.stream_position()?;
        file.seek(SeekFrom::Start(offset))?;
        let res = file.write_all(buf);
        file.seek(SeekFrom::Start(saved))?;
        res
    }
}

impl StorageBackend for StdFileBackend {
    fn len(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn set_len(&mut self, len: u64) -> Result<()> {
        self.file.set_len(len)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        let len = self.len()?;
        checked_range(offset, buf.len(), len)?;
        self.pread(offset, buf)?;
        Ok(())
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        offset
            .checked_add(buf.len() as u64)
            .ok_or(DiskError::OffsetOverflow)?;
        self.pwrite(offset, buf)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }

    fn grows_zeroed(&self) -> bool {
        true
    }
}
