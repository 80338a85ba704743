//! VHDX image support.
//!
//! Layout of the first megabyte (the header section):
//!
//! | offset  | size   | contents                     |
//! |---------|--------|------------------------------|
//! | 0       | 64 KiB | file identifier (`vhdxfile`) |
//! | 64 KiB  | 4 KiB  | header 1                     |
//! | 128 KiB | 4 KiB  | header 2                     |
//! | 192 KiB | 64 KiB | region table 1               |
//! | 256 KiB | 64 KiB | region table 2               |
//!
//! Everything else (log, BAT, metadata, payload blocks) is located through the headers and the
//! region table and is always 1 MiB aligned.
//!
//! Differencing images are rejected at open, and the metadata log is delegated to a
//! [`MetadataLog`] collaborator.

pub mod bat;
pub mod check;
pub mod checksum;
pub mod create;
pub mod geometry;
pub mod guid;
pub mod header;
pub mod log;
pub mod metadata;
pub mod region;

mod image;
mod shared;

use crate::util::MIB;
use crate::{Result, StorageBackend, VirtualDisk};

pub use bat::{BatEntry, PayloadState};
pub use check::{CheckMode, CheckReport};
pub use create::{VhdxCreateOptions, VhdxLayout, VhdxSubformat};
pub use geometry::Geometry;
pub use header::VhdxHeader;
pub use image::{ImageInfo, VhdxOpenOptions};
pub use log::{DirectLog, LogRecord, MetadataLog};
pub use shared::SharedVhdxDisk;

use image::ImageState;

/// End of the fixed header section; nothing else may live below it.
pub const HEADER_SECTION_END: u64 = MIB;

/// Returns `true` when the backend starts with the VHDX file identifier.
pub fn probe<B: StorageBackend>(backend: &mut B) -> Result<bool> {
    if backend.len()? < 8 {
        return Ok(false);
    }
    let mut sig = [0u8; 8];
    backend.read_at(0, &mut sig)?;
    Ok(sig == header::FILE_SIGNATURE)
}

/// An open VHDX image that owns its backend.
pub struct VhdxDisk<B> {
    backend: B,
    state: ImageState,
}

impl<B: StorageBackend> VhdxDisk<B> {
    /// Create a new image on `backend` and open it for writing.
    pub fn create(mut backend: B, options: VhdxCreateOptions) -> Result<Self> {
        create::create_image(&mut backend, &options)?;
        Self::open(backend)
    }

    pub fn open(backend: B) -> Result<Self> {
        Self::open_with_options(backend, VhdxOpenOptions::default())
    }

    pub fn open_with_options(mut backend: B, options: VhdxOpenOptions) -> Result<Self> {
        let state = ImageState::open(&mut backend, options)?;
        Ok(Self { backend, state })
    }

    pub fn header(&self) -> &VhdxHeader {
        self.state.header()
    }

    pub fn geometry(&self) -> &Geometry {
        &self.state.geometry
    }

    pub fn info(&self) -> ImageInfo {
        self.state.info()
    }

    pub fn bat_entry(&self, index: u64) -> Option<BatEntry> {
        self.state.bat.get(index)
    }

    pub fn is_read_only(&self) -> bool {
        self.state.read_only
    }

    pub fn check(&mut self, mode: CheckMode) -> Result<CheckReport> {
        self.state.check(&mut self.backend, mode)
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    /// Flush and hand back the backend.
    pub fn close(mut self) -> Result<B> {
        if !self.state.read_only {
            self.state.flush(&mut self.backend)?;
        }
        Ok(self.backend)
    }

    pub fn into_backend(self) -> B {
        self.backend
    }

    pub fn into_shared(self) -> SharedVhdxDisk<B> {
        SharedVhdxDisk::new(self.backend, self.state)
    }
}

impl<B: StorageBackend> VirtualDisk for VhdxDisk<B> {
    fn capacity_bytes(&self) -> u64 {
        self.state.capacity()
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.state.read(&mut self.backend, offset, buf)
    }

    fn write_at(&mut self, offset: u64, buf: &[u8]) -> Result<()> {
        self.state.write(&mut self.backend, offset, buf)
    }

    fn flush(&mut self) -> Result<()> {
        if self.state.read_only {
            return Ok(());
        }
        self.state.flush(&mut self.backend)
    }
}
