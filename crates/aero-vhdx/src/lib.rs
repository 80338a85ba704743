//! VHDX virtual disk images for Aero.
//!
//! The crate maps a byte-addressed guest disk onto a VHDX container: blocks are allocated
//! lazily at the end of the file, metadata updates go through a log collaborator before the
//! payload that depends on them, and two redundant headers track which copy is authoritative.
//!
//! - [`VhdxDisk`]: an open image owning its [`StorageBackend`]; implements [`VirtualDisk`]
//! - [`SharedVhdxDisk`]: cloneable async handle for concurrent callers
//! - [`VhdxCreateOptions`]: layout of a new dynamic or fixed image
//! - [`MemBackend`] / [`StdFileBackend`]: in-memory and host-file storage
//!
//! Differencing images are not supported.

mod backend;
mod disk;
mod error;
mod util;
pub mod vhdx;

pub use backend::{MemBackend, StdFileBackend, StorageBackend};
pub use disk::{VirtualDisk, SECTOR_SIZE};
pub use error::{DiskError, FormatError, Result};
pub use vhdx::{
    probe, BatEntry, CheckMode, CheckReport, DirectLog, Geometry, ImageInfo, LogRecord,
    MetadataLog, PayloadState, SharedVhdxDisk, VhdxCreateOptions, VhdxDisk, VhdxHeader,
    VhdxLayout, VhdxOpenOptions, VhdxSubformat,
};

#[cfg(test)]
mod proptests;
