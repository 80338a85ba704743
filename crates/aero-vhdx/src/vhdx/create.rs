use serde::Serialize;
use tracing::info;
use uuid::Uuid;

use super::bat::{Bat, BatEntry, PayloadState, BAT_ENTRY_SIZE};
use super::geometry::{Geometry, MAX_BLOCK_SIZE, MAX_VIRTUAL_SIZE};
use super::header::{encode_file_identifier, VhdxHeader, HEADER_SLOT_OFFSETS, HEADER_VERSION, LOG_VERSION};
use super::metadata::{FileParameterFlags, VhdxMetadata};
use super::region::{RegionEntry, RegionFlags, RegionTable, REGION_TABLE_OFFSETS};
use super::{guid, HEADER_SECTION_END};
use crate::util::{align_up_u64, GIB, MIB, TIB};
use crate::{DiskError, Result, StorageBackend};

pub const DEFAULT_LOG_SIZE: u64 = MIB;
pub const METADATA_REGION_SIZE: u64 = MIB;
pub const CREATOR: &str = "aero-vhdx";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VhdxSubformat {
    /// Blocks are allocated on first write.
    #[default]
    Dynamic,
    /// Every block is allocated up front.
    Fixed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdxCreateOptions {
    pub disk_size_bytes: u64,
    /// `0` picks a block size from the disk size.
    pub block_size_bytes: u32,
    /// `0` uses [`DEFAULT_LOG_SIZE`].
    pub log_size_bytes: u64,
    pub logical_sector_size: u32,
    pub subformat: VhdxSubformat,
    /// Mark untouched blocks `ZERO` instead of `NOT_PRESENT`.
    pub prefer_zero_block_state: bool,
}

impl Default for VhdxCreateOptions {
    fn default() -> Self {
        Self {
            disk_size_bytes: 0,
            block_size_bytes: 0,
            log_size_bytes: DEFAULT_LOG_SIZE,
            logical_sector_size: 512,
            subformat: VhdxSubformat::Dynamic,
            prefer_zero_block_state: false,
        }
    }
}

impl VhdxCreateOptions {
    pub fn new(disk_size_bytes: u64) -> Self {
        Self {
            disk_size_bytes,
            ..Self::default()
        }
    }

    /// Apply the rounding rules and validate the result.
    pub fn normalized(&self) -> Result<Self> {
        let lss = self.logical_sector_size;
        if lss != 512 && lss != 4096 {
            return Err(DiskError::InvalidConfig(
                "logical sector size must be 512 or 4096",
            ));
        }

        let disk_size_bytes = align_up_u64(self.disk_size_bytes, u64::from(lss))?;
        if disk_size_bytes == 0 {
            return Err(DiskError::InvalidConfig("disk size must be non-zero"));
        }
        if disk_size_bytes > MAX_VIRTUAL_SIZE {
            return Err(DiskError::InvalidConfig("disk size exceeds 64 TiB"));
        }

        let log_size_bytes = match self.log_size_bytes {
            0 => DEFAULT_LOG_SIZE,
            n => align_up_u64(n, MIB)?,
        };
        if log_size_bytes > u64::from(u32::MAX) {
            return Err(DiskError::InvalidConfig("log size must fit in 32 bits"));
        }

        let block_size_bytes = match self.block_size_bytes {
            0 => auto_block_size(disk_size_bytes),
            n => {
                let rounded = align_up_u64(u64::from(n), MIB)?;
                rounded
                    .checked_next_power_of_two()
                    .ok_or(DiskError::OffsetOverflow)?
                    .min(u64::from(MAX_BLOCK_SIZE)) as u32
            }
        };

        Ok(Self {
            disk_size_bytes,
            block_size_bytes,
            log_size_bytes,
            logical_sector_size: lss,
            subformat: self.subformat,
            prefer_zero_block_state: self.prefer_zero_block_state,
        })
    }
}

fn auto_block_size(disk_size: u64) -> u32 {
    let size = if disk_size > 32 * TIB {
        64 * MIB
    } else if disk_size > 100 * GIB {
        32 * MIB
    } else if disk_size > GIB {
        16 * MIB
    } else {
        8 * MIB
    };
    size as u32
}

/// File offsets of every structure in a freshly created image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VhdxLayout {
    pub log_offset: u64,
    pub log_length: u64,
    pub bat_offset: u64,
    pub bat_length: u64,
    pub metadata_offset: u64,
    pub metadata_length: u64,
    /// First byte past the metadata region; fixed images place block 0 here.
    pub data_offset: u64,
}

impl VhdxLayout {
    pub fn compute(log_size: u64, geometry: &Geometry) -> Result<Self> {
        let log_offset = HEADER_SECTION_END;
        let bat_offset = align_up_u64(
            log_offset
                .checked_add(log_size)
                .ok_or(DiskError::OffsetOverflow)?,
            MIB,
        )?;
        let bat_bytes = geometry
            .bat_entries
            .checked_mul(BAT_ENTRY_SIZE)
            .ok_or(DiskError::OffsetOverflow)?;
        let bat_length = align_up_u64(bat_bytes, MIB)?;
        if bat_length > u64::from(u32::MAX) {
            return Err(DiskError::InvalidConfig("bat does not fit in a region"));
        }
        let metadata_offset = align_up_u64(bat_offset + bat_length, MIB)?;
        let metadata_length = METADATA_REGION_SIZE;
        Ok(Self {
            log_offset,
            log_length: log_size,
            bat_offset,
            bat_length,
            metadata_offset,
            metadata_length,
            data_offset: metadata_offset + metadata_length,
        })
    }
}

/// Lay out a new image on `backend`, discarding whatever it held.
pub fn create_image<B: StorageBackend>(
    backend: &mut B,
    options: &VhdxCreateOptions,
) -> Result<VhdxLayout> {
    let opts = options.normalized()?;
    let lss = opts.logical_sector_size;
    let geometry = Geometry::new(opts.disk_size_bytes, opts.block_size_bytes, lss, lss)?;
    let layout = VhdxLayout::compute(opts.log_size_bytes, &geometry)?;

    backend.set_len(0)?;
    let file_len = match opts.subformat {
        VhdxSubformat::Dynamic => layout.data_offset,
        VhdxSubformat::Fixed => layout
            .data_offset
            .checked_add(opts.disk_size_bytes)
            .ok_or(DiskError::OffsetOverflow)?,
    };
    backend.set_len(file_len)?;

    backend.write_at(0, &encode_file_identifier(CREATOR))?;
    write_headers(backend, &layout)?;
    write_region_tables(backend, &layout)?;
    backend.write_at(layout.bat_offset, &build_bat(&opts, &geometry, &layout).encode())?;

    let mut file_flags = FileParameterFlags::empty();
    if opts.subformat == VhdxSubformat::Fixed {
        file_flags |= FileParameterFlags::LEAVE_BLOCKS_ALLOCATED;
    }
    let metadata = VhdxMetadata {
        block_size: opts.block_size_bytes,
        file_flags,
        virtual_size: opts.disk_size_bytes,
        page83: guid::generate(),
        logical_sector_size: lss,
        physical_sector_size: lss,
    };
    backend.write_at(layout.metadata_offset, &metadata.encode()?)?;
    backend.flush()?;

    info!(
        disk_size = opts.disk_size_bytes,
        block_size = opts.block_size_bytes,
        subformat = ?opts.subformat,
        bat_entries = geometry.bat_entries,
        "created vhdx image"
    );
    Ok(layout)
}

fn write_headers<B: StorageBackend>(backend: &mut B, layout: &VhdxLayout) -> Result<()> {
    let sequence = u64::from(rand::random::<u32>());
    let mut header = VhdxHeader {
        sequence_number: sequence,
        file_write_guid: guid::generate(),
        data_write_guid: guid::generate(),
        log_guid: Uuid::nil(),
        log_version: LOG_VERSION,
        version: HEADER_VERSION,
        log_length: layout.log_length as u32,
        log_offset: layout.log_offset,
    };
    backend.write_at(HEADER_SLOT_OFFSETS[0], &header.encode())?;
    header.sequence_number += 1;
    backend.write_at(HEADER_SLOT_OFFSETS[1], &header.encode())?;
    Ok(())
}

fn write_region_tables<B: StorageBackend>(backend: &mut B, layout: &VhdxLayout) -> Result<()> {
    let table = RegionTable {
        entries: vec![
            RegionEntry {
                guid: guid::BAT_REGION,
                file_offset: layout.bat_offset,
                length: layout.bat_length as u32,
                flags: RegionFlags::REQUIRED,
            },
            RegionEntry {
                guid: guid::METADATA_REGION,
                file_offset: layout.metadata_offset,
                length: layout.metadata_length as u32,
                flags: RegionFlags::REQUIRED,
            },
        ],
    };
    let raw = table.encode()?;
    for offset in REGION_TABLE_OFFSETS {
        backend.write_at(offset, &raw)?;
    }
    Ok(())
}

fn build_bat(opts: &VhdxCreateOptions, geometry: &Geometry, layout: &VhdxLayout) -> Bat {
    let untouched = if opts.prefer_zero_block_state {
        PayloadState::Zero
    } else {
        PayloadState::NotPresent
    };
    let entries = (0..geometry.bat_entries)
        .map(|idx| match geometry.payload_block_of(idx) {
            None => BatEntry::default(),
            Some(block) => match opts.subformat {
                VhdxSubformat::Dynamic => BatEntry::new(untouched, 0),
                VhdxSubformat::Fixed => {
                    let state = if opts.prefer_zero_block_state {
                        PayloadState::Zero
                    } else {
                        PayloadState::FullyPresent
                    };
                    let offset = layout.data_offset + (block << geometry.block_size_bits);
                    BatEntry::new(state, offset)
                }
            },
        })
        .collect();
    Bat::from_entries(layout.bat_offset, entries)
}
