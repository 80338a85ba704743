use crate::util::{MIB, TIB};
use crate::FormatError;

pub const MIN_BLOCK_SIZE: u32 = MIB as u32;
pub const MAX_BLOCK_SIZE: u32 = 256 * MIB as u32;
pub const MAX_VIRTUAL_SIZE: u64 = 64 * TIB;
pub const MIN_SECTORS_PER_BLOCK: u32 = 256;

/// Number of sectors covered by one sector-bitmap block (1 MiB of bits).
const SECTORS_PER_BITMAP_BLOCK: u64 = 1 << 23;

/// Validated image dimensions with cached shift counts.
///
/// Every divisor on the I/O path is a power of two, so translation uses shifts only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Geometry {
    pub virtual_size: u64,
    pub block_size: u32,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub sectors_per_block: u32,
    pub chunk_ratio: u32,
    pub data_blocks: u64,
    pub bat_entries: u64,
    pub logical_sector_bits: u32,
    pub sectors_per_block_bits: u32,
    pub chunk_ratio_bits: u32,
    pub block_size_bits: u32,
}

fn is_sector_size(v: u32) -> bool {
    v == 512 || v == 4096
}

impl Geometry {
    pub fn new(
        virtual_size: u64,
        block_size: u32,
        logical_sector_size: u32,
        physical_sector_size: u32,
    ) -> Result<Self, FormatError> {
        if !is_sector_size(logical_sector_size) {
            return Err(FormatError::InvalidGeometry(
                "logical sector size must be 512 or 4096",
            ));
        }
        if !is_sector_size(physical_sector_size) {
            return Err(FormatError::InvalidGeometry(
                "physical sector size must be 512 or 4096",
            ));
        }
        if !block_size.is_power_of_two() {
            return Err(FormatError::InvalidGeometry(
                "block size must be a power of two",
            ));
        }
        if !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
            return Err(FormatError::InvalidGeometry(
                "block size must be within [1 MiB, 256 MiB]",
            ));
        }
        if virtual_size == 0 {
            return Err(FormatError::InvalidGeometry("virtual size is zero"));
        }
        if virtual_size > MAX_VIRTUAL_SIZE {
            return Err(FormatError::InvalidGeometry("virtual size exceeds 64 TiB"));
        }
        if !virtual_size.is_multiple_of(u64::from(logical_sector_size)) {
            return Err(FormatError::InvalidGeometry(
                "virtual size must be a multiple of the logical sector size",
            ));
        }

        let sectors_per_block = block_size / logical_sector_size;
        if !sectors_per_block.is_power_of_two() || sectors_per_block < MIN_SECTORS_PER_BLOCK {
            return Err(FormatError::InvalidGeometry(
                "sectors per block must be a power of two of at least 256",
            ));
        }

        let chunk_ratio =
            SECTORS_PER_BITMAP_BLOCK * u64::from(logical_sector_size) / u64::from(block_size);
        if chunk_ratio == 0 || !chunk_ratio.is_power_of_two() {
            return Err(FormatError::InvalidGeometry(
                "chunk ratio must be a power of two",
            ));
        }
        let chunk_ratio = u32::try_from(chunk_ratio)
            .map_err(|_| FormatError::InvalidGeometry("chunk ratio too large"))?;

        let data_blocks = virtual_size.div_ceil(u64::from(block_size));
        let chunk_ratio_bits = chunk_ratio.trailing_zeros();
        let bat_entries = data_blocks + ((data_blocks - 1) >> chunk_ratio_bits);

        Ok(Self {
            virtual_size,
            block_size,
            logical_sector_size,
            physical_sector_size,
            sectors_per_block,
            chunk_ratio,
            data_blocks,
            bat_entries,
            logical_sector_bits: logical_sector_size.trailing_zeros(),
            sectors_per_block_bits: sectors_per_block.trailing_zeros(),
            chunk_ratio_bits,
            block_size_bits: block_size.trailing_zeros(),
        })
    }

    pub fn total_sectors(&self) -> u64 {
        self.virtual_size >> self.logical_sector_bits
    }

    /// BAT slot holding payload block `block`.
    pub fn payload_bat_index(&self, block: u64) -> u64 {
        block + (block >> self.chunk_ratio_bits)
    }

    /// Inverse of [`Geometry::payload_bat_index`]; `None` for sector-bitmap slots.
    pub fn payload_block_of(&self, bat_index: u64) -> Option<u64> {
        let period = u64::from(self.chunk_ratio) + 1;
        if bat_index % period == u64::from(self.chunk_ratio) {
            return None;
        }
        Some(bat_index - bat_index / period)
    }

    /// Bytes of guest data held by payload block `block`; the last block may be short.
    pub fn payload_block_len(&self, block: u64) -> u64 {
        let start = block << self.block_size_bits;
        self.virtual_size
            .saturating_sub(start)
            .min(u64::from(self.block_size))
    }
}
