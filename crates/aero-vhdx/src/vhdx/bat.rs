//! Block allocation table and logical-sector translation.

use super::geometry::Geometry;
use super::region::RegionEntry;
use crate::util::{le_u64, try_zeroed_vec};
use crate::{DiskError, FormatError, Result, StorageBackend};

pub const BAT_ENTRY_SIZE: u64 = 8;
pub const BAT_STATE_MASK: u64 = 0x7;
pub const BAT_OFFSET_MASK: u64 = 0xFFFF_FFFF_FFF0_0000;

/// Allocation state stored in the low three bits of a BAT entry.
///
/// Sector-bitmap slots reuse the same encoding; only `NotPresent` and `FullyPresent` are
/// meaningful for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PayloadState {
    NotPresent,
    Undefined,
    Zero,
    Unmapped,
    /// `UNMAPPED` as written by pre-1.0 implementations.
    UnmappedV095,
    FullyPresent,
    PartiallyPresent,
}

impl PayloadState {
    pub fn from_bits(bits: u64) -> Option<Self> {
        Some(match bits & BAT_STATE_MASK {
            0 => PayloadState::NotPresent,
            1 => PayloadState::Undefined,
            2 => PayloadState::Zero,
            3 => PayloadState::Unmapped,
            5 => PayloadState::UnmappedV095,
            6 => PayloadState::FullyPresent,
            7 => PayloadState::PartiallyPresent,
            _ => return None,
        })
    }

    pub fn bits(self) -> u64 {
        match self {
            PayloadState::NotPresent => 0,
            PayloadState::Undefined => 1,
            PayloadState::Zero => 2,
            PayloadState::Unmapped => 3,
            PayloadState::UnmappedV095 => 5,
            PayloadState::FullyPresent => 6,
            PayloadState::PartiallyPresent => 7,
        }
    }

    /// States whose guest-visible contents are all zero.
    pub fn reads_as_zero(self) -> bool {
        matches!(
            self,
            PayloadState::NotPresent
                | PayloadState::Undefined
                | PayloadState::Zero
                | PayloadState::Unmapped
                | PayloadState::UnmappedV095
        )
    }
}

/// A packed BAT entry: file offset in 1 MiB units above bit 20, state in the low three bits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatEntry(u64);

impl BatEntry {
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    pub fn new(state: PayloadState, file_offset: u64) -> Self {
        Self((file_offset & BAT_OFFSET_MASK) | state.bits())
    }

    pub fn raw(self) -> u64 {
        self.0
    }

    pub fn state(self) -> Option<PayloadState> {
        PayloadState::from_bits(self.0)
    }

    pub fn file_offset(self) -> u64 {
        self.0 & BAT_OFFSET_MASK
    }
}

/// In-memory copy of the BAT region.
#[derive(Debug, Clone)]
pub struct Bat {
    region_offset: u64,
    entries: Vec<BatEntry>,
}

impl Bat {
    pub fn from_entries(region_offset: u64, entries: Vec<BatEntry>) -> Self {
        Self {
            region_offset,
            entries,
        }
    }

    /// Load `geometry.bat_entries` entries from the BAT region.
    pub fn load<B: StorageBackend>(
        backend: &mut B,
        region: &RegionEntry,
        geometry: &Geometry,
    ) -> Result<Self> {
        let needed = geometry
            .bat_entries
            .checked_mul(BAT_ENTRY_SIZE)
            .ok_or(DiskError::OffsetOverflow)?;
        if needed > u64::from(region.length) {
            return Err(FormatError::BatOutOfBounds {
                index: geometry.bat_entries - 1,
                reason: "bat region too small for the virtual disk",
            }
            .into());
        }
        let len: usize = needed
            .try_into()
            .map_err(|_| DiskError::OutOfMemory("bat"))?;
        let mut raw = try_zeroed_vec(len, "bat")?;
        match backend.read_at(region.file_offset, &mut raw) {
            Ok(()) => {}
            Err(DiskError::OutOfBounds { .. }) => {
                return Err(FormatError::Corrupt("bat region truncated").into())
            }
            Err(e) => return Err(e),
        }

        let mut entries = Vec::new();
        entries
            .try_reserve_exact(len / BAT_ENTRY_SIZE as usize)
            .map_err(|_| DiskError::OutOfMemory("bat"))?;
        entries.extend(
            raw.chunks_exact(BAT_ENTRY_SIZE as usize)
                .map(|chunk| BatEntry::from_raw(le_u64(chunk, 0))),
        );
        Ok(Self::from_entries(region.file_offset, entries))
    }

    pub fn len(&self) -> u64 {
        self.entries.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, index: u64) -> Option<BatEntry> {
        let index: usize = index.try_into().ok()?;
        self.entries.get(index).copied()
    }

    pub fn set(&mut self, index: u64, entry: BatEntry) -> Result<()> {
        let slot = usize::try_from(index)
            .ok()
            .and_then(|i| self.entries.get_mut(i))
            .ok_or(FormatError::BatOutOfBounds {
                index,
                reason: "index past end of bat",
            })?;
        *slot = entry;
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = (u64, BatEntry)> + '_ {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, e)| (i as u64, *e))
    }

    /// File offset where entry `index` is persisted.
    pub fn entry_file_offset(&self, index: u64) -> u64 {
        self.region_offset + index * BAT_ENTRY_SIZE
    }

    pub fn encode(&self) -> Vec<u8> {
        self.entries
            .iter()
            .flat_map(|e| e.raw().to_le_bytes())
            .collect()
    }
}

/// One contiguous run produced by [`translate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectorInfo {
    pub bat_index: u64,
    /// Sector offset of the run inside its payload block.
    pub block_offset: u64,
    /// Sectors in this run, never crossing a block boundary.
    pub sectors_avail: u64,
    pub bytes_avail: u64,
    /// Absolute file offset of the run, or `0` when the block has no backing storage.
    pub file_offset: u64,
    pub entry: BatEntry,
}

/// Map `nb_sectors` sectors starting at logical sector `sector` onto the BAT.
///
/// The returned run stops at the end of the containing block; callers loop for longer
/// requests. Translation never mutates the table.
pub fn translate(geometry: &Geometry, bat: &Bat, sector: u64, nb_sectors: u64) -> Result<SectorInfo> {
    let block = sector >> geometry.sectors_per_block_bits;
    let block_offset = sector - (block << geometry.sectors_per_block_bits);
    let bat_index = geometry.payload_bat_index(block);

    let sectors_avail = (u64::from(geometry.sectors_per_block) - block_offset).min(nb_sectors);
    let bytes_avail = sectors_avail << geometry.logical_sector_bits;

    let entry = bat.get(bat_index).ok_or(FormatError::BatOutOfBounds {
        index: bat_index,
        reason: "sector maps past end of bat",
    })?;
    // The whole block must be addressable before any offset inside it is formed.
    let file_offset = match entry.file_offset() {
        0 => 0,
        base => match base.checked_add(u64::from(geometry.block_size)) {
            Some(_) => base + (block_offset << geometry.logical_sector_bits),
            None if entry.state().is_some_and(|s| !s.reads_as_zero()) => {
                return Err(FormatError::BatOffsetOverflow { index: bat_index }.into())
            }
            None => 0,
        },
    };

    Ok(SectorInfo {
        bat_index,
        block_offset,
        sectors_avail,
        bytes_avail,
        file_offset,
        entry,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::MIB;

    fn geometry() -> Geometry {
        Geometry::new(64 * MIB, MIB as u32, 512, 512).unwrap()
    }

    #[test]
    fn entry_packs_state_and_offset() {
        let e = BatEntry::new(PayloadState::FullyPresent, 5 * MIB);
        assert_eq!(e.raw(), 5 * MIB | 6);
        assert_eq!(e.state(), Some(PayloadState::FullyPresent));
        assert_eq!(e.file_offset(), 5 * MIB);
    }

    #[test]
    fn state_four_is_invalid() {
        assert_eq!(BatEntry::from_raw(4).state(), None);
        assert_eq!(
            BatEntry::from_raw(5).state(),
            Some(PayloadState::UnmappedV095)
        );
    }

    #[test]
    fn unallocated_block_translates_to_zero_offset() {
        let g = geometry();
        let bat = Bat::from_entries(2 * MIB, vec![BatEntry::default(); 64]);
        let info = translate(&g, &bat, 2048 + 10, 4).unwrap();
        assert_eq!(info.bat_index, 1);
        assert_eq!(info.block_offset, 10);
        assert_eq!(info.sectors_avail, 4);
        assert_eq!(info.file_offset, 0);
    }

    #[test]
    fn run_is_clamped_to_block_end() {
        let g = geometry();
        let mut entries = vec![BatEntry::default(); 64];
        entries[0] = BatEntry::new(PayloadState::FullyPresent, 4 * MIB);
        let bat = Bat::from_entries(2 * MIB, entries);

        let info = translate(&g, &bat, 2040, 100).unwrap();
        assert_eq!(info.bat_index, 0);
        assert_eq!(info.sectors_avail, 8);
        assert_eq!(info.bytes_avail, 8 * 512);
        assert_eq!(info.file_offset, 4 * MIB + 2040 * 512);
    }

    #[test]
    fn block_past_end_of_address_space_is_rejected() {
        let g = geometry();
        let mut entries = vec![BatEntry::default(); 64];
        entries[0] = BatEntry::from_raw(BAT_OFFSET_MASK | PayloadState::FullyPresent.bits());
        entries[1] = BatEntry::from_raw(BAT_OFFSET_MASK | PayloadState::Zero.bits());
        let bat = Bat::from_entries(2 * MIB, entries);

        let err = translate(&g, &bat, 2047, 1).unwrap_err();
        assert!(matches!(
            err,
            DiskError::Format(FormatError::BatOffsetOverflow { index: 0 })
        ));

        // Zero-like states never touch their storage, so the offset is simply dropped.
        let info = translate(&g, &bat, 2048 + 2047, 1).unwrap();
        assert_eq!(info.file_offset, 0);
        assert_eq!(info.entry.state(), Some(PayloadState::Zero));
    }

    #[test]
    fn translation_skips_bitmap_slots() {
        // chunk_ratio = 128 with 32 MiB blocks
        let g = Geometry::new(200 * 32 * MIB, 32 * MIB as u32, 512, 512).unwrap();
        let bat = Bat::from_entries(2 * MIB, vec![BatEntry::default(); g.bat_entries as usize]);
        let spb = u64::from(g.sectors_per_block);
        assert_eq!(translate(&g, &bat, 127 * spb, 1).unwrap().bat_index, 127);
        assert_eq!(translate(&g, &bat, 128 * spb, 1).unwrap().bat_index, 129);
    }

    #[test]
    fn load_rejects_undersized_region() {
        let g = Geometry::new(200 * 32 * MIB, 32 * MIB as u32, 512, 512).unwrap();
        let region = RegionEntry {
            guid: crate::vhdx::guid::BAT_REGION,
            file_offset: MIB,
            length: 1024,
            flags: crate::vhdx::region::RegionFlags::REQUIRED,
        };
        let mut backend = crate::MemBackend::with_len(4 * MIB).unwrap();
        let err = Bat::load(&mut backend, &region, &g).unwrap_err();
        assert!(matches!(
            err,
            DiskError::Format(FormatError::BatOutOfBounds { .. })
        ));
    }

    #[test]
    fn encode_is_little_endian() {
        let bat = Bat::from_entries(0, vec![BatEntry::from_raw(0x0102_0304_0506_0708)]);
        assert_eq!(bat.encode(), vec![8, 7, 6, 5, 4, 3, 2, 1]);
        assert_eq!(bat.entry_file_offset(3), 24);
    }
}
