//! Region table parsing and the runtime registry of occupied file ranges.

use bitflags::bitflags;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{checksum, guid, HEADER_SECTION_END};
use crate::util::{le_u32, le_u64, put_le_u32, put_le_u64, ranges_overlap, KIB, MIB};
use crate::{DiskError, FormatError, Result, StorageBackend};

pub const REGION_TABLE_SIGNATURE: [u8; 4] = *b"regi";
pub const REGION_TABLE_SIZE: usize = 64 * KIB as usize;
pub const REGION_TABLE_OFFSETS: [u64; 2] = [192 * KIB, 256 * KIB];
pub const MAX_REGION_ENTRIES: u32 = 2047;

const REGION_CHECKSUM_OFFSET: usize = 4;
const REGION_HEADER_LEN: usize = 16;
const REGION_ENTRY_LEN: usize = 32;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct RegionFlags: u32 {
        const REQUIRED = 1 << 0;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegionEntry {
    pub guid: Uuid,
    pub file_offset: u64,
    pub length: u32,
    pub flags: RegionFlags,
}

impl RegionEntry {
    pub fn end(&self) -> Option<u64> {
        self.file_offset.checked_add(u64::from(self.length))
    }

    fn decode(raw: &[u8]) -> Self {
        Self {
            guid: guid::read_guid(raw, 0),
            file_offset: le_u64(raw, 16),
            length: le_u32(raw, 24),
            flags: RegionFlags::from_bits_retain(le_u32(raw, 28)),
        }
    }

    fn encode(&self, raw: &mut [u8]) {
        guid::put_guid(raw, 0, &self.guid);
        put_le_u64(raw, 16, self.file_offset);
        put_le_u32(raw, 24, self.length);
        put_le_u32(raw, 28, self.flags.bits());
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegionTable {
    pub entries: Vec<RegionEntry>,
}

impl RegionTable {
    pub fn decode(raw: &[u8]) -> std::result::Result<Self, FormatError> {
        if raw.len() != REGION_TABLE_SIZE {
            return Err(FormatError::Corrupt("region table truncated"));
        }
        if raw[..4] != REGION_TABLE_SIGNATURE {
            return Err(FormatError::InvalidSignature("region table"));
        }
        if !checksum::verify(raw, REGION_CHECKSUM_OFFSET) {
            return Err(FormatError::ChecksumMismatch("region table"));
        }
        let count = le_u32(raw, 8);
        if count > MAX_REGION_ENTRIES {
            return Err(FormatError::Corrupt("region table entry count exceeds 2047"));
        }
        let entries = (0..count as usize)
            .map(|i| {
                let start = REGION_HEADER_LEN + i * REGION_ENTRY_LEN;
                RegionEntry::decode(&raw[start..start + REGION_ENTRY_LEN])
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, FormatError> {
        if self.entries.len() > MAX_REGION_ENTRIES as usize {
            return Err(FormatError::Corrupt("region table entry count exceeds 2047"));
        }
        let mut raw = vec![0u8; REGION_TABLE_SIZE];
        raw[..4].copy_from_slice(&REGION_TABLE_SIGNATURE);
        put_le_u32(&mut raw, 8, self.entries.len() as u32);
        for (i, entry) in self.entries.iter().enumerate() {
            let start = REGION_HEADER_LEN + i * REGION_ENTRY_LEN;
            entry.encode(&mut raw[start..start + REGION_ENTRY_LEN]);
        }
        checksum::update(&mut raw, REGION_CHECKSUM_OFFSET);
        Ok(raw)
    }
}

/// Half-open byte range `[start, end)` of the image file that belongs to a known structure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisteredRegion {
    pub start: u64,
    pub end: u64,
}

/// Every file range claimed by headers, log, and region-table entries while an image is open.
#[derive(Debug, Clone, Default)]
pub struct RegionSet {
    regions: Vec<RegisteredRegion>,
}

impl RegionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn overlaps(&self, start: u64, len: u64) -> bool {
        let Some(end) = start.checked_add(len) else {
            return true;
        };
        self.regions
            .iter()
            .any(|r| ranges_overlap(start, end, r.start, r.end))
    }

    pub fn register(&mut self, start: u64, len: u64) -> std::result::Result<(), FormatError> {
        let end = start
            .checked_add(len)
            .ok_or(FormatError::OverlappingRegions { start, len })?;
        if self.overlaps(start, len) {
            return Err(FormatError::OverlappingRegions { start, len });
        }
        self.regions.push(RegisteredRegion { start, end });
        Ok(())
    }

    pub fn iter(&self) -> impl Iterator<Item = &RegisteredRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

/// The two regions every image must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownRegions {
    pub bat: RegionEntry,
    pub metadata: RegionEntry,
}

/// Read the active region table and register its entries in `regions`.
///
/// Table 1 is authoritative; table 2 is only consulted when table 1 fails its signature or
/// checksum.
pub fn parse_regions<B: StorageBackend>(
    backend: &mut B,
    regions: &mut RegionSet,
) -> Result<KnownRegions> {
    let table = match read_table(backend, REGION_TABLE_OFFSETS[0])? {
        Ok(table) => table,
        Err(err) => {
            warn!(%err, "region table 1 invalid, falling back to region table 2");
            read_table(backend, REGION_TABLE_OFFSETS[1])??
        }
    };
    classify(&table, regions)
}

fn read_table<B: StorageBackend>(
    backend: &mut B,
    offset: u64,
) -> Result<std::result::Result<RegionTable, FormatError>> {
    let mut raw = vec![0u8; REGION_TABLE_SIZE];
    match backend.read_at(offset, &mut raw) {
        Ok(()) => Ok(RegionTable::decode(&raw)),
        Err(DiskError::OutOfBounds { .. }) => Ok(Err(FormatError::Corrupt("region table truncated"))),
        Err(e) => Err(e),
    }
}

/// Register every entry and pick out the BAT and metadata regions.
pub fn classify(table: &RegionTable, regions: &mut RegionSet) -> Result<KnownRegions> {
    let mut bat = None;
    let mut metadata = None;

    for entry in &table.entries {
        if entry.length == 0 {
            return Err(FormatError::Corrupt("region entry has zero length").into());
        }
        if !entry.file_offset.is_multiple_of(MIB) || !u64::from(entry.length).is_multiple_of(MIB) {
            return Err(FormatError::Corrupt("region entry not 1 MiB aligned").into());
        }
        if entry.file_offset < HEADER_SECTION_END {
            return Err(FormatError::OverlappingRegions {
                start: entry.file_offset,
                len: u64::from(entry.length),
            }
            .into());
        }
        regions.register(entry.file_offset, u64::from(entry.length))?;

        let slot = if entry.guid == guid::BAT_REGION {
            &mut bat
        } else if entry.guid == guid::METADATA_REGION {
            &mut metadata
        } else {
            if entry.flags.contains(RegionFlags::REQUIRED) {
                return Err(FormatError::UnsupportedRequiredFeature("region").into());
            }
            debug!(guid = %entry.guid, "ignoring optional region");
            continue;
        };
        if slot.replace(*entry).is_some() {
            return Err(FormatError::DuplicateRequiredEntry("region").into());
        }
    }

    let bat = bat.ok_or(FormatError::Corrupt("missing bat region"))?;
    let metadata = metadata.ok_or(FormatError::Corrupt("missing metadata region"))?;
    debug!(
        bat_offset = bat.file_offset,
        bat_length = bat.length,
        metadata_offset = metadata.file_offset,
        metadata_length = metadata.length,
        "parsed vhdx region table"
    );
    Ok(KnownRegions { bat, metadata })
}
