//! Metadata region: the entry directory and the five items describing the virtual disk.

use bitflags::bitflags;
use tracing::debug;
use uuid::Uuid;

use super::geometry::Geometry;
use super::guid;
use super::region::RegionEntry;
use crate::util::{le_u16, le_u32, le_u64, put_le_u16, put_le_u32, put_le_u64, KIB};
use crate::{DiskError, FormatError, Result, StorageBackend};

pub const METADATA_SIGNATURE: [u8; 8] = *b"metadata";
pub const METADATA_TABLE_SIZE: u32 = 64 * KIB as u32;

const METADATA_HEADER_LEN: usize = 32;
const METADATA_ENTRY_LEN: usize = 32;

pub const MAX_METADATA_ENTRIES: usize =
    (METADATA_TABLE_SIZE as usize - METADATA_HEADER_LEN) / METADATA_ENTRY_LEN;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct MetadataFlags: u32 {
        const IS_USER = 1 << 0;
        const IS_VIRTUAL_DISK = 1 << 1;
        const IS_REQUIRED = 1 << 2;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct FileParameterFlags: u32 {
        const LEAVE_BLOCKS_ALLOCATED = 1 << 0;
        const HAS_PARENT = 1 << 1;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetadataEntry {
    pub item_id: Uuid,
    pub offset: u32,
    pub length: u32,
    pub flags: MetadataFlags,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataTable {
    pub entries: Vec<MetadataEntry>,
}

impl MetadataTable {
    pub fn decode(raw: &[u8]) -> std::result::Result<Self, FormatError> {
        if raw.len() < METADATA_TABLE_SIZE as usize {
            return Err(FormatError::Corrupt("metadata table truncated"));
        }
        if raw[..8] != METADATA_SIGNATURE {
            return Err(FormatError::InvalidSignature("metadata table"));
        }
        let count = le_u16(raw, 10) as usize;
        if count > MAX_METADATA_ENTRIES {
            return Err(FormatError::Corrupt("metadata entry count exceeds table size"));
        }
        let entries = (0..count)
            .map(|i| {
                let e = METADATA_HEADER_LEN + i * METADATA_ENTRY_LEN;
                MetadataEntry {
                    item_id: guid::read_guid(raw, e),
                    offset: le_u32(raw, e + 16),
                    length: le_u32(raw, e + 20),
                    flags: MetadataFlags::from_bits_retain(le_u32(raw, e + 24)),
                }
            })
            .collect();
        Ok(Self { entries })
    }

    pub fn encode(&self) -> std::result::Result<Vec<u8>, FormatError> {
        if self.entries.len() > MAX_METADATA_ENTRIES {
            return Err(FormatError::Corrupt("metadata entry count exceeds table size"));
        }
        let mut raw = vec![0u8; METADATA_TABLE_SIZE as usize];
        raw[..8].copy_from_slice(&METADATA_SIGNATURE);
        put_le_u16(&mut raw, 10, self.entries.len() as u16);
        for (i, entry) in self.entries.iter().enumerate() {
            let e = METADATA_HEADER_LEN + i * METADATA_ENTRY_LEN;
            guid::put_guid(&mut raw, e, &entry.item_id);
            put_le_u32(&mut raw, e + 16, entry.offset);
            put_le_u32(&mut raw, e + 20, entry.length);
            put_le_u32(&mut raw, e + 24, entry.flags.bits());
        }
        Ok(raw)
    }
}

/// The five items every image carries, in directory order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KnownItem {
    FileParameters,
    VirtualDiskSize,
    Page83Data,
    LogicalSectorSize,
    PhysicalSectorSize,
}

impl KnownItem {
    const ALL: [KnownItem; 5] = [
        KnownItem::FileParameters,
        KnownItem::VirtualDiskSize,
        KnownItem::Page83Data,
        KnownItem::LogicalSectorSize,
        KnownItem::PhysicalSectorSize,
    ];

    fn from_guid(id: &Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|item| item.guid() == *id)
    }

    fn guid(self) -> Uuid {
        match self {
            KnownItem::FileParameters => guid::FILE_PARAMETERS,
            KnownItem::VirtualDiskSize => guid::VIRTUAL_DISK_SIZE,
            KnownItem::Page83Data => guid::PAGE_83_DATA,
            KnownItem::LogicalSectorSize => guid::LOGICAL_SECTOR_SIZE,
            KnownItem::PhysicalSectorSize => guid::PHYSICAL_SECTOR_SIZE,
        }
    }

    fn bit(self) -> u8 {
        1 << (self as u8)
    }

    fn payload_len(self) -> u32 {
        match self {
            KnownItem::FileParameters | KnownItem::VirtualDiskSize => 8,
            KnownItem::Page83Data => 16,
            KnownItem::LogicalSectorSize | KnownItem::PhysicalSectorSize => 4,
        }
    }

    fn name(self) -> &'static str {
        match self {
            KnownItem::FileParameters => "file parameters",
            KnownItem::VirtualDiskSize => "virtual disk size",
            KnownItem::Page83Data => "page 83 data",
            KnownItem::LogicalSectorSize => "logical sector size",
            KnownItem::PhysicalSectorSize => "physical sector size",
        }
    }

    fn flags(self) -> MetadataFlags {
        match self {
            KnownItem::FileParameters => MetadataFlags::IS_REQUIRED,
            _ => MetadataFlags::IS_REQUIRED | MetadataFlags::IS_VIRTUAL_DISK,
        }
    }
}

const ALL_KNOWN: u8 = 0b1_1111;

/// Decoded contents of the metadata region.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdxMetadata {
    pub block_size: u32,
    pub file_flags: FileParameterFlags,
    pub virtual_size: u64,
    pub page83: Uuid,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
}

impl VhdxMetadata {
    pub fn geometry(&self) -> std::result::Result<Geometry, FormatError> {
        Geometry::new(
            self.virtual_size,
            self.block_size,
            self.logical_sector_size,
            self.physical_sector_size,
        )
    }

    /// Item payloads are packed right after the 64 KiB table, in directory order.
    fn item_offset(item: KnownItem) -> u32 {
        let before: u32 = KnownItem::ALL
            .iter()
            .take_while(|i| **i != item)
            .map(|i| i.payload_len())
            .sum();
        METADATA_TABLE_SIZE + before
    }

    /// Encode the table followed by every item payload, ready to be written at the start of the
    /// metadata region.
    pub fn encode(&self) -> std::result::Result<Vec<u8>, FormatError> {
        let table = MetadataTable {
            entries: KnownItem::ALL
                .iter()
                .map(|&item| MetadataEntry {
                    item_id: item.guid(),
                    offset: Self::item_offset(item),
                    length: item.payload_len(),
                    flags: item.flags(),
                })
                .collect(),
        };
        let mut raw = table.encode()?;
        let items_len: u32 = KnownItem::ALL.iter().map(|i| i.payload_len()).sum();
        raw.resize(raw.len() + items_len as usize, 0);

        let at = |item| Self::item_offset(item) as usize;
        put_le_u32(&mut raw, at(KnownItem::FileParameters), self.block_size);
        put_le_u32(
            &mut raw,
            at(KnownItem::FileParameters) + 4,
            self.file_flags.bits(),
        );
        put_le_u64(&mut raw, at(KnownItem::VirtualDiskSize), self.virtual_size);
        guid::put_guid(&mut raw, at(KnownItem::Page83Data), &self.page83);
        put_le_u32(
            &mut raw,
            at(KnownItem::LogicalSectorSize),
            self.logical_sector_size,
        );
        put_le_u32(
            &mut raw,
            at(KnownItem::PhysicalSectorSize),
            self.physical_sector_size,
        );
        Ok(raw)
    }
}

/// Known items located by a directory scan.
#[derive(Debug, Default)]
struct ItemDirectory {
    present: u8,
    entries: [Option<MetadataEntry>; 5],
    parent_locator: Option<MetadataEntry>,
}

impl ItemDirectory {
    fn scan(table: &MetadataTable) -> std::result::Result<Self, FormatError> {
        let mut dir = Self::default();
        for entry in &table.entries {
            if let Some(item) = KnownItem::from_guid(&entry.item_id) {
                if dir.present & item.bit() != 0 {
                    return Err(FormatError::DuplicateRequiredEntry(item.name()));
                }
                dir.present |= item.bit();
                dir.entries[item as usize] = Some(*entry);
            } else if entry.item_id == guid::PARENT_LOCATOR {
                if dir.parent_locator.replace(*entry).is_some() {
                    return Err(FormatError::DuplicateRequiredEntry("parent locator"));
                }
            } else if entry.flags.contains(MetadataFlags::IS_REQUIRED) {
                return Err(FormatError::UnsupportedRequiredFeature("metadata item"));
            } else {
                debug!(item = %entry.item_id, "ignoring optional metadata item");
            }
        }
        if dir.present != ALL_KNOWN {
            return Err(FormatError::Corrupt("metadata is missing a required item"));
        }
        Ok(dir)
    }

    fn entry(&self, item: KnownItem) -> std::result::Result<MetadataEntry, FormatError> {
        self.entries[item as usize].ok_or(FormatError::Corrupt("metadata is missing a required item"))
    }
}

/// Parse and validate the metadata region described by `region`.
pub fn parse_metadata<B: StorageBackend>(
    backend: &mut B,
    region: &RegionEntry,
) -> Result<VhdxMetadata> {
    if region.length < METADATA_TABLE_SIZE {
        return Err(FormatError::Corrupt("metadata region smaller than its table").into());
    }
    let mut raw = vec![0u8; METADATA_TABLE_SIZE as usize];
    read_region(backend, region.file_offset, &mut raw)?;
    let table = MetadataTable::decode(&raw)?;
    let dir = ItemDirectory::scan(&table)?;

    let params = read_item(backend, region, &dir, KnownItem::FileParameters)?;
    let block_size = le_u32(&params, 0);
    let file_flags = FileParameterFlags::from_bits_retain(le_u32(&params, 4));

    let has_parent = file_flags.contains(FileParameterFlags::HAS_PARENT);
    match (has_parent, dir.parent_locator.is_some()) {
        (true, true) => return Err(FormatError::DifferencingUnsupported.into()),
        (false, false) => {}
        _ => {
            return Err(
                FormatError::Corrupt("parent locator does not match has-parent flag").into(),
            )
        }
    }

    let virtual_size = le_u64(
        &read_item(backend, region, &dir, KnownItem::VirtualDiskSize)?,
        0,
    );
    let page83 = guid::read_guid(&read_item(backend, region, &dir, KnownItem::Page83Data)?, 0);
    let logical_sector_size = le_u32(
        &read_item(backend, region, &dir, KnownItem::LogicalSectorSize)?,
        0,
    );
    let physical_sector_size = le_u32(
        &read_item(backend, region, &dir, KnownItem::PhysicalSectorSize)?,
        0,
    );

    let metadata = VhdxMetadata {
        block_size,
        file_flags,
        virtual_size,
        page83,
        logical_sector_size,
        physical_sector_size,
    };
    debug!(
        block_size,
        virtual_size,
        logical_sector_size,
        physical_sector_size,
        flags = file_flags.bits(),
        "parsed vhdx metadata"
    );
    Ok(metadata)
}

fn read_item<B: StorageBackend>(
    backend: &mut B,
    region: &RegionEntry,
    dir: &ItemDirectory,
    item: KnownItem,
) -> Result<Vec<u8>> {
    let entry = dir.entry(item)?;
    let min_len = item.payload_len();
    if entry.length < min_len {
        return Err(FormatError::Corrupt("metadata item shorter than its payload").into());
    }
    if entry.offset < METADATA_TABLE_SIZE {
        return Err(FormatError::Corrupt("metadata item overlaps the metadata table").into());
    }
    let item_end = u64::from(entry.offset) + u64::from(entry.length);
    if item_end > u64::from(region.length) {
        return Err(FormatError::Corrupt("metadata item extends past its region").into());
    }
    let mut buf = vec![0u8; min_len as usize];
    read_region(
        backend,
        region.file_offset + u64::from(entry.offset),
        &mut buf,
    )?;
    Ok(buf)
}

fn read_region<B: StorageBackend>(backend: &mut B, offset: u64, buf: &mut [u8]) -> Result<()> {
    match backend.read_at(offset, buf) {
        Err(DiskError::OutOfBounds { .. }) => {
            Err(FormatError::Corrupt("metadata region truncated").into())
        }
        other => other,
    }
}
