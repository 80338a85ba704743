//! File identifier and the two redundant image headers.

use tracing::{debug, info};
use uuid::Uuid;

use super::{checksum, guid, HEADER_SECTION_END};
use crate::util::{le_u16, le_u32, le_u64, put_le_u16, put_le_u32, put_le_u64, KIB};
use crate::{DiskError, FormatError, Result, StorageBackend};

pub const FILE_SIGNATURE: [u8; 8] = *b"vhdxfile";
const FILE_CREATOR_OFFSET: usize = 8;
const FILE_CREATOR_LEN: usize = 512;

pub const HEADER_SIGNATURE: [u8; 4] = *b"head";
pub const HEADER_SIZE: usize = 4 * KIB as usize;
pub const HEADER_SLOT_OFFSETS: [u64; 2] = [64 * KIB, 128 * KIB];
pub const HEADER_VERSION: u16 = 1;
pub const LOG_VERSION: u16 = 0;

const HEADER_CHECKSUM_OFFSET: usize = 4;

/// Build the file identifier block: signature followed by a UTF-16LE creator string.
pub fn encode_file_identifier(creator: &str) -> Vec<u8> {
    let mut raw = vec![0u8; FILE_CREATOR_OFFSET + FILE_CREATOR_LEN];
    raw[..8].copy_from_slice(&FILE_SIGNATURE);
    let units = creator.encode_utf16().take(FILE_CREATOR_LEN / 2 - 1);
    for (i, unit) in units.enumerate() {
        put_le_u16(&mut raw, FILE_CREATOR_OFFSET + i * 2, unit);
    }
    raw
}

pub fn check_file_identifier<B: StorageBackend + ?Sized>(backend: &mut B) -> Result<()> {
    let mut signature = [0u8; 8];
    match backend.read_at(0, &mut signature) {
        Ok(()) => {}
        Err(DiskError::OutOfBounds { .. }) => {
            return Err(FormatError::InvalidSignature("file identifier truncated").into())
        }
        Err(e) => return Err(e),
    }
    if signature != FILE_SIGNATURE {
        return Err(FormatError::InvalidSignature("file identifier").into());
    }
    Ok(())
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VhdxHeader {
    pub sequence_number: u64,
    pub file_write_guid: Uuid,
    pub data_write_guid: Uuid,
    pub log_guid: Uuid,
    pub log_version: u16,
    pub version: u16,
    pub log_length: u32,
    pub log_offset: u64,
}

impl VhdxHeader {
    /// Decode and validate one header slot. `raw` must be exactly [`HEADER_SIZE`] bytes.
    pub fn decode(raw: &[u8]) -> std::result::Result<Self, FormatError> {
        if raw.len() != HEADER_SIZE {
            return Err(FormatError::Corrupt("header slot truncated"));
        }
        if raw[..4] != HEADER_SIGNATURE {
            return Err(FormatError::InvalidSignature("header"));
        }
        if !checksum::verify(raw, HEADER_CHECKSUM_OFFSET) {
            return Err(FormatError::ChecksumMismatch("header"));
        }
        let header = Self {
            sequence_number: le_u64(raw, 8),
            file_write_guid: guid::read_guid(raw, 16),
            data_write_guid: guid::read_guid(raw, 32),
            log_guid: guid::read_guid(raw, 48),
            log_version: le_u16(raw, 64),
            version: le_u16(raw, 66),
            log_length: le_u32(raw, 68),
            log_offset: le_u64(raw, 72),
        };
        if header.version != HEADER_VERSION {
            return Err(FormatError::Corrupt("header version is not 1"));
        }
        Ok(header)
    }

    /// Encode into a full [`HEADER_SIZE`] block with a fresh checksum.
    pub fn encode(&self) -> Vec<u8> {
        let mut raw = vec![0u8; HEADER_SIZE];
        raw[..4].copy_from_slice(&HEADER_SIGNATURE);
        put_le_u64(&mut raw, 8, self.sequence_number);
        guid::put_guid(&mut raw, 16, &self.file_write_guid);
        guid::put_guid(&mut raw, 32, &self.data_write_guid);
        guid::put_guid(&mut raw, 48, &self.log_guid);
        put_le_u16(&mut raw, 64, self.log_version);
        put_le_u16(&mut raw, 66, self.version);
        put_le_u32(&mut raw, 68, self.log_length);
        put_le_u64(&mut raw, 72, self.log_offset);
        checksum::update(&mut raw, HEADER_CHECKSUM_OFFSET);
        raw
    }

    /// Validate the log fields against the fixed layout.
    pub fn validate_log_fields(&self) -> Result<()> {
        if self.log_version != LOG_VERSION {
            return Err(DiskError::Unsupported("log version"));
        }
        let mib = HEADER_SECTION_END;
        if !u64::from(self.log_length).is_multiple_of(mib) || !self.log_offset.is_multiple_of(mib)
        {
            return Err(FormatError::Corrupt("log region not 1 MiB aligned").into());
        }
        if self.log_length != 0 && self.log_offset < HEADER_SECTION_END {
            return Err(FormatError::Corrupt("log region overlaps header section").into());
        }
        Ok(())
    }
}

/// One header slot as read from disk: the raw block plus its decode outcome.
#[derive(Debug)]
pub struct HeaderSlot {
    pub raw: Vec<u8>,
    pub decoded: std::result::Result<VhdxHeader, FormatError>,
}

impl HeaderSlot {
    pub fn from_raw(raw: Vec<u8>) -> Self {
        let decoded = VhdxHeader::decode(&raw);
        Self { raw, decoded }
    }

    fn valid(&self) -> Option<&VhdxHeader> {
        self.decoded.as_ref().ok()
    }
}

/// Pick the current header slot.
///
/// The valid header with the larger sequence number wins. Equal sequence numbers are only
/// accepted when both blocks are byte-identical (some third-party writers produce such pairs);
/// slot 0 is reported in that case.
pub fn select_current(slots: &[HeaderSlot; 2]) -> std::result::Result<usize, FormatError> {
    match (slots[0].valid(), slots[1].valid()) {
        (None, None) => Err(FormatError::NoValidHeader),
        (Some(_), None) => Ok(0),
        (None, Some(_)) => Ok(1),
        (Some(h1), Some(h2)) => {
            if h1.sequence_number > h2.sequence_number {
                Ok(0)
            } else if h2.sequence_number > h1.sequence_number {
                Ok(1)
            } else if slots[0].raw == slots[1].raw {
                Ok(0)
            } else {
                Err(FormatError::Corrupt(
                    "headers share a sequence number but differ",
                ))
            }
        }
    }
}

/// The pair of on-disk headers and which one is current.
#[derive(Debug, Clone)]
pub struct Headers {
    current: VhdxHeader,
    current_slot: usize,
}

impl Headers {
    pub fn parse<B: StorageBackend + ?Sized>(backend: &mut B) -> Result<Self> {
        let slots = [
            read_slot(backend, HEADER_SLOT_OFFSETS[0])?,
            read_slot(backend, HEADER_SLOT_OFFSETS[1])?,
        ];
        for (idx, slot) in slots.iter().enumerate() {
            if let Err(err) = &slot.decoded {
                debug!(slot = idx, %err, "vhdx header slot rejected");
            }
        }
        let current_slot = select_current(&slots)?;
        let [first, second] = slots;
        let current = match current_slot {
            0 => first.decoded,
            _ => second.decoded,
        }?;
        debug!(
            slot = current_slot,
            sequence = current.sequence_number,
            "selected vhdx header"
        );
        Ok(Self {
            current,
            current_slot,
        })
    }

    pub fn current(&self) -> &VhdxHeader {
        &self.current
    }

    pub fn current_slot(&self) -> usize {
        self.current_slot
    }

    /// Write the inactive slot and make it current.
    ///
    /// The new header copies the current one with `sequence_number + 1` and the session's
    /// file-write GUID. `generate_data_guid` stamps a fresh data-write GUID, which must happen
    /// before the first guest-visible write of a session. Callers that need both slots to be
    /// valid use [`Headers::update_both`].
    pub fn update<B: StorageBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        session_guid: Uuid,
        generate_data_guid: bool,
        log_guid: Option<Uuid>,
    ) -> Result<()> {
        let data_guid = generate_data_guid.then(guid::generate);
        self.write_inactive(backend, session_guid, data_guid, log_guid)
    }

    /// One full update cycle: both slots are rewritten, sharing one fresh data-write GUID.
    pub fn update_both<B: StorageBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        session_guid: Uuid,
        generate_data_guid: bool,
        log_guid: Option<Uuid>,
    ) -> Result<()> {
        let data_guid = generate_data_guid.then(guid::generate);
        for _ in 0..2 {
            self.write_inactive(backend, session_guid, data_guid, log_guid)?;
        }
        info!(
            sequence = self.current.sequence_number,
            data_guid = generate_data_guid,
            "updated vhdx headers"
        );
        Ok(())
    }

    fn write_inactive<B: StorageBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        session_guid: Uuid,
        data_guid: Option<Uuid>,
        log_guid: Option<Uuid>,
    ) -> Result<()> {
        let target_slot = 1 - self.current_slot;
        let mut next = self.current.clone();
        next.sequence_number = next
            .sequence_number
            .checked_add(1)
            .ok_or(FormatError::Corrupt("header sequence number exhausted"))?;
        next.file_write_guid = session_guid;
        if let Some(data_guid) = data_guid {
            next.data_write_guid = data_guid;
        }
        if let Some(log_guid) = log_guid {
            next.log_guid = log_guid;
        }

        backend.write_at(HEADER_SLOT_OFFSETS[target_slot], &next.encode())?;
        backend.flush()?;

        self.current = next;
        self.current_slot = target_slot;
        Ok(())
    }
}

fn read_slot<B: StorageBackend + ?Sized>(backend: &mut B, offset: u64) -> Result<HeaderSlot> {
    let mut raw = vec![0u8; HEADER_SIZE];
    match backend.read_at(offset, &mut raw) {
        Ok(()) => Ok(HeaderSlot::from_raw(raw)),
        // A truncated slot is simply invalid; the other slot may still be usable.
        Err(DiskError::OutOfBounds { .. }) => Ok(HeaderSlot {
            raw,
            decoded: Err(FormatError::Corrupt("header slot truncated")),
        }),
        Err(e) => Err(e),
    }
}
