//! Open-image state and the read/write paths built on top of it.
//!
//! Everything here is synchronous and operates on a borrowed backend. [`crate::VhdxDisk`] owns a
//! backend and calls straight through; [`crate::SharedVhdxDisk`] splits each request into the
//! steps that touch image state and the payload transfers that don't.

use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use super::bat::{translate, Bat, BatEntry, PayloadState, SectorInfo};
use super::check::{scan_bat, CheckMode, CheckReport};
use super::create::VhdxSubformat;
use super::geometry::Geometry;
use super::header::{check_file_identifier, Headers, VhdxHeader};
use super::log::{DirectLog, LogRecord, MetadataLog};
use super::metadata::{parse_metadata, FileParameterFlags, VhdxMetadata};
use super::region::{parse_regions, RegionSet};
use super::{guid, HEADER_SECTION_END};
use crate::util::{align_up_u64, checked_range, MIB};
use crate::{DiskError, FormatError, Result, StorageBackend};

/// Options controlling [`crate::VhdxDisk::open_with_options`].
pub struct VhdxOpenOptions {
    /// Reject writes and leave the headers untouched.
    pub read_only: bool,
    /// Do not fail `open` on BAT corruption; used before running [`crate::VhdxDisk::check`].
    pub skip_bat_validation: bool,
    /// Log collaborator; [`DirectLog`] when `None`.
    pub log: Option<Box<dyn MetadataLog>>,
}

impl Default for VhdxOpenOptions {
    fn default() -> Self {
        Self {
            read_only: false,
            skip_bat_validation: false,
            log: None,
        }
    }
}

impl std::fmt::Debug for VhdxOpenOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VhdxOpenOptions")
            .field("read_only", &self.read_only)
            .field("skip_bat_validation", &self.skip_bat_validation)
            .field("custom_log", &self.log.is_some())
            .finish()
    }
}

/// Summary of an open image.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageInfo {
    pub virtual_size: u64,
    pub block_size: u32,
    pub logical_sector_size: u32,
    pub physical_sector_size: u32,
    pub subformat: VhdxSubformat,
    pub bat_entries: u64,
    pub allocated_blocks: u64,
    pub sequence_number: u64,
    pub disk_id: Uuid,
}

/// One contiguous piece of a guest request, confined to a single payload block.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Segment {
    pub len: u64,
    /// Byte offset of the piece inside its payload block.
    pub in_block: u64,
    pub info: SectorInfo,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ReadSource {
    Zero,
    File(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReadChunk {
    pub buf_offset: usize,
    pub len: usize,
    pub source: ReadSource,
}

/// Compensating action for a BAT entry changed ahead of its payload write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct BatUndo {
    pub bat_index: u64,
    pub prior: BatEntry,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct WritePlan {
    pub len: usize,
    pub file_offset: u64,
    pub undo: Option<BatUndo>,
}

pub(crate) struct ImageState {
    pub headers: Headers,
    pub registered: RegionSet,
    pub metadata: VhdxMetadata,
    pub geometry: Geometry,
    pub bat: Bat,
    pub log: Box<dyn MetadataLog>,
    pub session_guid: Uuid,
    pub read_only: bool,
    pub first_write_pending: bool,
    pub log_replayed: bool,
}

impl ImageState {
    pub fn open<B: StorageBackend>(backend: &mut B, options: VhdxOpenOptions) -> Result<Self> {
        let VhdxOpenOptions {
            read_only,
            skip_bat_validation,
            log,
        } = options;
        let mut log = log.unwrap_or_else(|| Box::new(DirectLog::new()));

        check_file_identifier(backend)?;
        let mut headers = Headers::parse(backend)?;
        headers.current().validate_log_fields()?;

        let mut registered = RegionSet::new();
        registered.register(0, HEADER_SECTION_END)?;
        register_log(&mut registered, headers.current())?;

        let log_replayed = log.replay(backend, headers.current(), read_only)?;
        if log_replayed {
            debug!("vhdx log replayed, re-reading headers");
            headers = Headers::parse(backend)?;
        }

        let regions = parse_regions(backend, &mut registered)?;
        let metadata = parse_metadata(backend, &regions.metadata)?;
        let geometry = metadata.geometry()?;
        debug!(
            block_size = geometry.block_size,
            sectors_per_block = geometry.sectors_per_block,
            chunk_ratio = geometry.chunk_ratio,
            bat_entries = geometry.bat_entries,
            "vhdx geometry"
        );
        let bat = Bat::load(backend, &regions.bat, &geometry)?;

        let mut state = Self {
            headers,
            registered,
            metadata,
            geometry,
            bat,
            log,
            session_guid: Uuid::nil(),
            read_only,
            first_write_pending: !read_only,
            log_replayed,
        };

        if !skip_bat_validation {
            let file_len = backend.len()?;
            let scan = scan_bat(
                &state.geometry,
                &state.bat,
                &state.registered,
                file_len,
                CheckMode::StopAtFirst,
            );
            if let Some(err) = scan.first {
                return Err(err.into());
            }
        }

        if !read_only {
            state.session_guid = guid::generate();
            state
                .headers
                .update_both(backend, state.session_guid, false, None)?;
        }
        Ok(state)
    }

    pub fn capacity(&self) -> u64 {
        self.geometry.virtual_size
    }

    pub fn header(&self) -> &VhdxHeader {
        self.headers.current()
    }

    pub fn subformat(&self) -> VhdxSubformat {
        if self
            .metadata
            .file_flags
            .contains(FileParameterFlags::LEAVE_BLOCKS_ALLOCATED)
        {
            VhdxSubformat::Fixed
        } else {
            VhdxSubformat::Dynamic
        }
    }

    pub fn info(&self) -> ImageInfo {
        let allocated_blocks = self
            .bat
            .iter()
            .filter(|(idx, entry)| {
                self.geometry.payload_block_of(*idx).is_some()
                    && entry.state() == Some(PayloadState::FullyPresent)
            })
            .count() as u64;
        ImageInfo {
            virtual_size: self.geometry.virtual_size,
            block_size: self.geometry.block_size,
            logical_sector_size: self.geometry.logical_sector_size,
            physical_sector_size: self.geometry.physical_sector_size,
            subformat: self.subformat(),
            bat_entries: self.bat.len(),
            allocated_blocks,
            sequence_number: self.headers.current().sequence_number,
            disk_id: self.metadata.page83,
        }
    }

    pub fn check_range(&self, offset: u64, len: usize) -> Result<()> {
        checked_range(offset, len, self.capacity())
    }

    pub fn check_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(DiskError::ReadOnly);
        }
        Ok(())
    }

    /// Translate the piece of `[offset, offset + remaining)` that lies in the first block.
    fn segment(&self, offset: u64, remaining: u64) -> Result<Segment> {
        let g = &self.geometry;
        let lss = u64::from(g.logical_sector_size);
        let sector = offset >> g.logical_sector_bits;
        let in_sector = offset & (lss - 1);
        let nb_sectors = (in_sector + remaining).div_ceil(lss);

        let info = translate(g, &self.bat, sector, nb_sectors)?;
        let len = (info.bytes_avail - in_sector).min(remaining);
        let in_block = (info.block_offset << g.logical_sector_bits) + in_sector;
        Ok(Segment {
            len,
            in_block,
            info,
        })
    }

    /// Resolve a guest read into zero fills and file reads. Pure; the BAT is not touched.
    pub fn map_read(&self, offset: u64, len: usize) -> Result<Vec<ReadChunk>> {
        self.check_range(offset, len)?;
        let mut chunks = Vec::new();
        let mut done = 0usize;
        while done < len {
            let seg = self.segment(offset + done as u64, (len - done) as u64)?;
            let state = seg
                .info
                .entry
                .state()
                .ok_or(FormatError::Corrupt("invalid bat entry state"))?;
            let source = match state {
                s if s.reads_as_zero() => ReadSource::Zero,
                PayloadState::FullyPresent => ReadSource::File(present_offset(&seg)?),
                _ => return Err(DiskError::Unsupported("partially present blocks")),
            };
            let seg_len = seg.len as usize;
            chunks.push(ReadChunk {
                buf_offset: done,
                len: seg_len,
                source,
            });
            done += seg_len;
        }
        Ok(chunks)
    }

    pub fn read<B: StorageBackend>(&self, backend: &mut B, offset: u64, buf: &mut [u8]) -> Result<()> {
        let chunks = self.map_read(offset, buf.len())?;
        execute_read(backend, &chunks, buf)
    }

    /// Stamp a fresh data-write GUID before the first guest-visible change of the session.
    pub fn user_visible_write<B: StorageBackend>(&mut self, backend: &mut B) -> Result<()> {
        if !self.first_write_pending {
            return Ok(());
        }
        self.headers
            .update_both(backend, self.session_guid, true, None)?;
        self.first_write_pending = false;
        Ok(())
    }

    /// Resolve the next piece of a guest write, allocating its block when needed.
    ///
    /// Block allocation and zero-fill happen here together with the BAT update, so the caller
    /// only performs the payload transfer. When the plan carries `undo`, the BAT entry has already been
    /// changed and handed to the log; a failed payload write must be followed by
    /// [`ImageState::rollback`].
    pub fn prepare_write<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        offset: u64,
        remaining: u64,
    ) -> Result<WritePlan> {
        let seg = self.segment(offset, remaining)?;
        let state = seg
            .info
            .entry
            .state()
            .ok_or(FormatError::Corrupt("invalid bat entry state"))?;
        match state {
            PayloadState::FullyPresent => Ok(WritePlan {
                len: seg.len as usize,
                file_offset: present_offset(&seg)?,
                undo: None,
            }),
            PayloadState::PartiallyPresent => Err(DiskError::Unsupported("partially present blocks")),
            _ => self.allocate_for_write(backend, &seg, state),
        }
    }

    fn allocate_for_write<B: StorageBackend>(
        &mut self,
        backend: &mut B,
        seg: &Segment,
        state: PayloadState,
    ) -> Result<WritePlan> {
        let block_size = u64::from(self.geometry.block_size);
        let prior = seg.info.entry;
        let bat_index = seg.info.bat_index;

        // A ZERO block that still owns storage (fixed images created with the zero preference)
        // is rewritten in place when its guest-sized extent lies inside the file and outside
        // every registered region.
        let payload_len = self
            .geometry
            .payload_block_of(bat_index)
            .map_or(block_size, |block| self.geometry.payload_block_len(block));
        let prior_offset = prior.file_offset();
        let reusable = state == PayloadState::Zero
            && prior_offset >= HEADER_SECTION_END
            && prior_offset.checked_add(block_size).is_some()
            && !self.registered.overlaps(prior_offset, payload_len)
            && prior_offset + payload_len <= backend.len()?;
        let (block_start, extent, need_zero) = if reusable {
            (prior_offset, payload_len, true)
        } else {
            let (start, need_zero) = allocate_block(backend, block_size)?;
            (start, block_size, need_zero)
        };

        // Zero the parts of the block this write leaves untouched before the block becomes
        // visible through the BAT.
        if need_zero {
            write_zeroes(backend, block_start, seg.in_block)?;
            let write_end = seg.in_block + seg.len;
            write_zeroes(backend, block_start + write_end, extent - write_end)?;
        }

        let updated = BatEntry::new(PayloadState::FullyPresent, block_start);
        self.bat.set(bat_index, updated)?;
        if let Err(err) = self.log_bat_entry(backend, bat_index) {
            // The updated record may still be queued; queue the prior entry behind it.
            self.rollback(backend, BatUndo { bat_index, prior });
            return Err(err);
        }
        debug!(
            bat_index,
            block_start,
            reused = reusable,
            "allocated vhdx payload block"
        );

        Ok(WritePlan {
            len: seg.len as usize,
            file_offset: block_start + seg.in_block,
            undo: Some(BatUndo { bat_index, prior }),
        })
    }

    fn log_bat_entry<B: StorageBackend>(&mut self, backend: &mut B, bat_index: u64) -> Result<()> {
        let entry = self.bat.get(bat_index).ok_or(FormatError::BatOutOfBounds {
            index: bat_index,
            reason: "index past end of bat",
        })?;
        let record = LogRecord {
            file_offset: self.bat.entry_file_offset(bat_index),
            data: entry.raw().to_le_bytes().to_vec(),
        };
        self.log.append(backend, record)?;
        self.log.flush(backend)
    }

    /// Restore a BAT entry after its payload write failed.
    ///
    /// The in-memory entry is always restored. Persisting the restored entry is best effort:
    /// the caller is already propagating the payload error.
    pub fn rollback<B: StorageBackend>(&mut self, backend: &mut B, undo: BatUndo) {
        if !self.restore_entry(undo) {
            return;
        }
        if let Err(err) = self.log_bat_entry(backend, undo.bat_index) {
            warn!(
                bat_index = undo.bat_index,
                %err,
                "failed to persist restored vhdx bat entry"
            );
        }
    }

    /// Restore the in-memory entry only. Returns `false` if the index is no longer valid.
    pub fn restore_entry(&mut self, undo: BatUndo) -> bool {
        match self.bat.set(undo.bat_index, undo.prior) {
            Ok(()) => true,
            Err(err) => {
                warn!(bat_index = undo.bat_index, %err, "failed to restore vhdx bat entry");
                false
            }
        }
    }

    pub fn write<B: StorageBackend>(&mut self, backend: &mut B, offset: u64, buf: &[u8]) -> Result<()> {
        self.check_writable()?;
        self.check_range(offset, buf.len())?;
        if buf.is_empty() {
            return Ok(());
        }
        self.user_visible_write(backend)?;

        let mut done = 0usize;
        while done < buf.len() {
            let plan = self.prepare_write(backend, offset + done as u64, (buf.len() - done) as u64)?;
            let chunk = &buf[done..done + plan.len];
            if let Err(err) = backend.write_at(plan.file_offset, chunk) {
                if let Some(undo) = plan.undo {
                    self.rollback(backend, undo);
                }
                return Err(err);
            }
            done += plan.len;
        }
        Ok(())
    }

    pub fn check<B: StorageBackend>(&self, backend: &mut B, mode: CheckMode) -> Result<CheckReport> {
        let file_len = backend.len()?;
        let scan = scan_bat(&self.geometry, &self.bat, &self.registered, file_len, mode);
        Ok(CheckReport {
            corruptions_found: scan.corruptions,
            corruptions_fixed: u64::from(self.log_replayed),
        })
    }

    pub fn flush<B: StorageBackend>(&mut self, backend: &mut B) -> Result<()> {
        self.log.flush(backend)?;
        backend.flush()
    }
}

/// File offset of `seg` inside its `FULLY_PRESENT` block.
fn present_offset(seg: &Segment) -> Result<u64> {
    let base = seg.info.entry.file_offset();
    if base < HEADER_SECTION_END {
        return Err(FormatError::Corrupt("fully present block inside the header section").into());
    }
    base.checked_add(seg.in_block).ok_or_else(|| {
        FormatError::BatOffsetOverflow {
            index: seg.info.bat_index,
        }
        .into()
    })
}

fn register_log(registered: &mut RegionSet, header: &VhdxHeader) -> Result<()> {
    if header.log_length == 0 {
        return Ok(());
    }
    registered.register(header.log_offset, u64::from(header.log_length))?;
    Ok(())
}

/// Grow the file by one block at the next 1 MiB boundary past the current end.
///
/// Returns the block offset and whether its contents still need explicit zeroing.
fn allocate_block<B: StorageBackend>(backend: &mut B, block_size: u64) -> Result<(u64, bool)> {
    let file_len = backend.len()?;
    let block_start = align_up_u64(file_len, MIB)?;
    let end = block_start
        .checked_add(block_size)
        .ok_or(DiskError::OffsetOverflow)?;
    backend.set_len(end)?;
    Ok((block_start, !backend.grows_zeroed()))
}

pub(crate) fn execute_read<B: StorageBackend + ?Sized>(
    backend: &mut B,
    chunks: &[ReadChunk],
    buf: &mut [u8],
) -> Result<()> {
    for chunk in chunks {
        let dst = &mut buf[chunk.buf_offset..chunk.buf_offset + chunk.len];
        match chunk.source {
            ReadSource::Zero => dst.fill(0),
            ReadSource::File(offset) => match backend.read_at(offset, dst) {
                Ok(()) => {}
                Err(DiskError::OutOfBounds { .. }) => {
                    return Err(FormatError::Corrupt("payload block past end of file").into())
                }
                Err(e) => return Err(e),
            },
        }
    }
    Ok(())
}

fn write_zeroes<B: StorageBackend + ?Sized>(backend: &mut B, start: u64, len: u64) -> Result<()> {
    if len == 0 {
        return Ok(());
    }
    let zeros = vec![0u8; len.min(MIB) as usize];
    let mut pos = 0u64;
    while pos < len {
        let n = (len - pos).min(zeros.len() as u64);
        backend.write_at(start + pos, &zeros[..n as usize])?;
        pos += n;
    }
    Ok(())
}
