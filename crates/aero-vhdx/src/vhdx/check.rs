use serde::Serialize;
use tracing::warn;

use super::bat::{Bat, PayloadState};
use super::geometry::Geometry;
use super::region::RegionSet;
use crate::util::MIB;
use crate::FormatError;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum CheckMode {
    /// Count every corruption.
    #[default]
    All,
    StopAtFirst,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub corruptions_found: u64,
    pub corruptions_fixed: u64,
}

#[derive(Debug, Default)]
pub(crate) struct BatScan {
    pub corruptions: u64,
    pub first: Option<FormatError>,
}

/// Validate every `FULLY_PRESENT` entry against the file length and the registered regions.
pub(crate) fn scan_bat(
    geometry: &Geometry,
    bat: &Bat,
    regions: &RegionSet,
    file_len: u64,
    mode: CheckMode,
) -> BatScan {
    let mut scan = BatScan::default();
    for (index, entry) in bat.iter() {
        if entry.state() != Some(PayloadState::FullyPresent) {
            continue;
        }
        let offset = entry.file_offset();
        let block_length = match geometry.payload_block_of(index) {
            Some(block) => geometry.payload_block_len(block),
            None => MIB,
        };

        let Some(err) = check_entry(index, offset, block_length, regions, file_len) else {
            continue;
        };
        warn!(index, offset, %err, "vhdx bat corruption");
        scan.corruptions += 1;
        scan.first.get_or_insert(err);
        if mode == CheckMode::StopAtFirst {
            break;
        }
    }
    scan
}

fn check_entry(
    index: u64,
    offset: u64,
    block_length: u64,
    regions: &RegionSet,
    file_len: u64,
) -> Option<FormatError> {
    if offset > i64::MAX as u64 - block_length {
        return Some(FormatError::BatOffsetOverflow { index });
    }
    if offset >= file_len {
        return Some(FormatError::BatOutOfBounds {
            index,
            reason: "starts past end of file",
        });
    }
    if offset + block_length > file_len {
        return Some(FormatError::BatOutOfBounds {
            index,
            reason: "ends past end of file",
        });
    }
    if regions.overlaps(offset, block_length) {
        return Some(FormatError::OverlappingRegions {
            start: offset,
            len: block_length,
        });
    }
    None
}
