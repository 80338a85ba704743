use std::collections::BTreeSet;

use crate::util::{ranges_overlap, MIB};
use crate::vhdx::bat::{translate, Bat, BatEntry, PayloadState};
use crate::vhdx::checksum;
use crate::vhdx::header::{select_current, HeaderSlot, VhdxHeader};
use crate::vhdx::region::RegionSet;
use crate::{
    CheckMode, Geometry, MemBackend, VhdxCreateOptions, VhdxDisk, VhdxSubformat, VirtualDisk,
    SECTOR_SIZE,
};
use proptest::prelude::*;
use proptest::test_runner::TestCaseResult;
use uuid::Uuid;

const MAX_STEPS: usize = 24;
const MAX_SPAN: usize = 8 * 1024;

/// One guest action, addressed by payload block so runs cluster around block edges.
#[derive(Debug, Clone)]
enum Step {
    /// Write `data` at byte `pos` of payload block `block`; may run into the next block.
    Store { block: u64, pos: u64, data: Vec<u8> },
    Load { block: u64, pos: u64, len: usize },
    Sync,
    /// Close the image and open it again from the same bytes.
    Cycle,
}

#[derive(Debug, Clone)]
struct Scenario {
    size: u64,
    subformat: VhdxSubformat,
    prefer_zero: bool,
    steps: Vec<Step>,
}

fn position_in_block() -> impl Strategy<Value = u64> {
    prop_oneof![
        3 => 0..MIB,
        2 => 0u64..=1024,
        2 => (MIB - 1024)..MIB,
    ]
}

fn step(blocks: u64) -> impl Strategy<Value = Step> {
    let store = (
        0..blocks,
        position_in_block(),
        prop::collection::vec(any::<u8>(), 0..=MAX_SPAN),
    )
        .prop_map(|(block, pos, data)| Step::Store { block, pos, data });
    let load = (0..blocks, position_in_block(), 0..=MAX_SPAN)
        .prop_map(|(block, pos, len)| Step::Load { block, pos, len });
    prop_oneof![
        5 => store,
        4 => load,
        1 => Just(Step::Sync),
        1 => Just(Step::Cycle),
    ]
}

/// Up to three whole 1 MiB blocks plus a tail of 1..=2048 sectors, so short last blocks are common.
fn scenario() -> impl Strategy<Value = Scenario> {
    (0u64..=3, 1u64..=2048, any::<bool>(), any::<bool>()).prop_flat_map(
        |(full, tail, fixed, prefer_zero)| {
            let size = full * MIB + tail * SECTOR_SIZE as u64;
            let subformat = if fixed {
                VhdxSubformat::Fixed
            } else {
                VhdxSubformat::Dynamic
            };
            prop::collection::vec(step(size.div_ceil(MIB)), 1..=MAX_STEPS).prop_map(move |steps| {
                Scenario {
                    size,
                    subformat,
                    prefer_zero,
                    steps,
                }
            })
        },
    )
}

/// Guest byte range for a block-relative request, cut off at the end of the disk.
fn guest_range(size: u64, block: u64, pos: u64, len: usize) -> (u64, usize) {
    let at = (block * MIB + pos).min(size);
    (at, len.min((size - at) as usize))
}

fn expected_allocated(scenario: &Scenario, written: &BTreeSet<u64>) -> u64 {
    if scenario.subformat == VhdxSubformat::Fixed && !scenario.prefer_zero {
        scenario.size.div_ceil(MIB)
    } else {
        written.len() as u64
    }
}

fn play(scenario: &Scenario) -> TestCaseResult {
    let options = VhdxCreateOptions {
        block_size_bytes: MIB as u32,
        subformat: scenario.subformat,
        prefer_zero_block_state: scenario.prefer_zero,
        ..VhdxCreateOptions::new(scenario.size)
    };
    let mut disk = VhdxDisk::create(MemBackend::new(), options).unwrap();
    prop_assert_eq!(disk.capacity_bytes(), scenario.size);

    let mut reference = vec![0u8; scenario.size as usize];
    let mut written = BTreeSet::new();
    for step in &scenario.steps {
        match step {
            Step::Store { block, pos, data } => {
                let (at, len) = guest_range(scenario.size, *block, *pos, data.len());
                disk.write_at(at, &data[..len]).unwrap();
                reference[at as usize..at as usize + len].copy_from_slice(&data[..len]);
                if len > 0 {
                    written.extend(at / MIB..=(at + len as u64 - 1) / MIB);
                }
            }
            Step::Load { block, pos, len } => {
                let (at, len) = guest_range(scenario.size, *block, *pos, *len);
                let mut buf = vec![0xA5u8; len];
                disk.read_at(at, &mut buf).unwrap();
                prop_assert_eq!(buf.as_slice(), &reference[at as usize..at as usize + len]);
            }
            Step::Sync => disk.flush().unwrap(),
            Step::Cycle => disk = VhdxDisk::open(disk.close().unwrap()).unwrap(),
        }
        prop_assert_eq!(
            disk.info().allocated_blocks,
            expected_allocated(scenario, &written)
        );
    }

    let mut disk = VhdxDisk::open(disk.close().unwrap()).unwrap();
    let mut image = vec![0xA5u8; scenario.size as usize];
    disk.read_at(0, &mut image).unwrap();
    prop_assert!(image == reference, "reopened image diverged from reference");
    prop_assert_eq!(disk.check(CheckMode::All).unwrap().corruptions_found, 0);
    Ok(())
}

fn header(seq: u64, data_guid: u128) -> VhdxHeader {
    VhdxHeader {
        sequence_number: seq,
        file_write_guid: Uuid::from_u128(1),
        data_write_guid: Uuid::from_u128(data_guid),
        log_guid: Uuid::nil(),
        log_version: 0,
        version: 1,
        log_length: MIB as u32,
        log_offset: MIB,
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 32,
        .. ProptestConfig::default()
    })]

    #[test]
    fn prop_block_addressed_io_matches_reference(scenario in scenario()) {
        play(&scenario)?;
    }

    #[test]
    fn prop_checksum_detects_any_flipped_byte(
        mut buf in prop::collection::vec(any::<u8>(), 8..512),
        idx in any::<prop::sample::Index>(),
        bit in 0u8..8,
    ) {
        checksum::update(&mut buf, 4);
        prop_assert!(checksum::verify(&buf, 4));

        let mut pos = idx.index(buf.len() - 4);
        if pos >= 4 {
            pos += 4;
        }
        buf[pos] ^= 1 << bit;
        prop_assert!(!checksum::verify(&buf, 4));
    }

    #[test]
    fn prop_region_overlap_iff_intervals_intersect(
        a in 0u64..1000, alen in 1u64..100,
        c in 0u64..1000, clen in 1u64..100,
    ) {
        let (b, d) = (a + alen, c + clen);
        let mut set = RegionSet::new();
        set.register(a, alen).unwrap();
        let expected = a < d && c < b;
        prop_assert_eq!(ranges_overlap(a, b, c, d), expected);
        prop_assert_eq!(set.register(c, clen).is_err(), expected);
    }

    #[test]
    fn prop_geometry_requires_power_of_two_block_size(block_mib in 1u32..=256) {
        let block_size = block_mib * MIB as u32;
        let result = Geometry::new(64 * MIB, block_size, 512, 512);
        prop_assert_eq!(result.is_ok(), block_mib.is_power_of_two());
    }

    #[test]
    fn prop_translation_recovers_sector(
        block_shift in 0u32..=3,
        blocks in 1u64..300,
        sector_seed in any::<u64>(),
    ) {
        // Up to 2400 blocks of up to 8 MiB (chunk ratio 512), enough to cross bitmap slots.
        let block_size = (MIB as u32) << block_shift;
        let g = Geometry::new(blocks * u64::from(block_size) * 8, block_size, 512, 512).unwrap();
        let entries: Vec<BatEntry> = (0..g.bat_entries)
            .map(|i| BatEntry::new(PayloadState::FullyPresent, (i + 16) * u64::from(block_size)))
            .collect();
        let bat = Bat::from_entries(MIB, entries);

        let sector = sector_seed % g.total_sectors();
        let info = translate(&g, &bat, sector, 1).unwrap();
        let block_start = info.file_offset - (info.block_offset << g.logical_sector_bits);
        prop_assert_eq!(block_start, bat.get(info.bat_index).unwrap().file_offset());

        let block = g.payload_block_of(info.bat_index).unwrap();
        prop_assert_eq!((block << g.sectors_per_block_bits) + info.block_offset, sector);
    }

    #[test]
    fn prop_header_selection_ignores_corrupted_loser(
        seq_a in 0u64..1000,
        seq_b in 0u64..1000,
        flip in 0usize..4096,
        corrupt_first in any::<bool>(),
    ) {
        let slots = || [
            HeaderSlot::from_raw(header(seq_a, 10).encode()),
            HeaderSlot::from_raw(header(seq_b, 11).encode()),
        ];
        let clean = select_current(&slots());

        let mut raw = [header(seq_a, 10).encode(), header(seq_b, 11).encode()];
        let victim = usize::from(!corrupt_first);
        raw[victim][flip] ^= 0x01;
        let [first, second] = raw;
        let corrupted = select_current(&[HeaderSlot::from_raw(first), HeaderSlot::from_raw(second)]);

        // Only the surviving header can be selected.
        prop_assert_eq!(corrupted.clone(), Ok(1 - victim));
        if clean == Ok(1 - victim) {
            prop_assert_eq!(corrupted, clean);
        }
    }
}
