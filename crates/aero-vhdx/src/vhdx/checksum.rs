//! CRC-32C checksums over VHDX structures.
//!
//! Every checksummed structure stores its checksum as a little-endian `u32` inside the buffer
//! it covers; the field is treated as zero while computing.

use crate::util::{le_u32, put_le_u32};

const ZERO_FIELD: [u8; 4] = [0; 4];

/// Compute the checksum of `buf`, treating `buf[crc_offset..crc_offset + 4]` as zero.
///
/// `crc_offset + 4` must not exceed `buf.len()`.
pub fn compute(buf: &[u8], crc_offset: usize) -> u32 {
    let crc = crc32c::crc32c(&buf[..crc_offset]);
    let crc = crc32c::crc32c_append(crc, &ZERO_FIELD);
    crc32c::crc32c_append(crc, &buf[crc_offset + 4..])
}

/// Recompute the checksum and store it in place.
pub fn update(buf: &mut [u8], crc_offset: usize) -> u32 {
    let crc = compute(buf, crc_offset);
    put_le_u32(buf, crc_offset, crc);
    crc
}

pub fn verify(buf: &[u8], crc_offset: usize) -> bool {
    if crc_offset
        .checked_add(4)
        .is_none_or(|end| end > buf.len())
    {
        return false;
    }
    le_u32(buf, crc_offset) == compute(buf, crc_offset)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matches_plain_crc32c_when_field_is_zero() {
        let mut buf = vec![0xA5u8; 64];
        buf[4..8].fill(0);
        assert_eq!(compute(&buf, 4), crc32c::crc32c(&buf));
    }

    #[test]
    fn stored_checksum_does_not_affect_computation() {
        let mut buf = vec![7u8; 128];
        let first = compute(&buf, 4);
        put_le_u32(&mut buf, 4, 0xFFFF_FFFF);
        assert_eq!(compute(&buf, 4), first);
    }

    #[test]
    fn update_then_verify() {
        let mut buf: Vec<u8> = (0..4096u32).map(|i| (i * 31) as u8).collect();
        update(&mut buf, 4);
        assert!(verify(&buf, 4));

        buf[100] ^= 1;
        assert!(!verify(&buf, 4));
    }

    #[test]
    fn verify_rejects_short_buffers() {
        assert!(!verify(&[0u8; 6], 4));
    }
}
