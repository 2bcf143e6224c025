//! CRC-32 trailer computation for contextual packets (spec §4.2).
//!
//! The seed plays the role of the "previous crc" argument to zlib's `crc32()`:
//! `crc32fast::Hasher::new_with_initial` applies the same pre/post complement
//! convention, so seeding with `crc_seed` and finalizing reproduces the
//! reference algorithm exactly.

pub type CrcSeed = u32;
pub type CrcSize = u8;

pub const MAX_CRC_LENGTH: CrcSize = 4;

/// Computes the CRC-32 over `data` seeded with `seed`, then keeps only the low
/// `size` bytes (big-endian) that actually go on the wire. `size` of 0 means no
/// trailer at all, so the result is meaningless and never written.
pub fn compute_crc(data: &[u8], seed: CrcSeed, size: CrcSize) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(seed);
    hasher.update(data);
    let crc = hasher.finalize();
    if size >= 4 {
        crc
    } else {
        crc & ((1u32 << (size as u32 * 8)).wrapping_sub(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncation_keeps_low_bytes_only() {
        let data = b"hello soe protocol";
        let full = compute_crc(data, 5, 4);
        let truncated = compute_crc(data, 5, 2);
        assert_eq!(truncated, full & 0xFFFF);
    }

    #[test]
    fn zero_size_is_well_defined() {
        let data = b"hello soe protocol";
        assert_eq!(compute_crc(data, 5, 0), 0);
    }

    #[test]
    fn same_input_same_seed_is_deterministic() {
        let data = b"hello soe protocol";
        assert_eq!(compute_crc(data, 5, 4), compute_crc(data, 5, 4));
    }

    #[test]
    fn flipping_a_bit_changes_the_crc() {
        let mut data = b"hello soe protocol".to_vec();
        let a = compute_crc(&data, 5, 4);
        data[0] ^= 0x01;
        let b = compute_crc(&data, 5, 4);
        assert_ne!(a, b);
    }
}
