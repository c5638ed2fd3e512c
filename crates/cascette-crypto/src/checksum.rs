//! Location-bound checksum for reconstruction headers
//!
//! The second checksum of a reconstruction header folds the first 0x1a
//! header bytes together with the archive index and the offset the header
//! is stored at. A header copied to another location no longer validates.

/// Seed passed to `hashlittle()` when computing checksum A of a
/// reconstruction header.
pub const RECONSTRUCTION_SEED: u32 = 0x3D6B_E971;

/// Number of header bytes covered by [`calculate_checksum`].
pub const CHECKSUMMED_PREFIX: usize = 0x1a;

const OFFSET_ENCODE_TABLE: [u32; 16] = [
    0x0493_96b8,
    0x72a8_2a9b,
    0xee62_6cca,
    0x9917_754f,
    0x15de_40b1,
    0xf5a8_a9b6,
    0x421e_ac7e,
    0xa9d5_5c9a,
    0x317f_d40c,
    0x04fa_f80d,
    0x3d6b_e971,
    0x5293_3cfd,
    0x27f6_4b7d,
    0xc6f5_c11b,
    0xd575_7e3a,
    0x6c38_8745,
];

/// Compute checksum B of a reconstruction header.
///
/// Only the low two bits of `archive_index` and the low 30 bits of `offset`
/// take part, mirroring how the pair is packed in `.idx` entries.
pub fn calculate_checksum(
    header: &[u8; CHECKSUMMED_PREFIX],
    archive_index: u16,
    offset: u32,
) -> [u8; 4] {
    let packed = (offset & 0x3FFF_FFFF) | (u32::from(archive_index & 3) << 30);
    let shifted = packed.wrapping_add(0x1e);
    let encoded_offset = OFFSET_ENCODE_TABLE[(shifted & 0xF) as usize] ^ shifted;

    let mut hashed = 0u32;
    for (i, &byte) in header.iter().enumerate() {
        let lane = (i as u32).wrapping_add(packed) & 3;
        hashed ^= u32::from(byte) << (lane * 8);
    }

    let mut out = [0u8; 4];
    for (j, slot) in out.iter_mut().enumerate() {
        let shift = ((j as u32).wrapping_add(0x1a).wrapping_add(packed) & 3) * 8;
        *slot = ((hashed >> shift) as u8) ^ ((encoded_offset >> shift) as u8);
    }
    out
}
