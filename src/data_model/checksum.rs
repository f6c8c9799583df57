//! Checksum algorithms named by [`super::ChecksumAlgorithm`].

use super::ChecksumAlgorithm;

/// Computes the checksum of `data` under `algorithm`. The result is
/// returned as a `u64`; callers mask it down to the checksum field's own
/// bit width when writing it back (e.g. `sum16` naturally fits 16 bits, but
/// `sum`/`crc32` may need masking if the declared field is narrower).
pub fn compute(algorithm: ChecksumAlgorithm, data: &[u8]) -> u64 {
    match algorithm {
        ChecksumAlgorithm::Crc32 => crc32fast::hash(data) as u64,
        ChecksumAlgorithm::Adler32 => adler32(data) as u64,
        ChecksumAlgorithm::Sum => data.iter().map(|b| *b as u64).sum(),
        ChecksumAlgorithm::Xor => data.iter().fold(0u8, |acc, b| acc ^ b) as u64,
        ChecksumAlgorithm::Sum8 => (data.iter().map(|b| *b as u64).sum::<u64>() % 0x100),
        ChecksumAlgorithm::Sum16 => (data.iter().map(|b| *b as u64).sum::<u64>() % 0x1_0000),
    }
}

/// Textbook Adler-32 (RFC 1950 §9), implemented directly rather than via an
/// extra dependency since it's a handful of lines.
fn adler32(data: &[u8]) -> u32 {
    const MOD_ADLER: u32 = 65521;
    let mut a: u32 = 1;
    let mut b: u32 = 0;
    for &byte in data {
        a = (a + byte as u32) % MOD_ADLER;
        b = (b + a) % MOD_ADLER;
    }
    (b << 16) | a
}
