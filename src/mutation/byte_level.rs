//! Byte-level mutators: operate on raw bytes with no knowledge of a data
//! model. Used directly in `byte_level` mode and as the fallback whenever
//! structure-aware mutation can't apply.

use rand::Rng;

const INTERESTING_VALUES: &[u64] = &[
    0,
    1,
    0x7F,
    0x80,
    0xFF,
    0x7FFF,
    0x8000,
    0xFFFF,
    0x7FFF_FFFF,
    0x8000_0000,
    0xFFFF_FFFF,
];

const ARITHMETIC_DELTAS: &[i64] = &[1, 2, 4, 8, 16, 32, 64, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ByteMutator {
    BitFlip,
    ByteFlip,
    Arithmetic,
    InterestingValues,
    Havoc,
    Splice,
}

/// Default weights named in the spec (sum to 100); used for weighted
/// selection in `byte_level` and `hybrid` modes.
const WEIGHTS: &[(ByteMutator, u32)] = &[
    (ByteMutator::BitFlip, 10),
    (ByteMutator::ByteFlip, 10),
    (ByteMutator::Arithmetic, 15),
    (ByteMutator::InterestingValues, 15),
    (ByteMutator::Havoc, 30),
    (ByteMutator::Splice, 20),
];

pub fn choose(rng: &mut impl Rng) -> ByteMutator {
    let total: u32 = WEIGHTS.iter().map(|(_, w)| w).sum();
    let mut pick = rng.gen_range(0..total);
    for (mutator, weight) in WEIGHTS {
        if pick < *weight {
            return *mutator;
        }
        pick -= weight;
    }
    WEIGHTS.last().unwrap().0
}

pub struct HavocLimits {
    pub max_size: usize,
}

/// Applies `mutator` to `data`, consulting `splice_partner` only for
/// `Splice` (a no-op when `None`, per the single-seed-available case).
pub fn apply(
    rng: &mut impl Rng,
    mutator: ByteMutator,
    data: &[u8],
    splice_partner: Option<&[u8]>,
    limits: &HavocLimits,
) -> Vec<u8> {
    match mutator {
        ByteMutator::BitFlip => bit_flip(rng, data, 0.01),
        ByteMutator::ByteFlip => byte_flip(rng, data, 0.05),
        ByteMutator::Arithmetic => arithmetic(rng, data),
        ByteMutator::InterestingValues => interesting_values(rng, data),
        ByteMutator::Havoc => havoc(rng, data, limits.max_size),
        ByteMutator::Splice => splice(rng, data, splice_partner),
    }
}

fn bit_flip(rng: &mut impl Rng, data: &[u8], ratio: f64) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = data.to_vec();
    let total_bits = out.len() * 8;
    let n = ((ratio * total_bits as f64).ceil() as usize).max(1);
    for _ in 0..n {
        let bit = rng.gen_range(0..total_bits);
        out[bit / 8] ^= 1 << (bit % 8);
    }
    out
}

fn byte_flip(rng: &mut impl Rng, data: &[u8], ratio: f64) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = data.to_vec();
    let n = ((ratio * out.len() as f64).ceil() as usize).max(1);
    for _ in 0..n {
        let idx = rng.gen_range(0..out.len());
        out[idx] = rng.gen();
    }
    out
}

fn arithmetic(rng: &mut impl Rng, data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = data.to_vec();
    let aligned_starts: Vec<usize> = (0..out.len()).step_by(4).collect();
    let start = aligned_starts[rng.gen_range(0..aligned_starts.len())];
    let width = (out.len() - start).min(4);
    let delta = ARITHMETIC_DELTAS[rng.gen_range(0..ARITHMETIC_DELTAS.len())];
    let delta = if rng.gen_bool(0.5) { delta } else { -delta };

    let mut value: u64 = 0;
    for i in (0..width).rev() {
        value = (value << 8) | out[start + i] as u64;
    }
    let mask = (1u64 << (width * 8)) - 1;
    let new_value = (((value as i128) + (delta as i128)) as u64) & mask;
    for (i, byte) in out[start..start + width].iter_mut().enumerate() {
        *byte = ((new_value >> (i * 8)) & 0xFF) as u8;
    }
    out
}

fn interesting_values(rng: &mut impl Rng, data: &[u8]) -> Vec<u8> {
    if data.is_empty() {
        return Vec::new();
    }
    let mut out = data.to_vec();
    let value = INTERESTING_VALUES[rng.gen_range(0..INTERESTING_VALUES.len())];
    let natural_width = if value <= 0xFF {
        1
    } else if value <= 0xFFFF {
        2
    } else {
        4
    };
    let width = natural_width.min(out.len());
    if width == 0 {
        return out;
    }
    let max_start = out.len() - width;
    let start = if max_start == 0 { 0 } else { rng.gen_range(0..=max_start) };
    for (i, byte) in out[start..start + width].iter_mut().enumerate() {
        *byte = ((value >> (i * 8)) & 0xFF) as u8;
    }
    out
}

fn havoc(rng: &mut impl Rng, data: &[u8], max_size: usize) -> Vec<u8> {
    let mut out = data.to_vec();
    let ops = rng.gen_range(2..=10);
    for _ in 0..ops {
        if out.is_empty() {
            out.push(rng.gen());
            continue;
        }
        let chunk_len = rng.gen_range(1..=16usize.min(out.len().max(1)));
        match rng.gen_range(0..4) {
            0 => {
                // insert
                let pos = rng.gen_range(0..=out.len());
                let bytes: Vec<u8> = (0..chunk_len).map(|_| rng.gen()).collect();
                out.splice(pos..pos, bytes);
            }
            1 => {
                // delete
                if out.len() > 1 {
                    let len = chunk_len.min(out.len() - 1).max(1);
                    let pos = rng.gen_range(0..=out.len() - len);
                    out.drain(pos..pos + len);
                }
            }
            2 => {
                // duplicate
                let len = chunk_len.min(out.len());
                let pos = rng.gen_range(0..=out.len() - len);
                let chunk = out[pos..pos + len].to_vec();
                let insert_at = rng.gen_range(0..=out.len());
                out.splice(insert_at..insert_at, chunk);
            }
            _ => {
                // shuffle
                let len = chunk_len.min(out.len());
                let pos = rng.gen_range(0..=out.len() - len);
                let slice = &mut out[pos..pos + len];
                for i in (1..slice.len()).rev() {
                    let j = rng.gen_range(0..=i);
                    slice.swap(i, j);
                }
            }
        }
        if out.len() > max_size {
            out.truncate(max_size);
        }
    }
    out
}

fn splice(rng: &mut impl Rng, data: &[u8], partner: Option<&[u8]>) -> Vec<u8> {
    let Some(other) = partner else {
        return data.to_vec();
    };
    if data.is_empty() || other.is_empty() {
        return data.to_vec();
    }
    let cut_a = rng.gen_range(0..data.len());
    let cut_b = rng.gen_range(0..other.len());
    let mut out = data[..cut_a].to_vec();
    out.extend_from_slice(&other[cut_b..]);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;

    fn rng() -> rand::rngs::StdRng {
        rand::rngs::StdRng::seed_from_u64(42)
    }

    #[test]
    fn empty_input_passes_through() {
        let mut r = rng();
        let limits = HavocLimits { max_size: 4096 };
        for m in [
            ByteMutator::BitFlip,
            ByteMutator::ByteFlip,
            ByteMutator::Arithmetic,
            ByteMutator::InterestingValues,
            ByteMutator::Splice,
        ] {
            assert_eq!(apply(&mut r, m, &[], None, &limits), Vec::<u8>::new());
        }
    }

    #[test]
    fn bit_flip_changes_exactly_n_bits_worth() {
        let mut r = rng();
        let data = vec![0u8; 100];
        let out = bit_flip(&mut r, &data, 0.01);
        assert_eq!(out.len(), data.len());
        assert_ne!(out, data);
    }

    #[test]
    fn havoc_respects_max_size() {
        let mut r = rng();
        let data = vec![0xAAu8; 10];
        let out = havoc(&mut r, &data, 32);
        assert!(out.len() <= 32);
    }

    #[test]
    fn splice_with_no_partner_is_noop() {
        let mut r = rng();
        let data = b"hello".to_vec();
        assert_eq!(splice(&mut r, &data, None), data);
    }

    #[test]
    fn splice_combines_prefix_and_suffix() {
        let mut r = rng();
        let a = vec![1u8, 2, 3, 4, 5];
        let b = vec![9u8, 8, 7, 6];
        let out = splice(&mut r, &a, Some(&b));
        assert!(!out.is_empty());
    }

    #[test]
    fn weighted_choice_covers_full_range() {
        let total: u32 = WEIGHTS.iter().map(|(_, w)| w).sum();
        assert_eq!(total, 100);
    }
}
