//! Parses the seed against a data model, mutates one mutable field, then
//! re-serializes (letting the parser's own auto-fix pass repair sizes and
//! checksums).

use rand::Rng;

use crate::data_model::parser::{self, SerializeContext};
use crate::data_model::{Block, DataModel, FieldType, FieldValue};
use crate::error::{Error, ProtocolError, Result};

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

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Strategy {
    BitFlipField,
    BoundaryValues,
    InterestingValues,
    Arithmetic,
    RandomValue,
    LengthOverflow,
    LengthUnderflow,
}

const INTEGER_STRATEGIES: &[Strategy] = &[
    Strategy::BitFlipField,
    Strategy::BoundaryValues,
    Strategy::InterestingValues,
    Strategy::Arithmetic,
    Strategy::RandomValue,
];

const BYTES_STRATEGIES: &[Strategy] =
    &[Strategy::RandomValue, Strategy::LengthOverflow, Strategy::LengthUnderflow];

/// Attempts a structure-aware mutation of `seed`. Returns `Err` when the
/// seed doesn't parse against `model`, or when `model` has no mutable
/// field at all — callers fall back to byte-level mutation on either.
pub fn mutate(rng: &mut impl Rng, model: &DataModel, seed: &[u8], ctx: &SerializeContext, max_resize: usize) -> Result<Vec<u8>> {
    let mut fields = parser::parse(model, seed)?;

    let mutable: Vec<&Block> = model.mutable_blocks().collect();
    if mutable.is_empty() {
        return Err(Error::Protocol(ProtocolError::parse(
            "data model has no mutable fields to structurally mutate",
        )));
    }
    let block = mutable[rng.gen_range(0..mutable.len())];

    let strategies: &[Strategy] = if block.field_type == FieldType::Bytes || block.field_type == FieldType::String {
        BYTES_STRATEGIES
    } else {
        INTEGER_STRATEGIES
    };
    let strategy = strategies[rng.gen_range(0..strategies.len())];

    let current = fields.get(&block.name).cloned().unwrap_or_else(|| default_value(block));
    let mutated = apply_strategy(rng, block, &current, strategy, max_resize);
    fields.insert(block.name.clone(), mutated);

    let (bytes, _) = parser::serialize(model, &fields, ctx)?;
    Ok(bytes)
}

fn default_value(block: &Block) -> FieldValue {
    match block.field_type {
        FieldType::Bytes => FieldValue::Bytes(Vec::new()),
        FieldType::String => FieldValue::Str(String::new()),
        _ if block.field_type.is_signed() => FieldValue::Int(0),
        _ => FieldValue::UInt(0),
    }
}

fn apply_strategy(rng: &mut impl Rng, block: &Block, current: &FieldValue, strategy: Strategy, max_resize: usize) -> FieldValue {
    let width = block.bit_width();
    let mask = if width >= 64 { u64::MAX } else { (1u64 << width) - 1 };

    match strategy {
        Strategy::BitFlipField => {
            let raw = current.as_u64().unwrap_or(0);
            let bit = rng.gen_range(0..width);
            to_typed(block, (raw ^ (1 << bit)) & mask)
        }
        Strategy::BoundaryValues | Strategy::InterestingValues => {
            let candidates: Vec<u64> = INTERESTING_VALUES.iter().copied().filter(|v| *v <= mask).collect();
            let value = if candidates.is_empty() { 0 } else { candidates[rng.gen_range(0..candidates.len())] };
            to_typed(block, value & mask)
        }
        Strategy::Arithmetic => {
            let raw = current.as_u64().unwrap_or(0) as i128;
            let delta = rng.gen_range(-128i128..=128);
            let new_value = ((raw + delta) & mask as i128) as u64;
            to_typed(block, new_value)
        }
        Strategy::RandomValue => match block.field_type {
            FieldType::Bytes | FieldType::String => {
                let len = current.byte_len().max(1);
                let bytes: Vec<u8> = (0..len).map(|_| rng.gen()).collect();
                if block.field_type == FieldType::String {
                    FieldValue::Str(String::from_utf8_lossy(&bytes).into_owned())
                } else {
                    FieldValue::Bytes(bytes)
                }
            }
            _ => to_typed(block, rng.gen::<u64>() & mask),
        },
        Strategy::LengthOverflow => {
            let base_len = current.byte_len();
            let grown = (base_len.max(1) * 2).min(block.max_size.unwrap_or(max_resize)).min(max_resize);
            let bytes: Vec<u8> = (0..grown).map(|_| rng.gen()).collect();
            if block.field_type == FieldType::String {
                FieldValue::Str(String::from_utf8_lossy(&bytes).into_owned())
            } else {
                FieldValue::Bytes(bytes)
            }
        }
        Strategy::LengthUnderflow => {
            let base_len = current.byte_len();
            let shrunk = base_len / 2;
            match current {
                FieldValue::Bytes(b) => FieldValue::Bytes(b[..shrunk].to_vec()),
                FieldValue::Str(s) => FieldValue::Str(s[..shrunk.min(s.len())].to_string()),
                other => other.clone(),
            }
        }
    }
}

fn to_typed(block: &Block, raw: u64) -> FieldValue {
    if block.field_type.is_signed() {
        let width = block.bit_width();
        let shift = 64 - width.min(64);
        FieldValue::Int(((raw << shift) as i64) >> shift)
    } else {
        FieldValue::UInt(raw)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ProtocolContext;
    use crate::data_model::{Block, DataModel, FieldType, FieldValue, SizeUnit};
    use rand::SeedableRng;

    fn model() -> DataModel {
        DataModel::new(vec![
            Block::new("length", FieldType::UInt16).as_size_field(vec!["payload".to_string()], SizeUnit::Bytes),
            Block::new("payload", FieldType::Bytes).with_max_size(256),
        ])
        .unwrap()
    }

    #[test]
    fn mutated_message_still_parses() {
        let model = model();
        let ctx = ProtocolContext::new();
        let sctx = SerializeContext::new(&ctx, 0);
        let mut overrides = crate::data_model::FieldMap::new();
        overrides.insert("payload".to_string(), FieldValue::Bytes(b"0123456789".to_vec()));
        let (seed, _) = parser::serialize(&model, &overrides, &sctx).unwrap();

        let mut rng = rand::rngs::StdRng::seed_from_u64(7);
        let out = mutate(&mut rng, &model, &seed, &sctx, 4096).unwrap();
        assert!(parser::parse(&model, &out).is_ok());
    }

    #[test]
    fn falls_back_on_no_mutable_fields() {
        let blocks = vec![Block::new("fixed", FieldType::UInt8).non_mutable().with_default(FieldValue::UInt(1))];
        let model = DataModel::new(blocks).unwrap();
        let ctx = ProtocolContext::new();
        let sctx = SerializeContext::new(&ctx, 0);
        let mut rng = rand::rngs::StdRng::seed_from_u64(1);
        assert!(mutate(&mut rng, &model, &[1], &sctx, 4096).is_err());
    }
}
