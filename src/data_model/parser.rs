//! Bidirectional conversion between raw bytes and a [`FieldMap`], per a
//! [`DataModel`]. Tracks a bit offset (not a byte offset) throughout so
//! `Bits` fields can straddle byte boundaries; byte-aligned fields always
//! start and end on a byte boundary because every field ahead of them in
//! the model is itself either byte-aligned or a whole number of bits that
//! happens to land on one — if a plugin author produces a model where that
//! doesn't hold, the mismatch surfaces as a [`ProtocolError::Parse`] rather
//! than silently misreading.

use super::{
    checksum, transform, Block, BitOrder, ChecksumScope, DataModel, Endian, FieldMap, FieldType,
    FieldValue, GenerateSpec,
};
use crate::context::{ContextValue, ProtocolContext};
use crate::error::{Error, ProtocolError, Result};

/// Inputs a caller supplies alongside a [`DataModel`] to resolve and
/// serialize one message.
pub struct SerializeContext<'a> {
    pub context: &'a ProtocolContext,
    /// Monotonic counter consumed by `generate: sequence` fields.
    pub sequence: u64,
}

impl<'a> SerializeContext<'a> {
    pub fn new(context: &'a ProtocolContext, sequence: u64) -> Self {
        Self { context, sequence }
    }
}

// ---------------------------------------------------------------- parsing

pub fn parse(model: &DataModel, bytes: &[u8]) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    let mut bit_offset = 0usize;
    let total_bits = bytes.len() * 8;

    for block in &model.blocks {
        let value = match block.field_type {
            FieldType::Bits => {
                let n = block.size.ok_or_else(|| {
                    Error::Protocol(ProtocolError::parse(format!(
                        "field `{}` of type bits has no declared size",
                        block.name
                    )))
                })?;
                check_bounds(&block.name, bit_offset, n, total_bits)?;
                let v = read_bits(bytes, bit_offset, n, block.bit_order, block.endian);
                bit_offset += n;
                FieldValue::UInt(v)
            }
            t if t.is_integer() => {
                let byte_size = block.size.unwrap_or_else(|| t.default_byte_size().unwrap());
                let n = byte_size * 8;
                check_bounds(&block.name, bit_offset, n, total_bits)?;
                let raw = read_bits(bytes, bit_offset, n, BitOrder::Msb, block.endian);
                bit_offset += n;
                if t.is_signed() {
                    FieldValue::Int(sign_extend(raw, n as u32))
                } else {
                    FieldValue::UInt(raw)
                }
            }
            FieldType::Bytes | FieldType::String => {
                let byte_len = variable_field_byte_len(model, &fields, block, bit_offset, bytes.len())?;
                check_bounds(&block.name, bit_offset, byte_len * 8, total_bits)?;
                let start = bit_offset / 8;
                let data = bytes[start..start + byte_len].to_vec();
                bit_offset += byte_len * 8;
                if block.field_type == FieldType::String {
                    FieldValue::Str(String::from_utf8_lossy(&data).into_owned())
                } else {
                    FieldValue::Bytes(data)
                }
            }
        };
        fields.insert(block.name.clone(), value);
    }

    Ok(fields)
}

fn variable_field_byte_len(
    model: &DataModel,
    fields: &FieldMap,
    block: &Block,
    bit_offset: usize,
    total_bytes: usize,
) -> Result<usize> {
    if let Some(fixed) = block.size {
        return Ok(fixed);
    }

    if let Some(size_field) = model
        .blocks
        .iter()
        .find(|b| b.is_size_field && b.size_of.iter().any(|n| n == &block.name))
    {
        let size_val = fields.get(&size_field.name).and_then(|v| v.as_u64()).ok_or_else(|| {
            Error::Protocol(ProtocolError::parse(format!(
                "size field `{}` for `{}` was not parsed before its target",
                size_field.name, block.name
            )))
        })?;
        let total_target_bytes = size_field.size_unit.value_to_bytes(size_val) as usize;
        let other_fixed: usize = size_field
            .size_of
            .iter()
            .filter(|n| *n != &block.name)
            .filter_map(|n| model.field(n))
            .filter_map(|b| b.size)
            .sum();
        return Ok(total_target_bytes.saturating_sub(other_fixed));
    }

    // No linked size field: must be the last field, consuming the remainder.
    let remainder = total_bytes.saturating_sub(bit_offset / 8);
    if let Some(max) = block.max_size {
        if remainder > max {
            return Err(Error::Protocol(ProtocolError::parse(format!(
                "field `{}` remainder ({remainder} bytes) exceeds max_size ({max})",
                block.name
            ))));
        }
    }
    Ok(remainder)
}

fn check_bounds(field: &str, bit_offset: usize, bits: usize, total_bits: usize) -> Result<()> {
    if bit_offset + bits > total_bits {
        return Err(Error::Protocol(ProtocolError::parse(format!(
            "field `{field}` truncated: needs {bits} bits at offset {bit_offset}, only {} available",
            total_bits.saturating_sub(bit_offset)
        ))));
    }
    Ok(())
}

fn sign_extend(raw: u64, bits: u32) -> i64 {
    if bits >= 64 {
        return raw as i64;
    }
    let shift = 64 - bits;
    ((raw << shift) as i64) >> shift
}

// ------------------------------------------------------------ bit packing

/// Extracts `num_bits` starting at absolute `bit_offset` as a value
/// assembled most-significant-bit-first. Byte-aligned, MSB-ordered fields
/// (every integer field, and most `bits` fields) take a plain byte-copy
/// fast path; anything spanning a partial byte or declaring LSB bit order
/// falls through to bit-by-bit assembly.
fn read_bits(data: &[u8], bit_offset: usize, num_bits: usize, bit_order: BitOrder, endian: Endian) -> u64 {
    if bit_offset % 8 == 0 && num_bits % 8 == 0 && bit_order == BitOrder::Msb {
        let start = bit_offset / 8;
        let n = num_bits / 8;
        let mut acc = 0u64;
        if endian == Endian::Little {
            for i in (0..n).rev() {
                acc = (acc << 8) | data[start + i] as u64;
            }
        } else {
            for i in 0..n {
                acc = (acc << 8) | data[start + i] as u64;
            }
        }
        return acc;
    }

    let mut value: u64 = 0;
    for i in 0..num_bits {
        let abs_bit = bit_offset + i;
        let byte_idx = abs_bit / 8;
        let bit_in_byte = abs_bit % 8;
        let bit = match bit_order {
            BitOrder::Msb => (data[byte_idx] >> (7 - bit_in_byte)) & 1,
            BitOrder::Lsb => (data[byte_idx] >> bit_in_byte) & 1,
        } as u64;
        value = (value << 1) | bit;
    }
    if endian == Endian::Little && num_bits > 8 {
        value = swap_byte_order(value, num_bits);
    }
    value
}

/// Inverse of [`read_bits`]: writes the low `num_bits` of `value` into
/// `buf` at absolute `bit_offset`.
fn write_bits(buf: &mut [u8], bit_offset: usize, num_bits: usize, value: u64, bit_order: BitOrder, endian: Endian) {
    if bit_offset % 8 == 0 && num_bits % 8 == 0 && bit_order == BitOrder::Msb {
        let start = bit_offset / 8;
        let n = num_bits / 8;
        let mut bytes = vec![0u8; n];
        let mut v = value;
        for i in (0..n).rev() {
            bytes[i] = (v & 0xFF) as u8;
            v >>= 8;
        }
        if endian == Endian::Little {
            bytes.reverse();
        }
        buf[start..start + n].copy_from_slice(&bytes);
        return;
    }

    let v = if endian == Endian::Little && num_bits > 8 {
        swap_byte_order(value, num_bits)
    } else {
        value
    };
    for i in 0..num_bits {
        let bit = ((v >> (num_bits - 1 - i)) & 1) as u8;
        let abs_bit = bit_offset + i;
        let byte_idx = abs_bit / 8;
        let bit_in_byte = abs_bit % 8;
        match bit_order {
            BitOrder::Msb => buf[byte_idx] |= bit << (7 - bit_in_byte),
            BitOrder::Lsb => buf[byte_idx] |= bit << bit_in_byte,
        }
    }
}

/// Reverses the byte order of `value`'s low `num_bits` bits (rounded up to
/// a whole byte), used to flip between big- and little-endian assembly.
fn swap_byte_order(value: u64, num_bits: usize) -> u64 {
    let nbytes = (num_bits + 7) / 8;
    let mut bytes = vec![0u8; nbytes];
    let mut v = value;
    for i in (0..nbytes).rev() {
        bytes[i] = (v & 0xFF) as u8;
        v >>= 8;
    }
    bytes.reverse();
    bytes.iter().fold(0u64, |acc, b| (acc << 8) | (*b as u64))
}

// ----------------------------------------------------------- serializing

/// Resolves every field's value with no size or checksum auto-fix applied
/// yet: explicit override, else `from_context` (through `transform`), else
/// `generate`, else `default`.
pub fn resolve(model: &DataModel, overrides: &FieldMap, ctx: &SerializeContext) -> Result<FieldMap> {
    let mut fields = FieldMap::new();
    for block in &model.blocks {
        let value = if let Some(v) = overrides.get(&block.name) {
            v.clone()
        } else if let Some(key) = &block.from_context {
            let raw = resolve_from_context(block, key, ctx.context)?;
            raw
        } else if let Some(gen) = &block.generate {
            resolve_generate(block, gen, ctx.sequence)
        } else if let Some(default) = &block.default {
            default.clone()
        } else {
            return Err(Error::Protocol(ProtocolError::parse(format!(
                "field `{}` has no override, from_context, generate, or default",
                block.name
            ))));
        };
        fields.insert(block.name.clone(), value);
    }
    Ok(fields)
}

fn resolve_from_context(block: &Block, key: &str, context: &ProtocolContext) -> Result<FieldValue> {
    let cv = context
        .get(key)
        .ok_or_else(|| Error::Protocol(ProtocolError::missing_context(key, &context.keys())))?;
    let value = match cv {
        ContextValue::Int(i) => {
            let transformed = transform::apply(&block.transform, *i as u64);
            if block.field_type.is_signed() {
                FieldValue::Int(transformed as i64)
            } else {
                FieldValue::UInt(transformed)
            }
        }
        ContextValue::Bytes(b) => FieldValue::Bytes(b.clone()),
        ContextValue::Str(s) => FieldValue::Str(s.clone()),
    };
    Ok(value)
}

fn resolve_generate(block: &Block, spec: &GenerateSpec, sequence: u64) -> FieldValue {
    match spec {
        GenerateSpec::UnixTimestamp => {
            let secs = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            FieldValue::UInt(secs)
        }
        GenerateSpec::Sequence => FieldValue::UInt(sequence),
        GenerateSpec::RandomBytes(n) => {
            use rand::RngCore;
            let mut buf = vec![0u8; *n];
            rand::thread_rng().fill_bytes(&mut buf);
            if block.field_type == FieldType::String {
                FieldValue::Str(String::from_utf8_lossy(&buf).into_owned())
            } else {
                FieldValue::Bytes(buf)
            }
        }
    }
}

/// Computes `(bit_offset, bit_len)` for every block, given already-resolved
/// field values (needed to know the length of unfixed `Bytes`/`String`
/// fields).
fn compute_layout(model: &DataModel, fields: &FieldMap) -> Result<Vec<(usize, usize)>> {
    let mut offset = 0usize;
    let mut layout = Vec::with_capacity(model.blocks.len());
    for block in &model.blocks {
        let bits = field_bit_len(block, fields.get(&block.name))?;
        layout.push((offset, bits));
        offset += bits;
    }
    Ok(layout)
}

fn field_bit_len(block: &Block, value: Option<&FieldValue>) -> Result<usize> {
    match block.field_type {
        FieldType::Bits => Ok(block.size.unwrap_or(8)),
        t if t.is_integer() => Ok(block.size.unwrap_or_else(|| t.default_byte_size().unwrap()) * 8),
        FieldType::Bytes | FieldType::String => {
            if let Some(fixed) = block.size {
                Ok(fixed * 8)
            } else {
                let v = value.ok_or_else(|| {
                    Error::Protocol(ProtocolError::parse(format!(
                        "field `{}` has no resolved value to size",
                        block.name
                    )))
                })?;
                Ok(v.byte_len() * 8)
            }
        }
    }
}

/// Auto-fix pass: for every `is_size_field`, compute the total serialized
/// bit-length of its `size_of` targets, convert to the field's
/// `size_unit`, and overwrite the field's resolved value.
pub fn auto_fix_sizes(model: &DataModel, fields: &mut FieldMap) -> Result<()> {
    let layout = compute_layout(model, fields)?;
    let mut updates = Vec::new();
    for (idx, block) in model.blocks.iter().enumerate() {
        if !block.is_size_field {
            continue;
        }
        let mut total_bits = 0usize;
        for target in &block.size_of {
            let target_idx = model.index_of(target).ok_or_else(|| {
                Error::Protocol(ProtocolError::parse(format!(
                    "size_of target `{target}` missing for `{}`",
                    block.name
                )))
            })?;
            total_bits += layout[target_idx].1;
        }
        let bytes = (total_bits as u64 + 7) / 8;
        let value = block.size_unit.bytes_to_value(bytes);
        updates.push((idx, value));
        let _ = idx;
    }
    for (idx, value) in updates {
        let name = model.blocks[idx].name.clone();
        fields.insert(name, FieldValue::UInt(value));
    }
    Ok(())
}

/// Emits `fields` to bytes according to `model`'s bit layout. Does not
/// perform size auto-fix or checksum computation; callers run those passes
/// first via [`auto_fix_sizes`] and the checksum logic in [`serialize`].
pub fn emit(model: &DataModel, fields: &FieldMap) -> Result<Vec<u8>> {
    let layout = compute_layout(model, fields)?;
    let total_bits = layout.last().map(|(o, l)| o + l).unwrap_or(0);
    let mut buf = vec![0u8; (total_bits + 7) / 8];

    for (block, (bit_offset, bit_len)) in model.blocks.iter().zip(layout.iter()) {
        let value = fields.get(&block.name).ok_or_else(|| {
            Error::Protocol(ProtocolError::parse(format!("field `{}` missing at emit time", block.name)))
        })?;
        match block.field_type {
            FieldType::Bits => {
                let mut raw = value.as_u64().unwrap_or(0);
                let max = if *bit_len >= 64 { u64::MAX } else { (1u64 << bit_len) - 1 };
                if raw > max {
                    tracing::warn!(field = %block.name, "value exceeds declared bit width, masking");
                    raw &= max;
                }
                write_bits(&mut buf, *bit_offset, *bit_len, raw, block.bit_order, block.endian);
            }
            t if t.is_integer() => {
                let raw = if t.is_signed() {
                    value.as_i64().unwrap_or(0) as u64
                } else {
                    value.as_u64().unwrap_or(0)
                };
                let max = if *bit_len >= 64 { u64::MAX } else { (1u64 << bit_len) - 1 };
                if raw > max {
                    tracing::warn!(field = %block.name, "integer value exceeds declared bit width, masking");
                }
                write_bits(&mut buf, *bit_offset, *bit_len, raw & max, BitOrder::Msb, block.endian);
            }
            FieldType::Bytes | FieldType::String => {
                let bytes = match value {
                    FieldValue::Bytes(b) => b.clone(),
                    FieldValue::Str(s) => s.clone().into_bytes(),
                    _ => {
                        return Err(Error::Protocol(ProtocolError::parse(format!(
                            "field `{}` expected bytes/string value",
                            block.name
                        ))))
                    }
                };
                let start = bit_offset / 8;
                let declared_bytes = bit_len / 8;
                let n = declared_bytes.min(bytes.len());
                buf[start..start + n].copy_from_slice(&bytes[..n]);
            }
        }
    }

    Ok(buf)
}

/// Byte ranges `(start, end)` of each block in the final emitted buffer,
/// used to slice the checksum scope.
fn byte_ranges(layout: &[(usize, usize)]) -> Vec<(usize, usize)> {
    layout.iter().map(|(o, l)| (o / 8, (o + l + 7) / 8)).collect()
}

/// Scope interpretation: `before`/`after` are relative to the checksum
/// field's own bytes; `header` is everything up to (not including) a field
/// named `payload`, falling back to `before` when no such field exists;
/// `payload` is that field's own bytes; `all` is handled separately by the
/// caller since it needs to concatenate two slices.
fn checksum_scope_slice<'a>(
    model: &DataModel,
    ranges: &[(usize, usize)],
    scratch: &'a [u8],
    checksum_idx: usize,
) -> &'a [u8] {
    let (cs_start, cs_end) = ranges[checksum_idx];
    let scope = model.blocks[checksum_idx].scope.unwrap_or(ChecksumScope::All);
    match scope {
        ChecksumScope::Before | ChecksumScope::All => &scratch[..cs_start],
        ChecksumScope::After => &scratch[cs_end..],
        ChecksumScope::Header => match model.index_of("payload") {
            Some(idx) => &scratch[..ranges[idx].0.min(cs_start)],
            None => &scratch[..cs_start],
        },
        ChecksumScope::Payload => match model.index_of("payload") {
            Some(idx) => &scratch[ranges[idx].0..ranges[idx].1],
            None => &scratch[..cs_start],
        },
    }
}

fn compute_checksum_value(
    model: &DataModel,
    layout: &[(usize, usize)],
    scratch: &[u8],
    checksum_idx: usize,
) -> u64 {
    let ranges = byte_ranges(layout);
    let scope = model.blocks[checksum_idx].scope.unwrap_or(ChecksumScope::All);
    let algorithm = model.blocks[checksum_idx].algorithm.expect("validated at model construction");
    if scope == ChecksumScope::All {
        let (cs_start, cs_end) = ranges[checksum_idx];
        let mut combined = Vec::with_capacity(scratch.len() - (cs_end - cs_start));
        combined.extend_from_slice(&scratch[..cs_start]);
        combined.extend_from_slice(&scratch[cs_end..]);
        checksum::compute(algorithm, &combined)
    } else {
        let slice = checksum_scope_slice(model, &ranges, scratch, checksum_idx);
        checksum::compute(algorithm, slice)
    }
}

/// Full two-pass serialization: resolve values, auto-fix sizes, emit,
/// then (if any checksum fields exist) zero them, compute the scratch
/// buffer, write the real checksum, and re-emit.
pub fn serialize(model: &DataModel, overrides: &FieldMap, ctx: &SerializeContext) -> Result<(Vec<u8>, FieldMap)> {
    let mut fields = resolve(model, overrides, ctx)?;
    auto_fix_sizes(model, &mut fields)?;

    let checksum_indices: Vec<usize> = model
        .blocks
        .iter()
        .enumerate()
        .filter(|(_, b)| b.is_checksum)
        .map(|(i, _)| i)
        .collect();

    if checksum_indices.is_empty() {
        let bytes = emit(model, &fields)?;
        return Ok((bytes, fields));
    }

    for &idx in &checksum_indices {
        fields.insert(model.blocks[idx].name.clone(), FieldValue::UInt(0));
    }
    let scratch = emit(model, &fields)?;
    let layout = compute_layout(model, &fields)?;

    for &idx in &checksum_indices {
        let value = compute_checksum_value(model, &layout, &scratch, idx);
        fields.insert(model.blocks[idx].name.clone(), FieldValue::UInt(value));
    }

    let bytes = emit(model, &fields)?;
    Ok((bytes, fields))
}
