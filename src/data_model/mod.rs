//! The protocol data model: ordered [`Block`] fields making up a [`DataModel`],
//! plus the value types and per-field pipelines (`transform`, `generate`,
//! `behavior`) that the parser in [`parser`] resolves at serialization time.

pub mod checksum;
pub mod parser;
pub mod transform;

use std::collections::BTreeMap;

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::error::{Error, ProtocolError, Result};

/// Ordered map of field name to resolved value, produced by [`parser::parse`]
/// and consumed by [`parser::serialize`].
pub type FieldMap = IndexMap<String, FieldValue>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FieldType {
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Int8,
    Int16,
    Int32,
    Int64,
    Bytes,
    String,
    Bits,
}

impl FieldType {
    /// Default fixed byte size for a type that is always byte-aligned.
    /// `Bytes`/`String`/`Bits` have no implicit default; they require an
    /// explicit `size`, `max_size`, or linked size field.
    pub fn default_byte_size(self) -> Option<usize> {
        use FieldType::*;
        match self {
            UInt8 | Int8 => Some(1),
            UInt16 | Int16 => Some(2),
            UInt32 | Int32 => Some(4),
            UInt64 | Int64 => Some(8),
            Bytes | String | Bits => None,
        }
    }

    pub fn is_signed(self) -> bool {
        matches!(self, FieldType::Int8 | FieldType::Int16 | FieldType::Int32 | FieldType::Int64)
    }

    pub fn is_integer(self) -> bool {
        self.default_byte_size().is_some()
    }

    pub fn bit_width(self) -> Option<u32> {
        self.default_byte_size().map(|b| (b as u32) * 8)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Endian {
    #[default]
    Big,
    Little,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BitOrder {
    #[default]
    Msb,
    Lsb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SizeUnit {
    Bits,
    #[default]
    Bytes,
    Words,
    Dwords,
}

impl SizeUnit {
    /// Convert a raw size-field value into a byte count, per the factors
    /// named in the data model spec: bits divides by 8 (rounding up),
    /// words multiplies by 4, dwords multiplies by 2.
    pub fn value_to_bytes(self, value: u64) -> u64 {
        match self {
            SizeUnit::Bits => (value + 7) / 8,
            SizeUnit::Bytes => value,
            SizeUnit::Words => value * 4,
            SizeUnit::Dwords => value * 2,
        }
    }

    /// Inverse of [`Self::value_to_bytes`], used by auto-fix to store a
    /// computed byte length back into the size field's own unit.
    pub fn bytes_to_value(self, bytes: u64) -> u64 {
        match self {
            SizeUnit::Bits => bytes * 8,
            SizeUnit::Bytes => bytes,
            SizeUnit::Words => (bytes + 3) / 4,
            SizeUnit::Dwords => (bytes + 1) / 2,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumAlgorithm {
    Crc32,
    Adler32,
    Sum,
    Xor,
    Sum8,
    Sum16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChecksumScope {
    All,
    Before,
    After,
    Header,
    Payload,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GenerateSpec {
    UnixTimestamp,
    Sequence,
    RandomBytes(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransformOp {
    AndMask(u64),
    OrMask(u64),
    Xor(u64),
    ShiftLeft(u32),
    ShiftRight(u32),
    Invert { bit_width: Option<u32> },
    AddConstant(i64),
    SubtractConstant(i64),
    Modulo(u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum BehaviorOp {
    Increment,
    AddConstant,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct BehaviorSpec {
    pub operation: BehaviorOp,
    pub initial: i64,
    pub step: i64,
    pub wrap: Option<i64>,
}

/// A resolved (or default/override) field value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum FieldValue {
    UInt(u64),
    Int(i64),
    Bytes(Vec<u8>),
    Str(String),
}

impl FieldValue {
    pub fn as_u64(&self) -> Option<u64> {
        match self {
            FieldValue::UInt(v) => Some(*v),
            FieldValue::Int(v) => Some(*v as u64),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            FieldValue::UInt(v) => Some(*v as i64),
            FieldValue::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn byte_len(&self) -> usize {
        match self {
            FieldValue::Bytes(b) => b.len(),
            FieldValue::Str(s) => s.len(),
            FieldValue::UInt(_) | FieldValue::Int(_) => 0,
        }
    }
}

/// A single declared field inside a data model.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Block {
    pub name: String,
    pub field_type: FieldType,
    /// Bytes for fixed integer/bytes/string types, bits for `Bits`.
    pub size: Option<usize>,
    pub max_size: Option<usize>,
    pub endian: Endian,
    pub bit_order: BitOrder,
    pub default: Option<FieldValue>,
    pub mutable: bool,
    pub values: Option<BTreeMap<i64, String>>,
    pub is_size_field: bool,
    pub size_of: Vec<String>,
    pub size_unit: SizeUnit,
    pub is_checksum: bool,
    pub algorithm: Option<ChecksumAlgorithm>,
    pub scope: Option<ChecksumScope>,
    pub from_context: Option<String>,
    pub generate: Option<GenerateSpec>,
    pub transform: Vec<TransformOp>,
    pub behavior: Option<BehaviorSpec>,
}

impl Block {
    /// Construct a field with the spec's defaults (`mutable: true`, big
    /// endian, msb bit order, bytes size unit), enforcing the
    /// `from_context` ⇒ `mutable: false` invariant unconditionally.
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
            size: field_type.default_byte_size(),
            max_size: None,
            endian: Endian::Big,
            bit_order: BitOrder::Msb,
            default: None,
            mutable: true,
            values: None,
            is_size_field: false,
            size_of: Vec::new(),
            size_unit: SizeUnit::Bytes,
            is_checksum: false,
            algorithm: None,
            scope: None,
            from_context: None,
            generate: None,
            transform: Vec::new(),
            behavior: None,
        }
    }

    pub fn with_default(mut self, value: FieldValue) -> Self {
        self.default = Some(value);
        self
    }

    pub fn with_size(mut self, size: usize) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_max_size(mut self, max_size: usize) -> Self {
        self.max_size = Some(max_size);
        self
    }

    pub fn non_mutable(mut self) -> Self {
        self.mutable = false;
        self
    }

    pub fn as_size_field(mut self, size_of: Vec<String>, unit: SizeUnit) -> Self {
        self.is_size_field = true;
        self.size_of = size_of;
        self.size_unit = unit;
        self
    }

    pub fn as_checksum(mut self, algorithm: ChecksumAlgorithm, scope: ChecksumScope) -> Self {
        self.is_checksum = true;
        self.algorithm = Some(algorithm);
        self.scope = Some(scope);
        self
    }

    pub fn from_context(mut self, key: impl Into<String>) -> Self {
        self.from_context = Some(key.into());
        self.mutable = false;
        self
    }

    pub fn with_transform(mut self, ops: Vec<TransformOp>) -> Self {
        self.transform = ops;
        self
    }

    /// Bit width used for masking/clamping and for `invert` inference.
    pub fn bit_width(&self) -> u32 {
        match self.field_type {
            FieldType::Bits => self.size.unwrap_or(8) as u32,
            _ => self
                .field_type
                .bit_width()
                .unwrap_or_else(|| self.size.unwrap_or(1) as u32 * 8),
        }
    }

    /// True when the command/message-type field: named `command` or
    /// `message_type`, or the first block carrying an enumerated `values`
    /// map — used by stateful seed matching.
    pub fn looks_like_command_field(&self) -> bool {
        self.name == "command" || self.name == "message_type" || self.values.is_some()
    }
}

/// Ordered list of [`Block`]s plus the optional per-message collaborators
/// named in the plugin contract. `response_model` is itself a `DataModel`
/// describing the reply this message expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataModel {
    pub blocks: Vec<Block>,
}

impl DataModel {
    pub fn new(blocks: Vec<Block>) -> Result<Self> {
        let model = Self { blocks };
        model.validate()?;
        Ok(model)
    }

    fn validate(&self) -> Result<()> {
        let mut seen = std::collections::HashSet::new();
        for block in &self.blocks {
            if !seen.insert(block.name.as_str()) {
                return Err(Error::Protocol(ProtocolError::parse(format!(
                    "duplicate block name `{}`",
                    block.name
                ))));
            }
            if block.from_context.is_some() && block.mutable {
                return Err(Error::Protocol(ProtocolError::parse(format!(
                    "field `{}` has from_context but is marked mutable",
                    block.name
                ))));
            }
            if block.is_size_field {
                for target in &block.size_of {
                    if !self.blocks.iter().any(|b| &b.name == target) {
                        return Err(Error::Protocol(ProtocolError::parse(format!(
                            "size_of target `{target}` does not exist for size field `{}`",
                            block.name
                        ))));
                    }
                }
            }
        }
        Ok(())
    }

    pub fn field(&self, name: &str) -> Option<&Block> {
        self.blocks.iter().find(|b| b.name == name)
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.blocks.iter().position(|b| b.name == name)
    }

    /// Resolves the `command`/`message_type` block used for stateful seed
    /// matching: the block literally named `command` or `message_type`, or
    /// else the first block carrying an enumerated `values` map.
    pub fn command_field(&self) -> Option<&Block> {
        self.blocks
            .iter()
            .find(|b| b.name == "command" || b.name == "message_type")
            .or_else(|| self.blocks.iter().find(|b| b.values.is_some()))
    }

    pub fn checksum_fields(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.is_checksum)
    }

    pub fn mutable_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| b.mutable)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_duplicate_names() {
        let blocks = vec![Block::new("a", FieldType::UInt8), Block::new("a", FieldType::UInt8)];
        assert!(DataModel::new(blocks).is_err());
    }

    #[test]
    fn rejects_missing_size_of_target() {
        let blocks = vec![Block::new("len", FieldType::UInt16).as_size_field(
            vec!["payload".to_string()],
            SizeUnit::Bytes,
        )];
        assert!(DataModel::new(blocks).is_err());
    }

    #[test]
    fn from_context_forces_immutable() {
        let block = Block::new("token", FieldType::UInt32).from_context("session_token");
        assert!(!block.mutable);
    }
}
