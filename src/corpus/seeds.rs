//! Default seed generation for a plugin that declares a `data_model` but no
//! explicit seed corpus.

use crate::context::ProtocolContext;
use crate::data_model::{parser, DataModel, FieldMap, FieldValue};
use crate::error::Result;

/// Maximum number of seeds this generator ever emits, including the
/// all-defaults seed, to keep an enum-heavy data model from exploding into
/// a combinatorial seed set.
pub const MAX_GENERATED_SEEDS: usize = 8;

/// One seed from the all-`default` serialization, plus one seed per
/// enumerated `values` member (substituted into its own field, defaults
/// elsewhere), stopping once [`MAX_GENERATED_SEEDS`] is reached.
pub fn generate_default_seeds(model: &DataModel) -> Result<Vec<Vec<u8>>> {
    let ctx = ProtocolContext::new();
    let serialize_ctx = parser::SerializeContext::new(&ctx, 0);

    let mut seeds = Vec::new();
    let (default_bytes, _) = parser::serialize(model, &FieldMap::new(), &serialize_ctx)?;
    seeds.push(default_bytes);

    'gen: for block in model.blocks.iter().filter(|b| b.values.is_some()) {
        let values = block.values.as_ref().unwrap();
        for member in values.keys() {
            if seeds.len() >= MAX_GENERATED_SEEDS {
                break 'gen;
            }
            let mut overrides = FieldMap::new();
            overrides.insert(block.name.clone(), FieldValue::Int(*member));
            let (bytes, _) = parser::serialize(model, &overrides, &serialize_ctx)?;
            seeds.push(bytes);
        }
    }

    Ok(seeds)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data_model::{Block, FieldType};
    use std::collections::BTreeMap;

    fn model_with_enum() -> DataModel {
        let mut values = BTreeMap::new();
        values.insert(1, "LOGIN".to_string());
        values.insert(2, "LOGOUT".to_string());
        values.insert(3, "PING".to_string());
        DataModel::new(vec![
            Block { values: Some(values), default: Some(FieldValue::UInt(1)), ..Block::new("command", FieldType::UInt8) },
            Block::new("payload", FieldType::UInt8).with_default(FieldValue::UInt(0)),
        ])
        .unwrap()
    }

    #[test]
    fn generates_one_seed_per_enum_member_plus_default() {
        let seeds = generate_default_seeds(&model_with_enum()).unwrap();
        assert_eq!(seeds.len(), 4);
    }

    #[test]
    fn caps_at_max_generated_seeds() {
        let mut values = BTreeMap::new();
        for i in 0..20 {
            values.insert(i, format!("V{i}"));
        }
        let model = DataModel::new(vec![
            Block { values: Some(values), default: Some(FieldValue::UInt(0)), ..Block::new("command", FieldType::UInt8) },
        ])
        .unwrap();
        let seeds = generate_default_seeds(&model).unwrap();
        assert_eq!(seeds.len(), MAX_GENERATED_SEEDS);
    }

    #[test]
    fn no_enum_fields_yields_single_default_seed() {
        let model = DataModel::new(vec![
            Block::new("magic", FieldType::UInt16).with_default(FieldValue::UInt(0xCAFE)),
            Block::new("payload", FieldType::UInt8).with_default(FieldValue::UInt(0)),
        ])
        .unwrap();
        let seeds = generate_default_seeds(&model).unwrap();
        assert_eq!(seeds.len(), 1);
    }
}
