//! `mutate(seed, ctx) -> bytes`: byte-level and structure-aware mutation,
//! selected per [`MutationMode`]. A session owns one [`MutationEngine`],
//! seeded once so a given `(seed_bytes, rng_seed)` pair always mutates the
//! same way.

pub mod byte_level;
pub mod structure_aware;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::data_model::parser::SerializeContext;
use crate::data_model::DataModel;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum MutationMode {
    #[default]
    ByteLevel,
    StructureAware,
    Hybrid,
}

pub struct MutationEngine {
    mode: MutationMode,
    structure_aware_weight: u8,
    havoc_limits: byte_level::HavocLimits,
    rng: StdRng,
}

impl MutationEngine {
    pub fn new(mode: MutationMode, structure_aware_weight: u8, rng_seed: u64, havoc_max_size: usize) -> Self {
        Self {
            mode,
            structure_aware_weight: structure_aware_weight.min(100),
            havoc_limits: byte_level::HavocLimits { max_size: havoc_max_size },
            rng: StdRng::seed_from_u64(rng_seed),
        }
    }

    /// Mutates `seed`. `data_model` is `None` when the active plugin
    /// declares no data model for this message, in which case mutation
    /// always degrades to `byte_level` regardless of configured mode.
    /// `splice_partner` supplies a second seed for the `Splice`
    /// byte-mutator; `ctx` is required whenever structure-aware mutation
    /// runs, to resolve any non-mutated `from_context` fields during
    /// re-serialization.
    pub fn mutate(
        &mut self,
        seed: &[u8],
        data_model: Option<&DataModel>,
        splice_partner: Option<&[u8]>,
        ctx: &SerializeContext,
    ) -> Result<Vec<u8>> {
        if seed.is_empty() {
            return Ok(Vec::new());
        }

        let Some(model) = data_model else {
            return Ok(self.mutate_byte_level(seed, splice_partner));
        };

        let use_structure_aware = match self.mode {
            MutationMode::ByteLevel => false,
            MutationMode::StructureAware => true,
            MutationMode::Hybrid => self.rng.gen_range(0..100) < self.structure_aware_weight,
        };

        if !use_structure_aware {
            return Ok(self.mutate_byte_level(seed, splice_partner));
        }

        match structure_aware::mutate(&mut self.rng, model, seed, ctx, self.havoc_limits.max_size) {
            Ok(bytes) => Ok(bytes),
            Err(_) => Ok(self.mutate_byte_level(seed, splice_partner)),
        }
    }

    fn mutate_byte_level(&mut self, seed: &[u8], splice_partner: Option<&[u8]>) -> Vec<u8> {
        let mutator = byte_level::choose(&mut self.rng);
        byte_level::apply(&mut self.rng, mutator, seed, splice_partner, &self.havoc_limits)
    }
}
