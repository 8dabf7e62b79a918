//! Reading counter values back out of a profile buffer.
//!
//! The reader answers one question: what did the instrumented run count for
//! the block at a given IL offset? A debug stress mode can replace measured
//! data entirely with hash-derived weights to shake out consumers that
//! over-trust the profile.

use super::schema::{SchemaEntry, SchemaKind};
use crate::ir::flowgraph::Weight;

// =============================================================================
// Stress Weights
// =============================================================================

/// Deterministic pseudo-random weight for stress testing.
///
/// Yields zero roughly a third of the time so rarely-run-path handling gets
/// exercised, except at offset 0: the method entry is never made cold.
pub fn stress_weight(offset: u32, method_hash: u32, seed: u32) -> Weight {
    let hash = method_hash.wrapping_mul(seed) ^ offset.wrapping_mul(1027);
    let mut weight = if hash % 3 == 0 {
        0
    } else if hash % 11 == 0 {
        (hash % 23) * (hash % 29) * (hash % 31)
    } else {
        (hash % 17) * (hash % 19)
    };
    if offset == 0 && weight == 0 {
        weight = 1 + hash % 5;
    }
    weight as Weight
}

// =============================================================================
// Profile Reader
// =============================================================================

/// Read-only view over a method's schema and quiesced counter buffer.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProfileReader<'a> {
    schema: Option<&'a [SchemaEntry]>,
    data: Option<&'a [u8]>,
    import_only: bool,
    method_hash: u32,
    stress_seed: u32,
}

impl<'a> ProfileReader<'a> {
    /// Reader over measured data.
    pub fn new(schema: &'a [SchemaEntry], data: &'a [u8]) -> Self {
        Self {
            schema: Some(schema),
            data: Some(data),
            ..Self::default()
        }
    }

    /// Reader for a compilation with no profile attached.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Mark this compilation as import-only; profile data is then ignored.
    pub fn import_only(mut self, import_only: bool) -> Self {
        self.import_only = import_only;
        self
    }

    /// Enable stress mode. A non-zero seed supersedes measured data.
    pub fn with_stress(mut self, method_hash: u32, seed: u32) -> Self {
        self.method_hash = method_hash;
        self.stress_seed = seed;
        self
    }

    /// Whether measured profile data is available to this compilation.
    pub fn have_profile_data(&self) -> bool {
        !self.import_only && self.schema.is_some()
    }

    /// Counter value for the block at `offset`, from measured data only.
    ///
    /// `None` means no profile is attached at all. `Some(0.0)` is returned
    /// when a schema exists but carries no entry for this offset; callers
    /// that care can still distinguish "no data" from "measured cold".
    pub fn weight_for_il_offset(&self, offset: u32) -> Option<Weight> {
        if !self.have_profile_data() {
            return None;
        }
        let schema = self.schema.unwrap_or(&[]);
        let data = self.data.unwrap_or(&[]);
        for entry in schema {
            if entry.kind == SchemaKind::BlockIntCount && entry.il_offset == offset as i32 {
                return Some(read_counter(data, entry.offset as usize) as Weight);
            }
        }
        Some(0.0)
    }

    /// Block weight as the solver should see it: stress mode, when seeded,
    /// wins over measured data.
    pub fn block_weight(&self, offset: u32) -> Option<Weight> {
        if self.stress_seed != 0 {
            return Some(stress_weight(offset, self.method_hash, self.stress_seed));
        }
        self.weight_for_il_offset(offset)
    }
}

fn read_counter(data: &[u8], offset: usize) -> u32 {
    match data.get(offset..offset + 4) {
        Some(bytes) => u32::from_le_bytes(bytes.try_into().unwrap_or([0; 4])),
        None => {
            debug_assert!(false, "counter offset {offset} out of bounds");
            0
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
