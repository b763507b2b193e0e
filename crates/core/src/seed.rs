//! Seed normalization.
//!
//! Callers ask for a random seed with the sentinel `-1`. Every such
//! sentinel must be replaced with a concrete value before the graph is
//! submitted, since the engine would otherwise reject or reuse it.

use rand::Rng;
use serde::Serialize;

use crate::workflow::WorkflowGraph;

/// Node input names that carry a sampler seed.
pub const SEED_INPUTS: &[&str] = &["seed", "noise_seed"];

/// Sentinel meaning "pick a random seed".
pub const RANDOM_SEED_SENTINEL: i64 = -1;

/// Largest generated seed (2^32 - 1). Generated seeds fall in `0..=MAX_SEED`.
pub const MAX_SEED: u64 = u32::MAX as u64;

/// A sentinel that was replaced during [`normalize_seeds`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeedAssignment {
    pub node_id: String,
    pub input: String,
    pub seed: u64,
}

pub fn random_seed<R: Rng>(rng: &mut R) -> u64 {
    rng.random_range(0..=MAX_SEED)
}

/// Resolve a job-level seed: the sentinel becomes a random seed, any
/// other value is kept.
pub fn resolve_seed<R: Rng>(requested: i64, rng: &mut R) -> i64 {
    if requested == RANDOM_SEED_SENTINEL {
        random_seed(rng) as i64
    } else {
        requested
    }
}

/// Replace every `seed` / `noise_seed` input holding the integer `-1`
/// with a fresh random seed. All other values are left untouched.
pub fn normalize_seeds<R: Rng>(graph: &mut WorkflowGraph, rng: &mut R) -> Vec<SeedAssignment> {
    let mut assignments = Vec::new();

    for (node_id, node) in graph.nodes_mut() {
        for &input in SEED_INPUTS {
            let Some(value) = node.inputs.get_mut(input) else {
                continue;
            };
            if value.as_i64() != Some(RANDOM_SEED_SENTINEL) {
                continue;
            }

            let seed = random_seed(rng);
            *value = seed.into();
            assignments.push(SeedAssignment {
                node_id: node_id.clone(),
                input: input.to_string(),
                seed,
            });
        }
    }

    assignments
}
