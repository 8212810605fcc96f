// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Deterministic byte cost estimator.
//!
//! Every byte the budget charges is defined over the canonical encoding
//! in [`crate::canon`], so two runs on any platform charge identical
//! costs for identical payloads.

use crate::canon::{object_to_canonical_string, to_canonical_string};
use crate::episode::Step;
use serde_json::{Map, Value};

/// Fixed per-record header charged for every stored step.
pub const STEP_HEADER_BYTES: u64 = 32;

/// Fixed overhead charged for every merge delta record.
pub const MERGE_OVERHEAD_BYTES: u64 = 16;

/// Byte cost of storing `step` as a BASE item.
///
/// Canonical observation bytes plus canonical metadata bytes plus
/// [`STEP_HEADER_BYTES`].
#[must_use]
pub fn estimate_step_bytes(step: &Step) -> u64 {
    let obs = to_canonical_string(&step.observation).len() as u64;
    let meta = object_to_canonical_string(&step.metadata).len() as u64;
    obs + meta + STEP_HEADER_BYTES
}

/// Byte cost of storing `delta` as a DELTA item.
///
/// Canonical delta bytes plus [`MERGE_OVERHEAD_BYTES`].
#[must_use]
pub fn estimate_delta_bytes(delta: &Map<String, Value>) -> u64 {
    object_to_canonical_string(delta).len() as u64 + MERGE_OVERHEAD_BYTES
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn step(obs: Value) -> Step {
        Step {
            t: 0,
            observation: obs,
            metadata: Map::new(),
        }
    }

    #[test]
    fn step_cost_is_canonical_lengths_plus_header() {
        let s = step(json!({"api": "x", "v": 1}));
        // {"api":"x","v":1} is 17 bytes, {} is 2 bytes.
        assert_eq!(estimate_step_bytes(&s), 17 + 2 + STEP_HEADER_BYTES);
    }

    #[test]
    fn scalar_observation_costs_its_rendering() {
        let s = step(json!(7));
        assert_eq!(estimate_step_bytes(&s), 1 + 2 + STEP_HEADER_BYTES);
    }

    #[test]
    fn delta_cost_uses_merge_overhead() {
        let mut delta = Map::new();
        delta.insert("v".to_owned(), json!(2));
        // {"v":2} is 7 bytes.
        assert_eq!(estimate_delta_bytes(&delta), 7 + MERGE_OVERHEAD_BYTES);
    }

    #[test]
    fn cost_is_insensitive_to_key_insertion_order() {
        let a = step(json!({"b": 1, "a": 2}));
        let b = step(json!({"a": 2, "b": 1}));
        assert_eq!(estimate_step_bytes(&a), estimate_step_bytes(&b));
    }
}
