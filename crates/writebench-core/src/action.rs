// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Memory actions and canonical delta computation.
//!
//! Actions are a tagged sum rather than a struct of nullable fields;
//! each variant carries exactly the fields its validation consumes.

use crate::episode::Step;
use serde::Serialize;
use serde_json::{Map, Value};

/// Observation key that carries endpoint identity for MERGE gating.
pub const ENDPOINT_KEY: &str = "api";

/// One decision a write policy can emit for a step.
#[derive(Debug, Clone, PartialEq)]
pub enum MemoryAction {
    /// Store nothing. Never rejected, costs nothing.
    Skip,
    /// Store `step` as a BASE item, charged its full estimated bytes.
    Write {
        /// The step to store.
        step: Step,
    },
    /// Store the delta between `step` and the BASE at `target_t`.
    Merge {
        /// The incoming step the delta is computed from.
        step: Step,
        /// Timestep of the BASE item the delta augments.
        target_t: u64,
        /// Explicit delta. When present it must equal the canonical
        /// delta exactly; when absent the store computes it.
        delta: Option<Map<String, Value>>,
    },
    /// Remove the item at `target_t` and credit its bytes back.
    Expire {
        /// Timestep of the item to remove.
        target_t: u64,
    },
}

impl MemoryAction {
    /// The action's kind tag.
    #[must_use]
    pub fn kind(&self) -> ActionKind {
        match self {
            Self::Skip => ActionKind::Skip,
            Self::Write { .. } => ActionKind::Write,
            Self::Merge { .. } => ActionKind::Merge,
            Self::Expire { .. } => ActionKind::Expire,
        }
    }
}

/// Kind tag for counters and the action log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// No-op.
    Skip,
    /// BASE insertion.
    Write,
    /// DELTA insertion.
    Merge,
    /// Item removal.
    Expire,
}

impl std::fmt::Display for ActionKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Skip => "skip",
            Self::Write => "write",
            Self::Merge => "merge",
            Self::Expire => "expire",
        })
    }
}

/// Computes the canonical delta between an incoming observation and a
/// base observation.
///
/// The delta maps every key of `incoming` except [`ENDPOINT_KEY`] whose
/// value is absent from, or different in, `base`. Returns `None` when
/// either observation is not a JSON object; an empty map means the
/// observations agree on every non-endpoint key.
#[must_use]
pub fn canonical_delta(incoming: &Value, base: &Value) -> Option<Map<String, Value>> {
    let incoming = incoming.as_object()?;
    let base = base.as_object()?;
    let mut delta = Map::new();
    for (key, value) in incoming {
        if key == ENDPOINT_KEY {
            continue;
        }
        if base.get(key) != Some(value) {
            delta.insert(key.clone(), value.clone());
        }
    }
    Some(delta)
}
