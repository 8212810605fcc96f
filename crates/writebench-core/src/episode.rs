// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Episode data model: steps, labels, and validation.
//!
//! Episodes are immutable once loaded. The evaluator borrows them
//! read-only; nothing in the core mutates a step or a label after the
//! stream loader has accepted the record.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;

/// One observation in an episode stream.
///
/// Equality is structural: two steps are equal when their timestep,
/// observation, and metadata are equal. `serde_json` maps compare
/// order-independently, so key insertion order never matters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Step {
    /// Timestep index. Non-negative by construction (`u64`), strictly
    /// increasing within an episode.
    pub t: u64,
    /// Arbitrary structured payload: a JSON object or a scalar.
    pub observation: Value,
    /// Auxiliary mapping (priority, source tags, ...). Possibly empty.
    pub metadata: Map<String, Value>,
}

/// Ground-truth labels attached to an episode.
///
/// Unknown label keys are tolerated on load and dropped; the benchmark
/// scores only the fields modeled here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Labels {
    /// Timesteps whose retention the benchmark rewards.
    pub critical_steps: BTreeSet<u64>,
    /// Total number of drift events in the episode. Always at least
    /// `critical_steps.len()`.
    pub total_drift_events: u64,
    /// Optional per-timestep utility. Missing entries contribute zero.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub per_step_utility: Option<BTreeMap<u64, f64>>,
}

impl Labels {
    /// Utility of retaining timestep `t`. Zero when unlabeled.
    #[must_use]
    pub fn utility_at(&self, t: u64) -> f64 {
        self.per_step_utility
            .as_ref()
            .and_then(|m| m.get(&t))
            .copied()
            .unwrap_or(0.0)
    }
}

/// Identifier assigned to an episode at load time.
///
/// Episode records on the wire carry no id; the loader derives one from
/// the set name and the record index (`<set>:<index>`), which also seeds
/// randomized policies deterministically.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct EpisodeId(String);

impl EpisodeId {
    /// Builds the id for record `index` of set `set`.
    #[must_use]
    pub fn new(set: &str, index: usize) -> Self {
        Self(format!("{set}:{index}"))
    }

    /// The id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EpisodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// A finite ordered sequence of steps plus labels.
#[derive(Debug, Clone, PartialEq)]
pub struct Episode {
    /// Load-time identifier; not part of the wire record.
    pub id: EpisodeId,
    /// Steps in strictly increasing timestep order.
    pub steps: Vec<Step>,
    /// Ground-truth labels.
    pub labels: Labels,
}

impl Episode {
    /// Timestep of the last step, or `None` for an empty episode.
    #[must_use]
    pub fn last_t(&self) -> Option<u64> {
        self.steps.last().map(|s| s.t)
    }

    /// Validates the structural rules an episode must satisfy.
    ///
    /// Timesteps must be strictly increasing (contiguity is not
    /// required), `total_drift_events` must cover `critical_steps`, and
    /// utilities must be finite and non-negative.
    pub fn validate(&self) -> Result<(), EpisodeError> {
        for pair in self.steps.windows(2) {
            if pair[1].t <= pair[0].t {
                return Err(EpisodeError::NonIncreasingTimestep {
                    prev: pair[0].t,
                    next: pair[1].t,
                });
            }
        }
        let critical = self.labels.critical_steps.len() as u64;
        if self.labels.total_drift_events < critical {
            return Err(EpisodeError::DriftCountTooSmall {
                total_drift_events: self.labels.total_drift_events,
                critical,
            });
        }
        if let Some(utilities) = &self.labels.per_step_utility {
            for (&t, &u) in utilities {
                if !u.is_finite() || u < 0.0 {
                    return Err(EpisodeError::InvalidUtility { t, utility: u });
                }
            }
        }
        Ok(())
    }
}

/// Structural violations in an episode record.
#[derive(Debug, Error, PartialEq)]
pub enum EpisodeError {
    /// Timesteps must be strictly increasing.
    #[error("timesteps not strictly increasing: {prev} then {next}")]
    NonIncreasingTimestep {
        /// Earlier step's timestep.
        prev: u64,
        /// Offending step's timestep.
        next: u64,
    },
    /// `total_drift_events` must be at least `|critical_steps|`.
    #[error("total_drift_events {total_drift_events} < |critical_steps| {critical}")]
    DriftCountTooSmall {
        /// Declared drift event count.
        total_drift_events: u64,
        /// Number of critical steps.
        critical: u64,
    },
    /// Per-step utilities must be finite and non-negative.
    #[error("utility for timestep {t} is invalid: {utility}")]
    InvalidUtility {
        /// Labeled timestep.
        t: u64,
        /// Offending utility value.
        utility: f64,
    },
}
