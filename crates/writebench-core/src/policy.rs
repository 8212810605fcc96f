// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! The write-policy seam.
//!
//! The evaluator never sees a policy's internals; a policy never sees a
//! mutable store. [`StoreView`] is the read-only capability handed to
//! [`WritePolicy::select`], and returned [`MemoryAction`]s are the only
//! mutation path. That asymmetry is what makes the rejection-atomicity
//! property testable at all.

use crate::action::MemoryAction;
use crate::episode::{Episode, Step};
use crate::store::{MemoryItem, MemoryStore};
use serde::Serialize;
use std::str::FromStr;

/// Metadata key carrying the privileged priority signal.
pub const PRIORITY_KEY: &str = "priority";

/// Metadata keys visible to Unprivileged-track policies.
pub const UNPRIVILEGED_METADATA_KEYS: &[&str] = &["source", "tags"];

/// Whether policies may read the priority signal in step metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Track {
    /// Metadata passes through unchanged, including `priority`.
    Privileged,
    /// Metadata is stripped to [`UNPRIVILEGED_METADATA_KEYS`].
    Unprivileged,
}

impl std::fmt::Display for Track {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Privileged => "privileged",
            Self::Unprivileged => "unprivileged",
        })
    }
}

impl FromStr for Track {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "privileged" => Ok(Self::Privileged),
            "unprivileged" => Ok(Self::Unprivileged),
            other => Err(format!("unknown track: {other}")),
        }
    }
}

/// Returns the step a policy on `track` is allowed to see.
///
/// Privileged passes the step through; Unprivileged drops every
/// metadata key outside the allow-list.
#[must_use]
pub fn redact_step(step: &Step, track: Track) -> Step {
    match track {
        Track::Privileged => step.clone(),
        Track::Unprivileged => {
            let metadata = step
                .metadata
                .iter()
                .filter(|(k, _)| UNPRIVILEGED_METADATA_KEYS.contains(&k.as_str()))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            Step {
                t: step.t,
                observation: step.observation.clone(),
                metadata,
            }
        }
    }
}

/// Read-only capability over the memory store.
///
/// Views are ephemeral: a policy must not retain one beyond a single
/// `select` invocation (the borrow makes that structural).
#[derive(Clone, Copy)]
pub struct StoreView<'a> {
    store: &'a MemoryStore,
}

impl<'a> StoreView<'a> {
    /// Wraps a store in a read-only view.
    #[must_use]
    pub fn new(store: &'a MemoryStore) -> Self {
        Self { store }
    }

    /// Bytes still available.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.store.remaining()
    }

    /// The byte budget.
    #[must_use]
    pub fn max_bytes(&self) -> u64 {
        self.store.max_bytes()
    }

    /// Bytes currently charged.
    #[must_use]
    pub fn bytes_used(&self) -> u64 {
        self.store.bytes_used()
    }

    /// Number of retained items.
    #[must_use]
    pub fn len(&self) -> usize {
        self.store.len()
    }

    /// Whether the store holds no items.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.store.is_empty()
    }

    /// Whether an item occupies timestep `t`.
    #[must_use]
    pub fn contains(&self, t: u64) -> bool {
        self.store.contains(t)
    }

    /// The item at timestep `t`, if any.
    #[must_use]
    pub fn get(&self, t: u64) -> Option<&'a MemoryItem> {
        self.store.get(t)
    }

    /// The earliest-inserted item still present.
    #[must_use]
    pub fn oldest_item(&self) -> Option<&'a MemoryItem> {
        self.store.oldest_item()
    }

    /// Current items in timestep order.
    pub fn iter(&self) -> impl Iterator<Item = &'a MemoryItem> {
        self.store.items()
    }
}

/// An online memory write policy.
///
/// Constructed fresh per (episode, budget, track) condition. `select`
/// may return no actions, one, or several; the driver applies them in
/// emission order and a policy's continued behavior must not depend on
/// any particular action being accepted.
pub trait WritePolicy {
    /// Decides what to do with `step` given the current store contents.
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction>;
}

/// Everything a factory may consult when building a policy instance.
pub struct ConditionContext<'a> {
    /// The episode about to be evaluated. Clairvoyant baselines (the
    /// oracle) may read it; online policies should ignore it.
    pub episode: &'a Episode,
    /// The condition's byte budget.
    pub budget: u64,
    /// The condition's track.
    pub track: Track,
    /// Deterministic per-condition seed; see [`condition_seed`].
    pub seed: [u8; 32],
}

/// Builds policy instances, one per condition.
pub trait PolicyFactory {
    /// Stable identifier used in result rows and seed derivation.
    fn id(&self) -> &str;

    /// Builds a fresh policy instance for one condition.
    fn build(&self, ctx: &ConditionContext<'_>) -> Box<dyn WritePolicy>;
}

/// Derives the per-condition seed from the condition identity.
///
/// Identical (episode id, budget, policy id) triples yield identical
/// seeds on every platform, which is what makes randomized policies
/// reproducible run to run.
#[must_use]
pub fn condition_seed(episode_id: &str, budget: u64, policy_id: &str) -> [u8; 32] {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"writebench/condition-seed/v1");
    hasher.update(&(episode_id.len() as u64).to_le_bytes());
    hasher.update(episode_id.as_bytes());
    hasher.update(&budget.to_le_bytes());
    hasher.update(&(policy_id.len() as u64).to_le_bytes());
    hasher.update(policy_id.as_bytes());
    *hasher.finalize().as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{json, Map};

    fn step_with_metadata() -> Step {
        let mut metadata = Map::new();
        metadata.insert("priority".to_owned(), json!(0.8));
        metadata.insert("source".to_owned(), json!("sensor-3"));
        metadata.insert("tags".to_owned(), json!(["a"]));
        metadata.insert("debug".to_owned(), json!(true));
        Step {
            t: 0,
            observation: json!({"api": "x"}),
            metadata,
        }
    }

    #[test]
    fn privileged_sees_priority() {
        let step = step_with_metadata();
        let seen = redact_step(&step, Track::Privileged);
        assert_eq!(seen, step);
    }

    #[test]
    fn unprivileged_sees_only_allow_listed_keys() {
        let step = step_with_metadata();
        let seen = redact_step(&step, Track::Unprivileged);
        assert!(seen.metadata.get(PRIORITY_KEY).is_none());
        assert!(seen.metadata.get("debug").is_none());
        assert_eq!(seen.metadata.get("source"), Some(&json!("sensor-3")));
        assert_eq!(seen.metadata.get("tags"), Some(&json!(["a"])));
        assert_eq!(seen.observation, step.observation);
    }

    #[test]
    fn seed_is_a_function_of_the_condition_identity() {
        let a = condition_seed("set:0", 1024, "random");
        let b = condition_seed("set:0", 1024, "random");
        assert_eq!(a, b);
        assert_ne!(a, condition_seed("set:0", 2048, "random"));
        assert_ne!(a, condition_seed("set:1", 1024, "random"));
        assert_ne!(a, condition_seed("set:0", 1024, "greedy"));
    }

    #[test]
    fn seed_has_no_concatenation_collisions() {
        // Length prefixes keep (id, policy) boundaries unambiguous.
        assert_ne!(
            condition_seed("ab", 1, "c"),
            condition_seed("a", 1, "bc")
        );
    }

    #[test]
    fn track_round_trips_through_strings() {
        for track in [Track::Privileged, Track::Unprivileged] {
            assert_eq!(track.to_string().parse::<Track>(), Ok(track));
        }
        assert!("both".parse::<Track>().is_err());
    }
}
