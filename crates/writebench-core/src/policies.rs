// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Reference write policies.
//!
//! The evaluator only needs the [`WritePolicy`] seam, but a benchmark
//! nobody can run is not a benchmark; these baselines make the grid
//! runnable out of the box and anchor the metric axes (a greedy floor,
//! an eviction baseline, a merge-aware baseline, a privileged-signal
//! baseline, a random control, and the clairvoyant oracle ceiling).
//!
//! Randomness is a blake3 counter stream over the condition seed, so a
//! randomized policy's decisions are a pure function of the condition
//! identity.

use crate::action::{canonical_delta, MemoryAction, ENDPOINT_KEY};
use crate::canon::to_canonical_string;
use crate::episode::Step;
use crate::estimator::{estimate_delta_bytes, estimate_step_bytes};
use crate::metrics::oracle_set;
use crate::policy::{ConditionContext, PolicyFactory, StoreView, WritePolicy, PRIORITY_KEY};
use crate::store::ItemKind;
use rustc_hash::FxHashMap;
use std::collections::BTreeSet;

/// Deterministic u64 stream derived from a 32-byte seed.
struct SeedStream {
    seed: [u8; 32],
    counter: u64,
}

impl SeedStream {
    fn new(seed: [u8; 32]) -> Self {
        Self { seed, counter: 0 }
    }

    fn next_u64(&mut self) -> u64 {
        let hash = blake3::keyed_hash(&self.seed, &self.counter.to_le_bytes());
        self.counter += 1;
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(&hash.as_bytes()[..8]);
        u64::from_le_bytes(bytes)
    }
}

fn write_if_fits(step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
    if estimate_step_bytes(step) <= store.remaining() {
        vec![MemoryAction::Write { step: step.clone() }]
    } else {
        vec![MemoryAction::Skip]
    }
}

/// Writes every step that fits the remaining budget.
pub struct GreedyPolicy;

impl WritePolicy for GreedyPolicy {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        write_if_fits(step, store)
    }
}

/// Writes every step, expiring the oldest items to make room.
///
/// Eviction is oldest-first by insertion order; a BASE's surviving
/// DELTA children are expired ahead of it so the eviction sequence is
/// accepted as emitted.
pub struct FifoPolicy;

impl WritePolicy for FifoPolicy {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        let cost = estimate_step_bytes(step);
        if cost > store.max_bytes() {
            return vec![MemoryAction::Skip];
        }
        if cost <= store.remaining() {
            return vec![MemoryAction::Write { step: step.clone() }];
        }

        let mut items: Vec<_> = store.iter().collect();
        items.sort_by_key(|i| (i.written_at(), i.t()));

        let mut actions = Vec::new();
        let mut scheduled = BTreeSet::new();
        let mut freed = 0u64;
        'victims: for item in &items {
            if store.remaining() + freed >= cost {
                break;
            }
            if item.t() >= step.t || scheduled.contains(&item.t()) {
                continue;
            }
            let mut children = Vec::new();
            if item.kind() == ItemKind::Base {
                for child in items
                    .iter()
                    .filter(|c| c.merge_parent_t() == Some(item.t()))
                {
                    if scheduled.contains(&child.t()) {
                        continue;
                    }
                    if child.t() >= step.t {
                        // A child we cannot expire pins its base.
                        continue 'victims;
                    }
                    children.push(*child);
                }
            }
            for child in children {
                scheduled.insert(child.t());
                freed += child.byte_cost();
                actions.push(MemoryAction::Expire { target_t: child.t() });
            }
            scheduled.insert(item.t());
            freed += item.byte_cost();
            actions.push(MemoryAction::Expire { target_t: item.t() });
        }

        if store.remaining() + freed >= cost {
            actions.push(MemoryAction::Write { step: step.clone() });
            actions
        } else {
            vec![MemoryAction::Skip]
        }
    }
}

/// Writes the first step per endpoint, merges later ones onto it.
pub struct MergeApiPolicy {
    base_by_endpoint: FxHashMap<String, u64>,
}

impl MergeApiPolicy {
    /// Creates the policy with no known endpoints.
    #[must_use]
    pub fn new() -> Self {
        Self {
            base_by_endpoint: FxHashMap::default(),
        }
    }
}

impl Default for MergeApiPolicy {
    fn default() -> Self {
        Self::new()
    }
}

impl WritePolicy for MergeApiPolicy {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        let Some(endpoint) = step.observation.get(ENDPOINT_KEY) else {
            return write_if_fits(step, store);
        };
        let key = to_canonical_string(endpoint);

        if let Some(&base_t) = self.base_by_endpoint.get(&key) {
            if let Some(base) = store.get(base_t).filter(|b| b.kind() == ItemKind::Base) {
                let Some(delta) = canonical_delta(&step.observation, &base.step().observation)
                else {
                    return vec![MemoryAction::Skip];
                };
                if delta.is_empty() {
                    return vec![MemoryAction::Skip];
                }
                if estimate_delta_bytes(&delta) <= store.remaining() {
                    return vec![MemoryAction::Merge {
                        step: step.clone(),
                        target_t: base_t,
                        delta: None,
                    }];
                }
                return vec![MemoryAction::Skip];
            }
            // Base gone (evicted or never accepted): re-establish below.
        }

        if estimate_step_bytes(step) <= store.remaining() {
            self.base_by_endpoint.insert(key, step.t);
            vec![MemoryAction::Write { step: step.clone() }]
        } else {
            vec![MemoryAction::Skip]
        }
    }
}

/// Privileged-track baseline: writes steps whose metadata priority
/// clears a threshold.
pub struct PriorityPolicy {
    threshold: f64,
}

impl PriorityPolicy {
    /// Default priority cutoff.
    pub const DEFAULT_THRESHOLD: f64 = 0.5;

    /// Creates the policy with the given cutoff.
    #[must_use]
    pub fn new(threshold: f64) -> Self {
        Self { threshold }
    }
}

impl WritePolicy for PriorityPolicy {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        let priority = step
            .metadata
            .get(PRIORITY_KEY)
            .and_then(serde_json::Value::as_f64);
        match priority {
            Some(p) if p >= self.threshold => write_if_fits(step, store),
            // Unlabeled or stripped (Unprivileged track): store nothing.
            _ => vec![MemoryAction::Skip],
        }
    }
}

/// Random control: an even coin per step from the condition seed.
pub struct RandomPolicy {
    stream: SeedStream,
}

impl RandomPolicy {
    /// Creates the policy from a condition seed.
    #[must_use]
    pub fn new(seed: [u8; 32]) -> Self {
        Self {
            stream: SeedStream::new(seed),
        }
    }
}

impl WritePolicy for RandomPolicy {
    fn select(&mut self, step: &Step, store: &StoreView<'_>) -> Vec<MemoryAction> {
        // Draw unconditionally so the decision sequence is a pure
        // function of the seed, not of earlier acceptances.
        let heads = self.stream.next_u64() & 1 == 1;
        if heads {
            write_if_fits(step, store)
        } else {
            vec![MemoryAction::Skip]
        }
    }
}

/// Clairvoyant ceiling: writes exactly the knapsack-optimal subset.
///
/// Built from the whole episode up front; online policies cannot use
/// this information, which is the point of the comparison.
pub struct OraclePolicy {
    chosen: BTreeSet<u64>,
}

impl OraclePolicy {
    /// Precomputes the optimal subset for one condition.
    #[must_use]
    pub fn new(ctx: &ConditionContext<'_>) -> Self {
        Self {
            chosen: oracle_set(ctx.episode, ctx.budget),
        }
    }
}

impl WritePolicy for OraclePolicy {
    fn select(&mut self, step: &Step, _store: &StoreView<'_>) -> Vec<MemoryAction> {
        if self.chosen.contains(&step.t) {
            vec![MemoryAction::Write { step: step.clone() }]
        } else {
            vec![MemoryAction::Skip]
        }
    }
}

struct GreedyFactory;

impl PolicyFactory for GreedyFactory {
    fn id(&self) -> &str {
        "greedy"
    }

    fn build(&self, _ctx: &ConditionContext<'_>) -> Box<dyn WritePolicy> {
        Box::new(GreedyPolicy)
    }
}

struct FifoFactory;

impl PolicyFactory for FifoFactory {
    fn id(&self) -> &str {
        "fifo"
    }

    fn build(&self, _ctx: &ConditionContext<'_>) -> Box<dyn WritePolicy> {
        Box::new(FifoPolicy)
    }
}

struct MergeApiFactory;

impl PolicyFactory for MergeApiFactory {
    fn id(&self) -> &str {
        "merge-api"
    }

    fn build(&self, _ctx: &ConditionContext<'_>) -> Box<dyn WritePolicy> {
        Box::new(MergeApiPolicy::new())
    }
}

struct PriorityFactory;

impl PolicyFactory for PriorityFactory {
    fn id(&self) -> &str {
        "priority"
    }

    fn build(&self, _ctx: &ConditionContext<'_>) -> Box<dyn WritePolicy> {
        Box::new(PriorityPolicy::new(PriorityPolicy::DEFAULT_THRESHOLD))
    }
}

struct RandomFactory;

impl PolicyFactory for RandomFactory {
    fn id(&self) -> &str {
        "random"
    }

    fn build(&self, ctx: &ConditionContext<'_>) -> Box<dyn WritePolicy> {
        Box::new(RandomPolicy::new(ctx.seed))
    }
}

struct OracleFactory;

impl PolicyFactory for OracleFactory {
    fn id(&self) -> &str {
        "oracle"
    }

    fn build(&self, ctx: &ConditionContext<'_>) -> Box<dyn WritePolicy> {
        Box::new(OraclePolicy::new(ctx))
    }
}

/// Name-indexed collection of policy factories.
pub struct PolicyRegistry {
    factories: Vec<Box<dyn PolicyFactory>>,
}

impl PolicyRegistry {
    /// All built-in baselines.
    #[must_use]
    pub fn builtin() -> Self {
        Self {
            factories: vec![
                Box::new(GreedyFactory),
                Box::new(FifoFactory),
                Box::new(MergeApiFactory),
                Box::new(PriorityFactory),
                Box::new(RandomFactory),
                Box::new(OracleFactory),
            ],
        }
    }

    /// The factory registered under `id`, if any.
    #[must_use]
    pub fn get(&self, id: &str) -> Option<&dyn PolicyFactory> {
        self.factories
            .iter()
            .find(|f| f.id() == id)
            .map(|f| &**f)
    }

    /// Registered ids in registration order.
    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.factories.iter().map(|f| f.id())
    }
}
