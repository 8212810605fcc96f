// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Metric engine: scores final memory contents against episode labels.
//!
//! Every metric is a pure function of the final store, the episode, and
//! the action counters. Undefined denominators resolve to the fixed
//! conventions documented on [`MetricRecord`]; nothing here ever fails.
//!
//! The regret reference U*(B) is the WRITE-only oracle: the best
//! utility any subset of episode steps can reach under the byte budget,
//! found by 0/1 knapsack over `estimate_step_bytes`. MERGE-enabled
//! policies may legitimately beat it, hence the clamp to zero.

use crate::episode::Episode;
use crate::estimator::estimate_step_bytes;
use crate::store::{ItemKind, MemoryStore};
use serde::Serialize;
use std::collections::BTreeSet;

/// Counts of successfully applied actions plus rejections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ActionCounters {
    /// Successful WRITE applications.
    pub writes: u64,
    /// Successful MERGE applications.
    pub merges: u64,
    /// Successful EXPIRE applications.
    pub expires: u64,
    /// SKIP actions (always succeed).
    pub skips: u64,
    /// Rejected actions of any kind.
    pub rejections: u64,
}

/// One scored condition.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct MetricRecord {
    /// |W ∩ R| / |R|; when |R| = 0: 1.0 if W is empty, else 0.0.
    pub recall: f64,
    /// |W ∩ R| / |W|; when |W| = 0: 1.0 if |R| = 0, else 0.0.
    pub precision: f64,
    /// Harmonic mean of precision and recall; 0 when either is 0.
    pub f1: f64,
    /// utility(W) / (bytes_used / 1024); 0 when no bytes are used.
    pub utility_per_kb: f64,
    /// max(0, U*(B) − utility(W)).
    pub regret: f64,
    /// Mean of (last_step_t − t) over W; 0 when W is empty.
    pub avg_staleness: f64,
    /// |W ∩ critical_steps| / total_drift_events; 0 when no events.
    pub drift_coverage: f64,
    /// Successful expires per successful write (denominator floor 1).
    pub expire_rate: f64,
    /// bytes_used / max_bytes; 0 when the budget is 0.
    pub utilization: f64,
    /// |W| / |episode.steps|; 0 for an empty episode.
    pub write_density: f64,
    /// Bytes resident at end of episode.
    pub bytes_used: u64,
}

/// Timesteps counted as "in memory" for scoring.
///
/// BASE items always count. A DELTA counts iff its parent BASE is still
/// present with matching endpoint identity; under the store invariants
/// that is equivalent to the DELTA being present at all, but the check
/// is made explicitly so scoring never leans on upstream state.
#[must_use]
pub fn retained_set(store: &MemoryStore) -> BTreeSet<u64> {
    let mut retained = BTreeSet::new();
    for item in store.items() {
        match item.kind() {
            ItemKind::Base => {
                retained.insert(item.t());
            }
            ItemKind::Delta => {
                let parent_ok = item.merge_parent_t().is_some_and(|parent_t| {
                    store.get(parent_t).is_some_and(|parent| {
                        parent.kind() == ItemKind::Base
                            && parent.step().observation.get(crate::action::ENDPOINT_KEY)
                                == item.step().observation.get(crate::action::ENDPOINT_KEY)
                    })
                });
                if parent_ok {
                    retained.insert(item.t());
                }
            }
        }
    }
    retained
}

/// Total labeled utility of a retained set.
#[must_use]
pub fn utility_of(retained: &BTreeSet<u64>, episode: &Episode) -> f64 {
    retained.iter().map(|&t| episode.labels.utility_at(t)).sum()
}

/// The WRITE-only oracle utility U*(B): 0/1 knapsack over all episode
/// steps with weight `estimate_step_bytes` and value `utility_at`.
#[must_use]
pub fn oracle_utility(episode: &Episode, max_bytes: u64) -> f64 {
    knapsack(episode, max_bytes).0
}

/// The step set realizing U*(B). Ties break deterministically (the DP
/// prefers not taking an item when taking it gains nothing).
#[must_use]
pub fn oracle_set(episode: &Episode, max_bytes: u64) -> BTreeSet<u64> {
    knapsack(episode, max_bytes).1
}

fn knapsack(episode: &Episode, max_bytes: u64) -> (f64, BTreeSet<u64>) {
    // Zero-utility steps can never improve the optimum; skip them so the
    // DP capacity is bounded by the bytes of steps that matter.
    let items: Vec<(u64, u64, f64)> = episode
        .steps
        .iter()
        .map(|s| (s.t, estimate_step_bytes(s), episode.labels.utility_at(s.t)))
        .filter(|&(_, _, u)| u > 0.0)
        .collect();
    let total_weight: u64 = items.iter().map(|&(_, w, _)| w).sum();
    let cap = usize::try_from(max_bytes.min(total_weight)).unwrap_or(usize::MAX);

    let mut best = vec![0.0f64; cap + 1];
    let mut taken = vec![vec![false; cap + 1]; items.len()];
    for (i, &(_, weight, utility)) in items.iter().enumerate() {
        let Ok(weight) = usize::try_from(weight) else {
            continue;
        };
        if weight > cap {
            continue;
        }
        // Classic descending-capacity sweep so each item is used once.
        for c in (weight..=cap).rev() {
            let candidate = best[c - weight] + utility;
            if candidate > best[c] {
                best[c] = candidate;
                taken[i][c] = true;
            }
        }
    }

    let mut chosen = BTreeSet::new();
    let mut c = cap;
    for (i, &(t, weight, _)) in items.iter().enumerate().rev() {
        if taken[i][c] {
            chosen.insert(t);
            c -= weight as usize;
        }
    }
    (best[cap], chosen)
}

/// Computes the full metric record for one finished condition.
#[must_use]
pub fn compute_metrics(
    episode: &Episode,
    store: &MemoryStore,
    counters: &ActionCounters,
) -> MetricRecord {
    let retained = retained_set(store);
    let critical = &episode.labels.critical_steps;
    let hits = retained.intersection(critical).count() as f64;
    let w = retained.len() as f64;
    let r = critical.len() as f64;

    let recall = if critical.is_empty() {
        if retained.is_empty() {
            1.0
        } else {
            0.0
        }
    } else {
        hits / r
    };
    let precision = if retained.is_empty() {
        if critical.is_empty() {
            1.0
        } else {
            0.0
        }
    } else {
        hits / w
    };
    let f1 = if precision == 0.0 || recall == 0.0 {
        0.0
    } else {
        2.0 * precision * recall / (precision + recall)
    };

    let utility = utility_of(&retained, episode);
    let bytes_used = store.bytes_used();
    let utility_per_kb = if bytes_used == 0 {
        0.0
    } else {
        utility / (bytes_used as f64 / 1024.0)
    };
    let regret = (oracle_utility(episode, store.max_bytes()) - utility).max(0.0);

    let last_t = episode.last_t().unwrap_or(0);
    let avg_staleness = if retained.is_empty() {
        0.0
    } else {
        retained.iter().map(|&t| (last_t - t) as f64).sum::<f64>() / w
    };

    let drift_coverage = if episode.labels.total_drift_events == 0 {
        0.0
    } else {
        hits / episode.labels.total_drift_events as f64
    };

    let expire_rate = counters.expires as f64 / counters.writes.max(1) as f64;
    let utilization = if store.max_bytes() == 0 {
        0.0
    } else {
        bytes_used as f64 / store.max_bytes() as f64
    };
    let write_density = if episode.steps.is_empty() {
        0.0
    } else {
        w / episode.steps.len() as f64
    };

    MetricRecord {
        recall,
        precision,
        f1,
        utility_per_kb,
        regret,
        avg_staleness,
        drift_coverage,
        expire_rate,
        utilization,
        write_density,
        bytes_used,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::MemoryAction;
    use crate::episode::{EpisodeId, Labels, Step};
    use serde_json::{json, Map};
    use std::collections::BTreeMap;

    fn step(t: u64) -> Step {
        Step {
            t,
            observation: json!({"api": "x", "v": t}),
            metadata: Map::new(),
        }
    }

    fn episode(ts: &[u64], critical: &[u64], utilities: &[(u64, f64)]) -> Episode {
        Episode {
            id: EpisodeId::new("m", 0),
            steps: ts.iter().map(|&t| step(t)).collect(),
            labels: Labels {
                critical_steps: critical.iter().copied().collect(),
                total_drift_events: critical.len() as u64,
                per_step_utility: if utilities.is_empty() {
                    None
                } else {
                    Some(utilities.iter().copied().collect::<BTreeMap<_, _>>())
                },
            },
        }
    }

    fn store_with(ts: &[u64], budget: u64) -> MemoryStore {
        let mut store = MemoryStore::new(budget);
        for &t in ts {
            store.begin_step(t);
            assert!(store.apply(&MemoryAction::Write { step: step(t) }));
        }
        store
    }

    #[test]
    fn recall_precision_f1_basic() {
        let ep = episode(&[0, 1, 2, 3], &[1, 2], &[]);
        let store = store_with(&[1, 3], 10 * 1024);
        let m = compute_metrics(&ep, &store, &ActionCounters::default());
        assert!((m.recall - 0.5).abs() < 1e-12);
        assert!((m.precision - 0.5).abs() < 1e-12);
        assert!((m.f1 - 0.5).abs() < 1e-12);
        assert!((m.write_density - 0.5).abs() < 1e-12);
    }

    #[test]
    fn empty_denominator_conventions() {
        // No critical steps, empty store: recall and precision 1.0.
        let ep = episode(&[0, 1], &[], &[]);
        let store = MemoryStore::new(1024);
        let m = compute_metrics(&ep, &store, &ActionCounters::default());
        assert!((m.recall - 1.0).abs() < 1e-12);
        assert!((m.precision - 1.0).abs() < 1e-12);
        assert!((m.f1 - 1.0).abs() < 1e-12);
    }

    #[test]
    fn staleness_measures_distance_from_last_step() {
        let ep = episode(&[0, 2, 10], &[], &[]);
        let store = store_with(&[0, 2], 10 * 1024);
        let m = compute_metrics(&ep, &store, &ActionCounters::default());
        // (10-0 + 10-2) / 2 = 9
        assert!((m.avg_staleness - 9.0).abs() < 1e-12);
    }

    #[test]
    fn oracle_picks_best_subset_under_budget() {
        let ep = episode(&[0, 1, 2], &[], &[(0, 5.0), (1, 4.0), (2, 3.0)]);
        let w: Vec<u64> = ep.steps.iter().map(estimate_step_bytes).collect();
        // Budget for exactly two items: the best pair is {0, 1}.
        let budget = w[0] + w[1];
        assert!((oracle_utility(&ep, budget) - 9.0).abs() < 1e-12);
        assert_eq!(oracle_set(&ep, budget), [0u64, 1].into_iter().collect());
        // Budget for everything.
        let all: u64 = w.iter().sum();
        assert!((oracle_utility(&ep, all) - 12.0).abs() < 1e-12);
        // Budget for nothing.
        assert_eq!(oracle_utility(&ep, 0), 0.0);
    }

    #[test]
    fn regret_is_clamped_non_negative() {
        let ep = episode(&[0, 1], &[], &[(0, 2.0), (1, 2.0)]);
        let store = store_with(&[0, 1], 10 * 1024);
        let m = compute_metrics(&ep, &store, &ActionCounters::default());
        // Store retains everything the oracle could: regret exactly 0.
        assert_eq!(m.regret, 0.0);
    }

    #[test]
    fn expire_rate_floors_denominator() {
        let ep = episode(&[0], &[], &[]);
        let store = MemoryStore::new(1024);
        let counters = ActionCounters {
            expires: 3,
            ..Default::default()
        };
        let m = compute_metrics(&ep, &store, &counters);
        assert!((m.expire_rate - 3.0).abs() < 1e-12);
    }

    #[test]
    fn zero_budget_utilization_is_zero() {
        let ep = episode(&[0], &[], &[]);
        let store = MemoryStore::new(0);
        let m = compute_metrics(&ep, &store, &ActionCounters::default());
        assert_eq!(m.utilization, 0.0);
        assert_eq!(m.utility_per_kb, 0.0);
    }

    #[test]
    fn retained_set_counts_deltas_with_live_parents() {
        let mut store = MemoryStore::new(10 * 1024);
        store.begin_step(0);
        assert!(store.apply(&MemoryAction::Write { step: step(0) }));
        store.begin_step(1);
        assert!(store.apply(&MemoryAction::Merge {
            step: step(1),
            target_t: 0,
            delta: None,
        }));
        assert_eq!(retained_set(&store), [0u64, 1].into_iter().collect());
    }
}
