// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Evaluator driver: runs policies over the (episode × budget × track)
//! grid.
//!
//! Each condition gets a fresh store and a fresh policy instance; the
//! per-step protocol is: advance the store, redact the step for the
//! track, ask the policy, apply the returned actions in emission order.
//! Rejections are counted and the policy keeps going; an integrity
//! failure after a successful application is an implementation bug and
//! aborts the run.
//!
//! Conditions are independent (no shared mutable state), so the grid is
//! embarrassingly parallel; this driver runs it sequentially and leaves
//! distribution to callers.

use crate::action::ActionKind;
use crate::episode::Episode;
use crate::metrics::{compute_metrics, ActionCounters, MetricRecord};
use crate::policies::PolicyRegistry;
use crate::policy::{condition_seed, redact_step, ConditionContext, PolicyFactory, StoreView, Track};
use crate::store::{MemoryStore, RejectReason, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;

/// One applied-or-rejected action, for the exported action log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ActionLogEntry {
    /// Timestep at which the action was emitted.
    pub t: u64,
    /// The action's kind.
    pub action: ActionKind,
    /// Whether the store accepted it.
    pub accepted: bool,
    /// Rejection detail when not accepted.
    #[serde(flatten)]
    pub rejection: Option<RejectReason>,
}

/// Driver knobs.
#[derive(Debug, Clone, Copy, Default)]
pub struct EvalOptions {
    /// Record a per-action log entry (off by default; the log is large
    /// relative to the metrics).
    pub record_actions: bool,
}

/// Fatal evaluation failures. Action rejections are not among them.
#[derive(Debug, Error)]
pub enum EvalError {
    /// The store failed a post-apply integrity check.
    #[error(transparent)]
    Store(#[from] StoreError),
    /// A requested policy id is not registered.
    #[error("[WB_UNKNOWN_POLICY] no such policy: {0}")]
    UnknownPolicy(String),
}

/// Everything produced by one condition.
#[derive(Debug, Clone)]
pub struct ConditionReport {
    /// Scored metrics over the final store.
    pub metrics: MetricRecord,
    /// Applied-action and rejection counts.
    pub counters: ActionCounters,
    /// Per-action log; empty unless requested.
    pub action_log: Vec<ActionLogEntry>,
}

/// A condition identity plus its report.
#[derive(Debug, Clone)]
pub struct ConditionOutcome {
    /// Episode id.
    pub episode_id: String,
    /// Byte budget.
    pub budget: u64,
    /// Policy id.
    pub policy_id: String,
    /// Track the policy ran under.
    pub track: Track,
    /// The condition's report.
    pub report: ConditionReport,
}

/// Runs one (episode, budget, policy, track) condition.
pub fn run_condition(
    episode: &Episode,
    budget: u64,
    factory: &dyn PolicyFactory,
    track: Track,
    options: EvalOptions,
) -> Result<ConditionReport, EvalError> {
    let seed = condition_seed(episode.id.as_str(), budget, factory.id());
    let ctx = ConditionContext {
        episode,
        budget,
        track,
        seed,
    };
    let mut policy = factory.build(&ctx);
    let mut store = MemoryStore::new(budget);
    let mut counters = ActionCounters::default();
    let mut action_log = Vec::new();

    debug!(
        episode = %episode.id,
        budget,
        policy = factory.id(),
        %track,
        "condition start"
    );

    for step in &episode.steps {
        store.begin_step(step.t);
        let visible = redact_step(step, track);
        let actions = policy.select(&visible, &StoreView::new(&store));
        for action in actions {
            match store.apply_checked(&action) {
                Ok(kind) => {
                    match kind {
                        ActionKind::Skip => counters.skips += 1,
                        ActionKind::Write => counters.writes += 1,
                        ActionKind::Merge => counters.merges += 1,
                        ActionKind::Expire => counters.expires += 1,
                    }
                    store.verify_integrity()?;
                    if options.record_actions {
                        action_log.push(ActionLogEntry {
                            t: step.t,
                            action: kind,
                            accepted: true,
                            rejection: None,
                        });
                    }
                }
                Err(reason) => {
                    counters.rejections += 1;
                    if options.record_actions {
                        action_log.push(ActionLogEntry {
                            t: step.t,
                            action: action.kind(),
                            accepted: false,
                            rejection: Some(reason),
                        });
                    }
                }
            }
        }
    }

    let metrics = compute_metrics(episode, &store, &counters);
    Ok(ConditionReport {
        metrics,
        counters,
        action_log,
    })
}

/// Runs the full grid in a pinned order: episodes outermost, then
/// budgets, then policies, then tracks. The order is part of the
/// deterministic-output contract.
pub fn run_grid(
    episodes: &[Episode],
    budgets: &[u64],
    policy_ids: &[String],
    tracks: &[Track],
    registry: &PolicyRegistry,
    options: EvalOptions,
) -> Result<Vec<ConditionOutcome>, EvalError> {
    // Resolve every policy up front so an unknown id fails before any
    // work is done.
    let mut factories = Vec::with_capacity(policy_ids.len());
    for id in policy_ids {
        factories.push(
            registry
                .get(id)
                .ok_or_else(|| EvalError::UnknownPolicy(id.clone()))?,
        );
    }

    let mut outcomes = Vec::new();
    for episode in episodes {
        for &budget in budgets {
            for factory in &factories {
                for &track in tracks {
                    let report = run_condition(episode, budget, *factory, track, options)?;
                    outcomes.push(ConditionOutcome {
                        episode_id: episode.id.as_str().to_owned(),
                        budget,
                        policy_id: factory.id().to_owned(),
                        track,
                        report,
                    });
                }
            }
        }
    }
    Ok(outcomes)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::episode::{EpisodeId, Labels, Step};
    use serde_json::{json, Map};
    use std::collections::BTreeSet;

    fn episode(n: u64) -> Episode {
        Episode {
            id: EpisodeId::new("d", 0),
            steps: (0..n)
                .map(|t| Step {
                    t,
                    observation: json!({"api": "x", "v": t}),
                    metadata: Map::new(),
                })
                .collect(),
            labels: Labels {
                critical_steps: BTreeSet::from([0]),
                total_drift_events: 1,
                per_step_utility: None,
            },
        }
    }

    #[test]
    fn greedy_condition_counts_writes() {
        let ep = episode(4);
        let registry = PolicyRegistry::builtin();
        let factory = registry.get("greedy").unwrap();
        let report = run_condition(
            &ep,
            1024 * 1024,
            factory,
            Track::Unprivileged,
            EvalOptions::default(),
        )
        .unwrap();
        assert_eq!(report.counters.writes, 4);
        assert_eq!(report.counters.rejections, 0);
        assert!((report.metrics.recall - 1.0).abs() < 1e-12);
    }

    #[test]
    fn zero_budget_counts_rejections() {
        let ep = episode(3);
        let registry = PolicyRegistry::builtin();
        let factory = registry.get("greedy").unwrap();
        let report = run_condition(
            &ep,
            0,
            factory,
            Track::Unprivileged,
            EvalOptions::default(),
        )
        .unwrap();
        // Greedy skips when nothing fits rather than emitting doomed
        // writes, so skips are counted, not rejections.
        assert_eq!(report.counters.writes, 0);
        assert_eq!(report.counters.skips, 3);
        assert_eq!(report.metrics.bytes_used, 0);
    }

    #[test]
    fn action_log_records_rejections() {
        struct StubbornWriter;
        impl crate::policy::WritePolicy for StubbornWriter {
            fn select(
                &mut self,
                step: &Step,
                _store: &StoreView<'_>,
            ) -> Vec<crate::action::MemoryAction> {
                vec![crate::action::MemoryAction::Write { step: step.clone() }]
            }
        }
        struct StubbornFactory;
        impl PolicyFactory for StubbornFactory {
            fn id(&self) -> &str {
                "stubborn"
            }
            fn build(&self, _ctx: &ConditionContext<'_>) -> Box<dyn crate::policy::WritePolicy> {
                Box::new(StubbornWriter)
            }
        }

        let ep = episode(2);
        let report = run_condition(
            &ep,
            0,
            &StubbornFactory,
            Track::Unprivileged,
            EvalOptions {
                record_actions: true,
            },
        )
        .unwrap();
        assert_eq!(report.counters.rejections, 2);
        assert_eq!(report.action_log.len(), 2);
        assert!(!report.action_log[0].accepted);
        assert!(matches!(
            report.action_log[0].rejection,
            Some(RejectReason::InsufficientBudget { .. })
        ));
    }

    #[test]
    fn grid_order_is_pinned() {
        let eps = vec![episode(2)];
        let registry = PolicyRegistry::builtin();
        let outcomes = run_grid(
            &eps,
            &[1024, 2048],
            &["greedy".to_owned(), "fifo".to_owned()],
            &[Track::Privileged, Track::Unprivileged],
            &registry,
            EvalOptions::default(),
        )
        .unwrap();
        let keys: Vec<(u64, &str, Track)> = outcomes
            .iter()
            .map(|o| (o.budget, o.policy_id.as_str(), o.track))
            .collect();
        assert_eq!(
            keys,
            vec![
                (1024, "greedy", Track::Privileged),
                (1024, "greedy", Track::Unprivileged),
                (1024, "fifo", Track::Privileged),
                (1024, "fifo", Track::Unprivileged),
                (2048, "greedy", Track::Privileged),
                (2048, "greedy", Track::Unprivileged),
                (2048, "fifo", Track::Privileged),
                (2048, "fifo", Track::Unprivileged),
            ]
        );
    }

    #[test]
    fn unknown_policy_fails_before_running() {
        let eps = vec![episode(1)];
        let registry = PolicyRegistry::builtin();
        let err = run_grid(
            &eps,
            &[1024],
            &["nope".to_owned()],
            &[Track::Unprivileged],
            &registry,
            EvalOptions::default(),
        )
        .unwrap_err();
        assert!(matches!(err, EvalError::UnknownPolicy(_)));
    }
}
