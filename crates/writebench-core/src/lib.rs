// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! writebench-core: byte-accurate evaluation of memory write policies.
//!
//! A write policy watches a stream of observations under a strict byte
//! budget and decides, step by step, what enters memory (WRITE), what
//! gets delta-updated (MERGE), what leaves (EXPIRE), and what is simply
//! dropped (SKIP). This crate isolates that decision loop as an
//! evaluation target: a budget-tracked [`MemoryStore`] with dense merge
//! invariants, a [`WritePolicy`] seam the evaluator knows nothing
//! beyond, and a [`metrics`] engine that scores the surviving items
//! against frozen ground-truth labels.
//!
//! Determinism is the load-bearing property throughout: byte costs are
//! defined over a canonical encoding, randomized policies are seeded
//! from the condition identity, and two runs over a frozen episode set
//! produce byte-identical results tables.
#![forbid(unsafe_code)]
#![deny(missing_docs, rust_2018_idioms, unused_must_use)]
#![deny(
    clippy::all,
    clippy::pedantic,
    clippy::nursery,
    clippy::cargo,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::panic,
    clippy::todo,
    clippy::unimplemented,
    clippy::dbg_macro,
    clippy::print_stdout,
    clippy::print_stderr
)]
#![allow(
    clippy::must_use_candidate,
    clippy::return_self_not_must_use,
    clippy::unreadable_literal,
    clippy::missing_const_for_fn,
    clippy::redundant_pub_crate,
    clippy::module_name_repetitions,
    clippy::use_self,
    clippy::cast_precision_loss,
    clippy::cast_possible_truncation
)]

/// Canonical JSON writer the byte costs are defined over.
pub mod canon;

mod action;
mod driver;
mod episode;
mod estimator;
mod manifest;
mod metrics;
mod policies;
mod policy;
mod report;
/// Episode stream codec (line-delimited canonical JSON).
pub mod stream;
mod store;

// Re-exports for stable public API
/// Action variants, kind tags, and canonical delta computation.
pub use action::{canonical_delta, ActionKind, MemoryAction, ENDPOINT_KEY};
/// Evaluator driver: per-condition runs and the full grid.
pub use driver::{
    run_condition, run_grid, ActionLogEntry, ConditionOutcome, ConditionReport, EvalError,
    EvalOptions,
};
/// Episode data model.
pub use episode::{Episode, EpisodeError, EpisodeId, Labels, Step};
/// Deterministic byte cost estimation.
pub use estimator::{
    estimate_delta_bytes, estimate_step_bytes, MERGE_OVERHEAD_BYTES, STEP_HEADER_BYTES,
};
/// Frozen manifest loading and verification.
pub use manifest::{file_digest, Manifest, ManifestEntry, ManifestError};
/// Metric engine over final store contents.
pub use metrics::{
    compute_metrics, oracle_set, oracle_utility, retained_set, utility_of, ActionCounters,
    MetricRecord,
};
/// Reference policy implementations and the name registry.
pub use policies::{
    FifoPolicy, GreedyPolicy, MergeApiPolicy, OraclePolicy, PolicyRegistry, PriorityPolicy,
    RandomPolicy,
};
/// The policy seam: trait, store view, tracks, seeding.
pub use policy::{
    condition_seed, redact_step, ConditionContext, PolicyFactory, StoreView, Track, WritePolicy,
    PRIORITY_KEY, UNPRIVILEGED_METADATA_KEYS,
};
/// Results table rendering.
pub use report::{render_csv, ResultRow, RESULTS_HEADER};
/// Memory store, items, rejection reasons, and corruption errors.
pub use store::{ItemKind, MemoryItem, MemoryStore, RejectReason, StoreError};
