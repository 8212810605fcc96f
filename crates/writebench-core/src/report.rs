// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! Results table rendering.
//!
//! One CSV row per condition, fixed column order, floats formatted with
//! six fractional digits. Rust's float formatting is locale-independent
//! and (via ryu-backed shortest round-trip parsing on the way in) is
//! stable across platforms, which is what makes two runs over a frozen
//! episode set byte-identical.

use crate::driver::ConditionOutcome;
use crate::metrics::{ActionCounters, MetricRecord};
use crate::policy::Track;
use std::fmt::Write as _;

/// Fixed CSV header.
pub const RESULTS_HEADER: &str = "episode,budget,policy,track,recall,precision,f1,\
utility_per_kb,regret,avg_staleness,drift_coverage,expire_rate,utilization,\
write_density,bytes_used,writes,merges,expires,skips,rejections";

/// One row of the results table.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultRow {
    /// Episode id.
    pub episode: String,
    /// Byte budget.
    pub budget: u64,
    /// Policy id.
    pub policy: String,
    /// Track the policy ran under.
    pub track: Track,
    /// Scored metrics.
    pub metrics: MetricRecord,
    /// Action counters.
    pub counters: ActionCounters,
}

impl From<&ConditionOutcome> for ResultRow {
    fn from(outcome: &ConditionOutcome) -> Self {
        Self {
            episode: outcome.episode_id.clone(),
            budget: outcome.budget,
            policy: outcome.policy_id.clone(),
            track: outcome.track,
            metrics: outcome.report.metrics,
            counters: outcome.report.counters,
        }
    }
}

impl ResultRow {
    /// Renders the row as one CSV line (no trailing newline).
    #[must_use]
    pub fn to_csv_line(&self) -> String {
        let m = &self.metrics;
        let c = &self.counters;
        let mut line = String::new();
        let _ = write!(
            line,
            "{},{},{},{},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{:.6},{},{},{},{},{},{}",
            self.episode,
            self.budget,
            self.policy,
            self.track,
            m.recall,
            m.precision,
            m.f1,
            m.utility_per_kb,
            m.regret,
            m.avg_staleness,
            m.drift_coverage,
            m.expire_rate,
            m.utilization,
            m.write_density,
            m.bytes_used,
            c.writes,
            c.merges,
            c.expires,
            c.skips,
            c.rejections,
        );
        line
    }
}

/// Renders the full table: header plus one line per row, each
/// newline-terminated.
#[must_use]
pub fn render_csv(rows: &[ResultRow]) -> String {
    let mut out = String::with_capacity((rows.len() + 1) * 128);
    out.push_str(RESULTS_HEADER);
    out.push('\n');
    for row in rows {
        out.push_str(&row.to_csv_line());
        out.push('\n');
    }
    out
}
