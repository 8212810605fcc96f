// SPDX-License-Identifier: Apache-2.0
// © James Ross Ω FLYING•ROBOTS <https://github.com/flyingrobots>
//! `writebench`: run the write-policy benchmark over a frozen episode
//! manifest, verify a manifest, or inspect its episode sets.

use anyhow::{bail, Context, Result};
use clap::{ArgAction, Args, Parser, Subcommand, ValueEnum};
use comfy_table::Table;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use tracing::info;
use writebench_core::{
    estimate_step_bytes, render_csv, run_grid, ConditionOutcome, Episode, EvalOptions, Manifest,
    PolicyRegistry, ResultRow, Track,
};

/// Default budget grid in bytes: 1 KiB to 1 MiB by decades.
const DEFAULT_BUDGETS: [u64; 4] = [1024, 10240, 102400, 1048576];

#[derive(Parser)]
#[command(
    name = "writebench",
    version,
    about = "Write-policy benchmark: run, verify, inspect"
)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the evaluator grid and write the results table.
    Run(RunArgs),
    /// Check every manifest entry: hash, parse, record count.
    Verify(VerifyArgs),
    /// Summarize the episode sets in a manifest.
    Inspect(InspectArgs),
}

#[derive(Args)]
struct RunArgs {
    /// Path to the frozen episode manifest.
    #[arg(long)]
    manifest: PathBuf,

    /// Episode sets to run (repeatable). Defaults to every set.
    #[arg(long = "set")]
    sets: Vec<String>,

    /// Budget grid in bytes.
    #[arg(long, value_delimiter = ',', default_values_t = DEFAULT_BUDGETS)]
    budgets: Vec<u64>,

    /// Policies to evaluate. Defaults to every built-in.
    #[arg(long, value_delimiter = ',')]
    policies: Vec<String>,

    /// Track(s) to evaluate policies under.
    #[arg(long, value_enum, default_value_t = TrackArg::Both)]
    track: TrackArg,

    /// Results CSV output path.
    #[arg(long)]
    out: PathBuf,

    /// Directory for per-condition JSONL action logs.
    #[arg(long)]
    action_log: Option<PathBuf>,
}

#[derive(Args)]
struct VerifyArgs {
    /// Path to the frozen episode manifest.
    #[arg(long)]
    manifest: PathBuf,
}

#[derive(Args)]
struct InspectArgs {
    /// Path to the frozen episode manifest.
    #[arg(long)]
    manifest: PathBuf,

    /// Episode sets to inspect (repeatable). Defaults to every set.
    #[arg(long = "set")]
    sets: Vec<String>,
}

#[derive(Clone, Copy, PartialEq, Eq, ValueEnum)]
enum TrackArg {
    Privileged,
    Unprivileged,
    Both,
}

impl TrackArg {
    fn tracks(self) -> Vec<Track> {
        match self {
            Self::Privileged => vec![Track::Privileged],
            Self::Unprivileged => vec![Track::Unprivileged],
            Self::Both => vec![Track::Privileged, Track::Unprivileged],
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match cli.command {
        Command::Run(args) => run(&args),
        Command::Verify(args) => verify(&args),
        Command::Inspect(args) => inspect(&args),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn selected_sets(manifest: &Manifest, requested: &[String]) -> Result<Vec<String>> {
    if requested.is_empty() {
        return Ok(manifest.set_names().map(str::to_owned).collect());
    }
    for set in requested {
        if manifest.entry(set).is_none() {
            bail!("no such episode set in manifest: {set}");
        }
    }
    Ok(requested.to_vec())
}

fn run(args: &RunArgs) -> Result<()> {
    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;
    let sets = selected_sets(&manifest, &args.sets)?;

    let registry = PolicyRegistry::builtin();
    let policies: Vec<String> = if args.policies.is_empty() {
        registry.ids().map(str::to_owned).collect()
    } else {
        args.policies.clone()
    };
    let tracks = args.track.tracks();
    let options = EvalOptions {
        record_actions: args.action_log.is_some(),
    };

    let mut rows: Vec<ResultRow> = Vec::new();
    for set in &sets {
        let episodes = manifest
            .load_set(set)
            .with_context(|| format!("loading episode set {set}"))?;
        info!(%set, episodes = episodes.len(), "set loaded");
        let outcomes = run_grid(
            &episodes,
            &args.budgets,
            &policies,
            &tracks,
            &registry,
            options,
        )?;
        if let Some(dir) = &args.action_log {
            export_action_logs(dir, &outcomes)?;
        }
        rows.extend(outcomes.iter().map(ResultRow::from));
    }

    std::fs::write(&args.out, render_csv(&rows))
        .with_context(|| format!("writing results to {}", args.out.display()))?;
    info!(rows = rows.len(), out = %args.out.display(), "results written");

    print_summary(&rows)?;
    Ok(())
}

fn export_action_logs(dir: &Path, outcomes: &[ConditionOutcome]) -> Result<()> {
    std::fs::create_dir_all(dir)
        .with_context(|| format!("creating action log dir {}", dir.display()))?;
    for outcome in outcomes {
        let name = format!(
            "{}-{}-{}-{}.jsonl",
            slug(&outcome.episode_id),
            outcome.budget,
            slug(&outcome.policy_id),
            outcome.track,
        );
        let mut body = String::new();
        for entry in &outcome.report.action_log {
            body.push_str(&serde_json::to_string(entry)?);
            body.push('\n');
        }
        std::fs::write(dir.join(&name), body)
            .with_context(|| format!("writing action log {name}"))?;
    }
    Ok(())
}

fn slug(s: &str) -> String {
    s.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
        .collect()
}

fn print_summary(rows: &[ResultRow]) -> Result<()> {
    let mut table = Table::new();
    table.set_header(vec![
        "policy", "track", "budget", "recall", "f1", "regret", "util/KB", "rejects",
    ]);

    // One summary line per (policy, track, budget), averaged over
    // episodes. Rows arrive grouped by episode, so aggregate first.
    let mut groups: Vec<(String, Track, u64)> = Vec::new();
    for row in rows {
        let key = (row.policy.clone(), row.track, row.budget);
        if !groups.contains(&key) {
            groups.push(key);
        }
    }
    for (policy, track, budget) in groups {
        let members: Vec<&ResultRow> = rows
            .iter()
            .filter(|r| r.policy == policy && r.track == track && r.budget == budget)
            .collect();
        let n = members.len() as f64;
        let mean = |f: &dyn Fn(&ResultRow) -> f64| -> f64 {
            members.iter().map(|r| f(r)).sum::<f64>() / n
        };
        let rejections: u64 = members.iter().map(|r| r.counters.rejections).sum();
        table.add_row(vec![
            policy.clone(),
            track.to_string(),
            budget.to_string(),
            format!("{:.3}", mean(&|r| r.metrics.recall)),
            format!("{:.3}", mean(&|r| r.metrics.f1)),
            format!("{:.3}", mean(&|r| r.metrics.regret)),
            format!("{:.3}", mean(&|r| r.metrics.utility_per_kb)),
            rejections.to_string(),
        ]);
    }

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{table}")?;
    Ok(())
}

fn verify(args: &VerifyArgs) -> Result<()> {
    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;

    let mut table = Table::new();
    table.set_header(vec!["set", "records", "status"]);
    let mut failures = Vec::new();
    for set in manifest.set_names().map(str::to_owned).collect::<Vec<_>>() {
        match manifest.load_set(&set) {
            Ok(episodes) => {
                table.add_row(vec![set.clone(), episodes.len().to_string(), "ok".into()]);
            }
            Err(err) => {
                table.add_row(vec![set.clone(), "-".into(), err.to_string()]);
                failures.push((set, err));
            }
        }
    }

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{table}")?;
    drop(stdout);

    if let Some((set, err)) = failures.into_iter().next() {
        return Err(err).with_context(|| format!("manifest verification failed for set {set}"));
    }
    Ok(())
}

fn inspect(args: &InspectArgs) -> Result<()> {
    let manifest = Manifest::load(&args.manifest)
        .with_context(|| format!("loading manifest {}", args.manifest.display()))?;
    let sets = selected_sets(&manifest, &args.sets)?;

    let mut table = Table::new();
    table.set_header(vec![
        "episode", "steps", "critical", "drift", "est bytes", "utility",
    ]);
    for set in &sets {
        let episodes = manifest
            .load_set(set)
            .with_context(|| format!("loading episode set {set}"))?;
        for episode in &episodes {
            table.add_row(vec![
                episode.id.to_string(),
                episode.steps.len().to_string(),
                episode.labels.critical_steps.len().to_string(),
                episode.labels.total_drift_events.to_string(),
                total_step_bytes(episode).to_string(),
                format!("{:.3}", total_utility(episode)),
            ]);
        }
    }

    let mut stdout = std::io::stdout().lock();
    writeln!(stdout, "{table}")?;
    Ok(())
}

fn total_step_bytes(episode: &Episode) -> u64 {
    episode.steps.iter().map(estimate_step_bytes).sum()
}

fn total_utility(episode: &Episode) -> f64 {
    episode
        .steps
        .iter()
        .map(|s| episode.labels.utility_at(s.t))
        .sum()
}
