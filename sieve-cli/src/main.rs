//! Sieve CLI — funnel, refiner, and compressed session commands.
//!
//! Commands:
//! - `funnel` — run the three-stage funnel once and print per-stage counts
//! - `refine` — funnel, then rank the shortlist on tick metrics
//! - `session` — a whole trading day on a compressed clock with replayed ticks
//! - `config` — print the effective configuration as TOML
//!
//! Every command runs against the in-memory source, so provider calls fail
//! and each stage falls back to seeded synthetic data.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, NaiveDateTime};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use sieve_core::data::{MemorySource, QuoteSource, TickProfile};
use sieve_core::domain::{InstrumentId, SessionId};
use sieve_core::funnel::{FunnelFilter, FunnelOutcome, FunnelReport, TraceStatus};
use sieve_core::gatekeeper::Verdict;
use sieve_core::refiner::{RefinerReport, TickRefiner, TrackedStatus};
use sieve_core::rng::SeedHierarchy;
use sieve_runner::{
    export_audit_json, export_exclusions_csv, write_ranking_csv, DecisionLog, EngineParts,
    MomentumScorer, OrchestrationEngine, OrderExecutor, PaperExecutor, ReplaySettings,
    ReplaySource, SessionClock, SharedConnection, ShiftedClock, SieveConfig,
};

#[derive(Parser)]
#[command(name = "sieve", about = "Sieve — session watchlist funnel and fire control")]
struct Cli {
    /// Path to a TOML config file. Defaults apply when omitted.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Trading date (YYYY-MM-DD). Defaults to today.
    #[arg(long, global = true)]
    date: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the funnel filter once.
    Funnel {
        /// Print the path of this instrument through every stage.
        #[arg(long)]
        trace: Option<String>,

        /// Write every exclusion with its reason to this CSV file.
        #[arg(long)]
        exclusions: Option<PathBuf>,
    },
    /// Run the funnel, then rank the shortlist on tick metrics.
    Refine {
        /// Always report this instrument's rank or failure.
        #[arg(long)]
        track: Option<String>,

        /// Write the full ranking to this CSV file.
        #[arg(long)]
        csv: Option<PathBuf>,
    },
    /// Run a whole session on a compressed clock with replayed ticks.
    Session {
        /// Wall-clock minutes the session should take.
        #[arg(long, default_value_t = 2.0)]
        minutes: f64,

        /// Write the session audit as JSON to this file.
        #[arg(long)]
        audit: Option<PathBuf>,
    },
    /// Print the effective configuration as TOML.
    Config,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let date = parse_date(cli.date.as_deref())?;

    match cli.command {
        Commands::Funnel { trace, exclusions } => run_funnel(&config, date, trace, exclusions),
        Commands::Refine { track, csv } => run_refine(&config, date, track, csv),
        Commands::Session { minutes, audit } => run_session(config, date, minutes, audit),
        Commands::Config => {
            print!("{}", config.to_toml()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<SieveConfig> {
    match path {
        Some(path) => SieveConfig::from_file(path)
            .with_context(|| format!("failed to load config from {}", path.display())),
        None => Ok(SieveConfig::default()),
    }
}

fn parse_date(date: Option<&str>) -> Result<NaiveDate> {
    match date {
        Some(s) => NaiveDate::parse_from_str(s, "%Y-%m-%d")
            .with_context(|| format!("invalid --date '{s}', expected YYYY-MM-DD")),
        None => Ok(chrono::Local::now().date_naive()),
    }
}

fn seeds(config: &SieveConfig, date: NaiveDate) -> SeedHierarchy {
    SeedHierarchy::new(config.seed, SessionId::derive(date, config.seed))
}

fn source() -> Arc<dyn QuoteSource> {
    Arc::new(MemorySource::empty())
}

// ─── funnel ─────────────────────────────────────────────────────────

fn run_funnel(
    config: &SieveConfig,
    date: NaiveDate,
    trace: Option<String>,
    exclusions: Option<PathBuf>,
) -> Result<()> {
    let filter = FunnelFilter::new(config.funnel_config(), source(), seeds(config, date), date)?;
    let report = filter.run();
    print_funnel(&report);

    if let Some(id) = trace {
        print_trace(&report, &InstrumentId::new(id));
    }
    if let Some(path) = exclusions {
        let csv = export_exclusions_csv(&report)?;
        std::fs::write(&path, csv).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Exclusions written to: {}", path.display());
    }
    Ok(())
}

fn print_funnel(report: &FunnelReport) {
    println!();
    println!("=== Funnel ===");
    println!("{:<22} {:>8} {:>8} {:>8} {:>8}", "Stage", "In", "Out", "Dropped", "ms");
    println!("{}", "-".repeat(58));
    for stage in &report.stages {
        println!(
            "{:<22} {:>8} {:>8} {:>8} {:>8}",
            stage.stage.to_string(),
            stage.input_count,
            stage.output_count,
            stage.filtered_count,
            stage.elapsed_ms
        );
        for (code, n) in &stage.diagnostics.exclusion_counts {
            println!("    {code:<30} {n:>8}");
        }
    }
    match &report.outcome {
        FunnelOutcome::Shortlist { candidates } => {
            println!();
            println!("Shortlist: {} instruments", candidates.len());
        }
        FunnelOutcome::NoCandidates { stage, reason } => {
            println!();
            println!("No candidates after {stage}: {reason}");
        }
    }
    if report.synthetic_mode() {
        println!("WARNING: one or more stages ran on SYNTHETIC data");
    }
    println!();
}

fn print_trace(report: &FunnelReport, id: &InstrumentId) {
    let trace = report.trace(id);
    println!("--- Trace {id} ---");
    for (stage, status) in &trace.steps {
        let line = match status {
            TraceStatus::Retained { position } => format!("retained at position {position}"),
            TraceStatus::Excluded { reason } => format!("excluded: {reason}"),
            TraceStatus::NotReached => "not reached".to_string(),
            TraceStatus::NotInUniverse => "not in universe".to_string(),
        };
        println!("{:<22} {line}", stage.to_string());
    }
    println!();
}

// ─── refine ─────────────────────────────────────────────────────────

fn run_refine(
    config: &SieveConfig,
    date: NaiveDate,
    track: Option<String>,
    csv: Option<PathBuf>,
) -> Result<()> {
    let source = source();
    let seeds = seeds(config, date);
    let filter = FunnelFilter::new(config.funnel_config(), Arc::clone(&source), seeds.clone(), date)?;
    let funnel = filter.run();
    print_funnel(&funnel);

    let refiner = TickRefiner::new(config.refiner_config(), source, seeds, date)?;
    let tracked = track.map(InstrumentId::new);
    let report = refiner.refine(funnel.outcome.candidates(), tracked.as_ref());
    print_ranking(&report);

    if let Some(path) = csv {
        write_ranking_csv(&report, &path)?;
        println!("Ranking written to: {}", path.display());
    }
    Ok(())
}

fn print_ranking(report: &RefinerReport) {
    println!("=== Refiner ===");
    println!(
        "Ranked: {}  Failed: {}  Synthetic: {}  ({} ms)",
        report.ranked.len(),
        report.failed.len(),
        report.synthetic_count,
        report.elapsed_ms
    );
    println!();
    println!(
        "{:>4} {:<10} {:>7} {:>7} {:>7} {:>7} {:>7}",
        "Rank", "Instrument", "Score", "Ampl", "Vol", "Volume", "Flow"
    );
    println!("{}", "-".repeat(56));
    for s in report.head() {
        println!(
            "{:>4} {:<10} {:>7.3} {:>7.3} {:>7.3} {:>7.3} {:>7.3}",
            s.rank,
            s.instrument.to_string(),
            s.score,
            s.sub_scores.amplitude,
            s.sub_scores.volatility,
            s.sub_scores.volume,
            s.sub_scores.flow
        );
    }
    if let Some(tracked) = &report.tracked {
        println!();
        match &tracked.status {
            TrackedStatus::Ranked { rank, in_head, score } => println!(
                "Tracked {}: rank {rank} of {} (score {:.3}, {})",
                tracked.instrument,
                report.ranked.len(),
                score.score,
                if *in_head { "in head" } else { "outside head" }
            ),
            TrackedStatus::Failed { reason } => {
                println!("Tracked {}: failed ({reason})", tracked.instrument)
            }
            TrackedStatus::NotInInput => {
                println!("Tracked {}: not in the shortlist", tracked.instrument)
            }
        }
    }
    println!();
}

// ─── session ────────────────────────────────────────────────────────

fn run_session(config: SieveConfig, date: NaiveDate, minutes: f64, audit: Option<PathBuf>) -> Result<()> {
    if !minutes.is_finite() || minutes <= 0.0 {
        bail!("--minutes must be positive");
    }
    let schedule = &config.session;
    let origin: NaiveDateTime =
        date.and_time(schedule.pre_market_start) - chrono::Duration::seconds(10);
    let span_secs = (date.and_time(schedule.close) - origin).num_seconds() as f64;
    let speed = span_secs / (minutes * 60.0);
    let clock: Arc<dyn SessionClock> = Arc::new(ShiftedClock::new(origin, speed));
    info!(%origin, speed, "compressed session clock");

    let replay: Arc<dyn QuoteSource> = Arc::new(ReplaySource::new(
        source(),
        seeds(&config, date),
        date,
        Arc::clone(&clock),
        ReplaySettings {
            until: schedule.close,
            profile: TickProfile::Surging,
            daily_window: config.funnel.daily_window,
        },
    ));
    let decision_log = Arc::new(match &schedule.decision_log {
        Some(path) => DecisionLog::with_jsonl(path),
        None => DecisionLog::in_memory(),
    });
    let parts = EngineParts {
        source: replay,
        scorer: Box::new(MomentumScorer::new(config.scoring.clone())),
        executor: Arc::new(|| Arc::new(PaperExecutor::new()) as Arc<dyn OrderExecutor>),
        connection: Arc::new(SharedConnection::new()),
        clock,
        trading_date: date,
        decision_log: Arc::clone(&decision_log),
        profile_selector: None,
    };

    let engine = OrchestrationEngine::new(config, parts)?;
    engine.start()?;
    engine.wait()?;
    engine.stop();

    let session_audit = engine.audit();
    println!();
    println!("=== Session {} ===", session_audit.session);
    for t in &session_audit.transitions {
        println!("{}  {} -> {}", t.at.format("%H:%M:%S"), t.from, t.to);
    }
    if let Some(fire) = engine.fire_stats() {
        println!();
        println!("Ticks:          {}", fire.ticks);
        println!("Signals:        {}", fire.signals);
        println!("Cooled down:    {}", fire.cooled_down);
        println!("Approved:       {}", fire.approved);
        println!("Executed:       {}", fire.executed);
        println!("Exec failures:  {}", fire.execution_failures);
        println!("Scorer panics:  {}", fire.scorer_panics);
    }
    println!();
    for verdict in [Verdict::Approve, Verdict::DowngradeToWatch, Verdict::Block] {
        println!("{:<20} {}", verdict.to_string(), decision_log.count_by_verdict(verdict));
    }
    let bus = engine.bus_stats();
    println!(
        "Bus: {} published, {} processed, {} dropped, {} handler failures",
        bus.published, bus.processed, bus.dropped, bus.handler_failures
    );
    for note in &session_audit.notes {
        println!("NOTE: {note}");
    }
    if let Some(path) = decision_log.mirror_path() {
        println!("Decisions written to: {}", path.display());
    }
    if let Some(path) = audit {
        let json = export_audit_json(&session_audit)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))?;
        println!("Audit written to: {}", path.display());
    }
    println!();
    Ok(())
}
