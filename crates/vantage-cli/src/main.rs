//! Synergy-Vantage CLI
//!
//! The `vantage` command drives the evolutionary search loop and inspects
//! what it left behind.
//!
//! ## Commands
//!
//! - `run`: run the evolution loop from a config file
//! - `best`: show the top of a persisted population
//! - `review`: list candidates flagged for human review
//! - `audit`: print the score audit log
//! - `check-config`: load and validate a config file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{info, warn, Level};

use vantage_core::{
    EchoBackend, EvolutionConfig, GenerationBackend, OpenAiBackend, Orchestrator, ProgramDb,
    RunSummary, ScoreRegistry,
};
use vantage_state::{AuditRecord, CandidateId, FileProgramStore, PopulationEntry, ReviewItem};

#[derive(Parser)]
#[command(name = "vantage")]
#[command(author = "Synergy Vantage Contributors")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Evolutionary program search with a tiered evaluation cascade", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON log lines and JSON command output
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the evolution loop
    Run {
        /// Config file (.yaml, .yml, .toml or .json)
        #[arg(short, long)]
        config: PathBuf,

        /// Use the offline echo backend instead of an OpenAI-compatible API
        #[arg(long)]
        offline: bool,

        /// Override `max_iterations` from the config
        #[arg(long)]
        max_iterations: Option<u64>,
    },

    /// Show the best candidates of a persisted population
    Best {
        /// ProgramDB directory (the config's `program_db_path`)
        #[arg(long)]
        db: PathBuf,

        /// Number of entries to show
        #[arg(short, default_value = "5")]
        k: usize,
    },

    /// List candidates flagged for human review
    Review {
        /// ProgramDB directory
        #[arg(long)]
        db: PathBuf,
    },

    /// Print the score audit log
    Audit {
        /// JSONL audit log (the config's `audit_log_path`)
        #[arg(long)]
        log: PathBuf,

        /// Only records for this candidate
        #[arg(long)]
        candidate: Option<String>,
    },

    /// Load and validate a config file
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    vantage_core::telemetry::init_tracing(cli.json, level);

    match cli.command {
        Commands::Run {
            config,
            offline,
            max_iterations,
        } => cmd_run(&config, offline, max_iterations, cli.json).await,
        Commands::Best { db, k } => cmd_best(&db, k, cli.json).await,
        Commands::Review { db } => cmd_review(&db, cli.json).await,
        Commands::Audit { log, candidate } => {
            cmd_audit(&log, candidate.as_deref(), cli.json).await
        }
        Commands::CheckConfig { config } => cmd_check_config(&config, cli.json),
    }
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn load_config(path: &Path) -> Result<EvolutionConfig> {
    let config = EvolutionConfig::load(path)
        .with_context(|| format!("Failed to load config {}", path.display()))?;
    config
        .validate()
        .with_context(|| format!("Invalid config {}", path.display()))?;
    Ok(config)
}

/// Run the evolution loop until it terminates or Ctrl-C is pressed
async fn cmd_run(
    path: &Path,
    offline: bool,
    max_iterations: Option<u64>,
    json: bool,
) -> Result<()> {
    let mut config = load_config(path)?;
    if let Some(n) = max_iterations {
        config.max_iterations = n;
    }

    let backend: Arc<dyn GenerationBackend> = if offline {
        Arc::new(EchoBackend)
    } else {
        Arc::new(
            OpenAiBackend::from_env(config.backend_timeout())
                .context("Failed to configure generation backend (use --offline to run without one)")?,
        )
    };

    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; stopping after the current iteration");
            let _ = tx.send(true);
        }
    });

    info!(
        config = %path.display(),
        max_iterations = config.max_iterations,
        offline = offline,
        "starting evolution run"
    );
    let mut orchestrator = Orchestrator::from_config(config, backend)
        .await
        .context("Failed to set up orchestrator")?
        .with_shutdown(rx);
    let summary = orchestrator.run().await.context("Evolution run failed")?;

    if json {
        print_json(&summary)
    } else {
        print_summary(&summary);
        Ok(())
    }
}

fn print_summary(summary: &RunSummary) {
    println!("Run finished: {}", summary.termination);
    println!("  Iterations:  {}", summary.iterations);
    println!("  Evaluated:   {}", summary.candidates_evaluated);
    println!("  Promoted:    {}", summary.candidates_promoted);
    println!("  Archived:    {}", summary.candidates_archived);
    if summary.invalid_candidates > 0 {
        println!("  Invalid:     {}", summary.invalid_candidates);
    }
    println!("  Logged:      {}", summary.records_logged);
    if summary.persistence_failures > 0 {
        println!("  Persistence failures: {}", summary.persistence_failures);
    }
    if let Some(tokens) = summary.tokens_used {
        println!("  Tokens used: {}", tokens);
    }
    if let Some(best) = &summary.best {
        println!();
        println!("Best candidate {} (fitness {:.3})", best.id(), best.fitness());
        for line in best.candidate.payload.lines().take(20) {
            println!("    {}", line);
        }
    }
}

async fn open_program_db(dir: &Path) -> Result<ProgramDb> {
    let store = FileProgramStore::open(dir)
        .with_context(|| format!("Failed to open ProgramDB at {}", dir.display()))?;
    let db = ProgramDb::new(Arc::new(store));
    db.seed_or_load(None)
        .await
        .with_context(|| format!("Failed to load ProgramDB at {}", dir.display()))?;
    Ok(db)
}

fn first_line(payload: &str) -> &str {
    payload.lines().next().unwrap_or("")
}

/// Show the top `k` population entries
async fn cmd_best(dir: &Path, k: usize, json: bool) -> Result<()> {
    let db = open_program_db(dir).await?;
    let best: Vec<PopulationEntry> = db.get_best(k).await?;

    if json {
        return print_json(&best);
    }
    if best.is_empty() {
        println!("Population at {} is empty", dir.display());
        return Ok(());
    }
    for (rank, entry) in best.iter().enumerate() {
        println!(
            "{:>3}. {:.3}  gen {:<3} {}  {}",
            rank + 1,
            entry.fitness(),
            entry.candidate.generation,
            entry.id().short(),
            first_line(&entry.candidate.payload),
        );
    }
    Ok(())
}

/// List candidates flagged for human review
async fn cmd_review(dir: &Path, json: bool) -> Result<()> {
    let db = open_program_db(dir).await?;
    let queue: Vec<ReviewItem> = db.review_queue().await?;

    if json {
        return print_json(&queue);
    }
    if queue.is_empty() {
        println!("No candidates awaiting review");
        return Ok(());
    }
    for item in &queue {
        println!(
            "{}  {:?}  fitness {:.3}",
            item.candidate.id,
            item.location,
            item.result.final_fitness_score,
        );
        if let Some(reason) = &item.result.review_reason {
            println!("    {}", reason);
        }
    }
    Ok(())
}

fn format_score(score: Option<f64>) -> String {
    score.map(|s| format!("{:.3}", s)).unwrap_or_else(|| "-".to_string())
}

/// Print audit records, optionally for a single candidate
async fn cmd_audit(path: &Path, candidate: Option<&str>, json: bool) -> Result<()> {
    let registry = ScoreRegistry::open_jsonl(path)
        .await
        .with_context(|| format!("Failed to read audit log {}", path.display()))?;
    let records: Vec<AuditRecord> = match candidate {
        Some(id) => registry.history(&CandidateId::from(id)).await?,
        None => registry.records().await?,
    };

    if json {
        return print_json(&records);
    }
    if records.is_empty() {
        println!("No audit records found");
        return Ok(());
    }
    println!("  seq  timestamp            candidate  gen  t1     t2     t3     final  review");
    for r in &records {
        println!(
            "{:>5}  {}  {:<9}  {:<3}  {:<5}  {:<5}  {:<5}  {:.3}  {}",
            r.seq,
            r.timestamp.format("%Y-%m-%d %H:%M:%S"),
            r.candidate_id.short(),
            r.generation,
            format_score(r.score_t1),
            format_score(r.score_t2),
            format_score(r.score_t3),
            r.final_fitness_score,
            if r.requires_human_review { "yes" } else { "no" },
        );
    }
    Ok(())
}

/// Load and validate a config file
fn cmd_check_config(path: &Path, json: bool) -> Result<()> {
    let config = load_config(path)?;
    if json {
        return print_json(&config);
    }
    println!("Config OK: {}", path.display());
    println!("  max_iterations:         {}", config.max_iterations);
    println!("  candidate_generation_N: {}", config.candidate_generation_n);
    println!("  top_k_selection:        {}", config.top_k_selection);
    println!(
        "  tiers enabled:          t2={} t3={} t4={}",
        config.enable_tier2, config.enable_tier3, config.enable_tier4
    );
    println!("  audit_log_path:         {}", config.audit_log_path.display());
    match &config.program_db_path {
        Some(p) => println!("  program_db_path:        {}", p.display()),
        None => println!("  program_db_path:        (in-memory)"),
    }
    Ok(())
}
