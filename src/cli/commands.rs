//! CLI command definitions for docforge.
//!
//! A thin consumer of the library: it builds a store, backends and judges
//! from the environment, hands a [`RunConfig`] to the [`RunExecutor`], and
//! prints what the store recorded.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use serde::Serialize;
use tracing::{info, warn};

use crate::evaluation::LlmJudge;
use crate::generation::{Backend, GeneratorKind, LlmBackend, SubprocessBackend, SubprocessConfig};
use crate::llm::{LlmProvider, OpenRouterProvider};
use crate::metrics::RunMetrics;
use crate::run::config::{DB_ENV, DEFAULT_DB_PATH};
use crate::run::{RunConfig, RunExecutor, RunStatus, ServiceConfig};
use crate::store::{RunStore, SqliteStore};

/// Environment variable naming the generator kind for subprocess backends.
pub const KIND_ENV: &str = "DOCFORGE_KIND";

/// Candidate-document generation, evaluation and synthesis runs.
#[derive(Parser)]
#[command(name = "docforge")]
#[command(about = "Generate, evaluate and combine candidate documents across model backends")]
#[command(version)]
#[command(
    long_about = "docforge expands a run configuration into generation tasks across models and generator kinds,\nscores and ranks the results, and combines the best of them.\n\nExample usage:\n  docforge run --config run.yaml --db docforge.db\n  docforge timeline <run-id>"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

#[derive(clap::Subcommand)]
pub enum Commands {
    /// Execute a run from a YAML configuration.
    Run(RunArgs),

    /// Show a run's status, errors and results summary.
    Status(LookupArgs),

    /// Print a run's timeline.
    Timeline(LookupArgs),
}

#[derive(Parser, Debug)]
pub struct RunArgs {
    /// Run configuration file (YAML).
    #[arg(short, long)]
    pub config: PathBuf,

    /// SQLite database path.
    #[arg(long, env = DB_ENV, default_value = DEFAULT_DB_PATH)]
    pub db: String,

    /// Write Prometheus metrics to this file when the run ends.
    #[arg(long)]
    pub metrics_out: Option<PathBuf>,

    /// Output the terminal run as JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

#[derive(Parser, Debug)]
pub struct LookupArgs {
    /// Run id.
    pub run_id: String,

    /// SQLite database path.
    #[arg(long, env = DB_ENV, default_value = DEFAULT_DB_PATH)]
    pub db: String,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Parses CLI args and runs the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_run_command(args).await,
        Commands::Status(args) => run_status_command(args).await,
        Commands::Timeline(args) => run_timeline_command(args).await,
    }
}

// ============================================================================
// run
// ============================================================================

async fn run_run_command(args: RunArgs) -> anyhow::Result<()> {
    let config = RunConfig::load(&args.config)
        .with_context(|| format!("Failed to load run configuration {}", args.config.display()))?;
    let service = ServiceConfig::from_env()?;
    service.require_backend()?;

    let store = open_store(&args.db).await?;
    let provider = build_provider(&service, &config)?;
    let metrics = RunMetrics::new().context("Failed to register metrics")?;

    let mut executor = RunExecutor::new(store).with_metrics(metrics);
    executor = match &service.backend_command {
        Some(command) => {
            for kind in GeneratorKind::all() {
                executor = executor.with_backend(kind, subprocess_backend(command, kind, &config));
            }
            executor
        }
        None => {
            let provider = provider
                .clone()
                .context("An LLM provider is required when no backend command is set")?;
            let backend: Arc<dyn Backend> = Arc::new(
                LlmBackend::new("openrouter", provider).with_pricing(config.pricing.clone()),
            );
            executor.with_default_backend(backend)
        }
    };

    let judge_provider = provider.context(format!(
        "Judges need an LLM provider; set {}",
        crate::llm::providers::openrouter::API_KEY_ENV
    ))?;
    for judge in &config.evaluation.judges {
        executor = executor.with_judge(Arc::new(LlmJudge::new(judge.clone(), Arc::clone(&judge_provider))));
    }

    let cancel = executor.cancel_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling run");
            cancel.cancel();
        }
    });

    let run = executor.execute(&config).await?;

    if let (Some(path), Some(metrics)) = (&args.metrics_out, executor.metrics()) {
        std::fs::write(path, metrics.export())
            .with_context(|| format!("Failed to write metrics to {}", path.display()))?;
        info!(path = %path.display(), "Metrics written");
    }

    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }

    match run.status {
        RunStatus::Completed | RunStatus::Partial => Ok(()),
        status => Err(anyhow::anyhow!("Run {} finished as {}", run.id, status)),
    }
}

fn subprocess_backend(command: &str, kind: GeneratorKind, config: &RunConfig) -> Arc<dyn Backend> {
    let process = SubprocessConfig::new("sh")
        .with_args(["-c", command])
        .with_env(KIND_ENV, kind.as_str());
    Arc::new(SubprocessBackend::new(
        format!("subprocess:{}", kind),
        process,
        config.generation.retry,
    ))
}

fn build_provider(
    service: &ServiceConfig,
    config: &RunConfig,
) -> anyhow::Result<Option<Arc<dyn LlmProvider>>> {
    let Some(key) = &service.openrouter_api_key else {
        return Ok(None);
    };
    let provider = OpenRouterProvider::new(key.clone())
        .map_err(|e| anyhow::anyhow!("Failed to initialize OpenRouter provider: {}", e))?
        .with_retry_policy(config.generation.retry);
    info!(api_key = %provider.api_key_masked(), "Using OpenRouter");
    Ok(Some(Arc::new(provider)))
}

async fn open_store(path: &str) -> anyhow::Result<Arc<dyn RunStore>> {
    if let Some(parent) = Path::new(path).parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create database directory {}", parent.display()))?;
    }
    let store = SqliteStore::open(path)
        .await
        .with_context(|| format!("Failed to open database {}", path))?;
    Ok(Arc::new(store))
}

fn print_run(run: &crate::run::Run) {
    println!("Run:     {}", run.id);
    println!("Status:  {}", run.status);
    println!("Cost:    ${:.4}", run.total_cost_usd);
    if let Some(summary) = &run.summary {
        println!(
            "Tasks:   {} planned, {} reused, {} succeeded, {} failed, {} cancelled",
            summary.tasks_planned,
            summary.tasks_reused,
            summary.tasks_succeeded,
            summary.tasks_failed,
            summary.tasks_cancelled
        );
        println!(
            "Scores:  {}/{} single-doc, {}/{} pairwise",
            summary.single_scores_recorded,
            summary.single_scores_expected,
            summary.pairwise_recorded,
            summary.pairwise_expected
        );
        if summary.cost_unknown_tasks > 0 {
            println!("Unknown cost for {} task(s)", summary.cost_unknown_tasks);
        }
        if !summary.ranking.is_empty() {
            println!("\nRanking:");
            for (i, doc) in summary.ranking.iter().enumerate() {
                let score = doc
                    .single_score
                    .map(|s| format!("{:.2}", s))
                    .unwrap_or_else(|| "-".to_string());
                println!(
                    "  {:>2}. {}  {:>7.1}  games={:<3} score={:<5} {} [{}]",
                    i + 1,
                    doc.document_id,
                    doc.rating,
                    doc.games,
                    score,
                    doc.model,
                    doc.kind
                );
            }
        }
        if let Some(combined) = &summary.combined {
            println!(
                "\nCombined ({}): {} from {}",
                combined.strategy,
                combined.document_id,
                combined.inputs.join(", ")
            );
        }
        if !summary.missing.is_empty() {
            println!("\nMissing:");
            for entry in &summary.missing {
                println!("  - {}", entry);
            }
        }
    }
    if !run.errors.is_empty() {
        println!("\nErrors:");
        for error in &run.errors {
            println!("  - {}", error);
        }
    }
}

// ============================================================================
// status / timeline
// ============================================================================

async fn run_status_command(args: LookupArgs) -> anyhow::Result<()> {
    let store = open_store(&args.db).await?;
    let run = store
        .load_run(&args.run_id)
        .await
        .with_context(|| format!("Failed to load run {}", args.run_id))?;
    if args.json {
        println!("{}", serde_json::to_string_pretty(&run)?);
    } else {
        print_run(&run);
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct TimelineOutput<'a> {
    run_id: &'a str,
    events: &'a [crate::run::TimelineEvent],
}

async fn run_timeline_command(args: LookupArgs) -> anyhow::Result<()> {
    let store = open_store(&args.db).await?;
    let events = store
        .list_events(&args.run_id)
        .await
        .with_context(|| format!("Failed to load timeline for {}", args.run_id))?;

    if args.json {
        let output = TimelineOutput {
            run_id: &args.run_id,
            events: &events,
        };
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    if events.is_empty() {
        println!("No timeline events for run {}", args.run_id);
        return Ok(());
    }
    for event in &events {
        println!(
            "{:>5}  {}  {:<11} {} {}",
            event.sequence,
            event.timestamp.format("%H:%M:%S%.3f"),
            event.phase.as_str(),
            if event.success { "ok  " } else { "FAIL" },
            event.description
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::try_parse_from([
            "docforge",
            "run",
            "--config",
            "run.yaml",
            "--db",
            "/tmp/x.db",
            "--metrics-out",
            "metrics.prom",
        ])
        .expect("parse");
        match cli.command {
            Commands::Run(args) => {
                assert_eq!(args.config, PathBuf::from("run.yaml"));
                assert_eq!(args.db, "/tmp/x.db");
                assert_eq!(args.metrics_out, Some(PathBuf::from("metrics.prom")));
                assert!(!args.json);
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn test_parse_timeline_command() {
        let cli = Cli::try_parse_from(["docforge", "timeline", "run-42", "--json", "-l", "debug"])
            .expect("parse");
        assert_eq!(cli.log_level, "debug");
        match cli.command {
            Commands::Timeline(args) => {
                assert_eq!(args.run_id, "run-42");
                assert!(args.json);
            }
            _ => panic!("expected timeline command"),
        }
    }
}
