//! Allocation CLI - Evaluate allocation scenarios
//!
//! Provides commands for:
//! - Evaluating a scenario file (many allocations, concurrently)
//! - Printing the accounting window a strategy uses at a given time
//! - Listing the built-in strategy presets
//! - Generating synthetic scenarios
//!
//! Binary: alloc-calc

use std::path::PathBuf;
use std::time::Duration;

use allocation_core::{AllocationResult, RulePresets, StrategySummary, TimeAmount};
use anyhow::{Context, Result, bail};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod scenario;
mod synth;

use scenario::Scenario;

/// Allocation CLI - compute-time accounting
#[derive(Parser)]
#[command(name = "alloc-calc")]
#[command(about = "Compute burn time and remaining credit of cloud allocations", long_about = None)]
struct Cli {
    /// Days after joining during which users get NewUserRules
    #[arg(long, env = "ALLOC_NEW_USER_DAYS", default_value_t = 30.0, global = true)]
    new_user_days: f64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Evaluate every allocation of a scenario file
    Calculate {
        /// Scenario file (JSON)
        #[arg(short, long)]
        scenario: PathBuf,

        /// Wall-clock budget for the whole batch (milliseconds)
        #[arg(long, env = "ALLOC_BUDGET_MS", default_value_t = 5_000)]
        budget_ms: u64,

        /// Write full results as JSON to this file
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show the accounting window of a preset at a point in time
    Window {
        /// Preset name (global, new-user, staff)
        #[arg(short, long, default_value = "global")]
        strategy: String,

        /// Evaluation time (RFC 3339)
        #[arg(long)]
        at: DateTime<Utc>,

        /// Allocation start or last recharge (RFC 3339); defaults to --at
        #[arg(long)]
        anchor: Option<DateTime<Utc>>,
    },

    /// Print the built-in presets as JSON
    Presets,

    /// Generate a synthetic scenario file
    Synth {
        /// Number of instances
        #[arg(short, long, default_value_t = 10)]
        instances: usize,

        /// Length of the query window in days
        #[arg(short, long, default_value_t = 30)]
        days: u32,

        /// Allocation budget in hours
        #[arg(long, default_value_t = 1_000.0)]
        budget_hours: f64,

        /// Random seed
        #[arg(long, default_value_t = 42)]
        seed: u64,

        /// Query window start (RFC 3339)
        #[arg(long, default_value = "2021-01-01T00:00:00Z")]
        start: DateTime<Utc>,

        /// Output file; stdout when omitted
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "alloc_calc=info,allocation_core=info,warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let cli = Cli::parse();
    let presets = RulePresets::new(TimeAmount::days(cli.new_user_days))
        .context("Invalid --new-user-days")?;

    match cli.command {
        Commands::Calculate {
            scenario,
            budget_ms,
            output,
        } => calculate(&presets, &scenario, Duration::from_millis(budget_ms), output).await,
        Commands::Window {
            strategy,
            at,
            anchor,
        } => {
            let Some(strategy) = presets.by_name(&strategy) else {
                bail!("Unknown strategy preset '{}'", strategy);
            };
            let window = strategy.counting().window_for(at, anchor.unwrap_or(at))?;
            println!("{}: {}", strategy.name(), window);
            Ok(())
        }
        Commands::Presets => {
            let summaries: Vec<StrategySummary> =
                presets.all().iter().map(|s| s.summary()).collect();
            println!("{}", serde_json::to_string_pretty(&summaries)?);
            Ok(())
        }
        Commands::Synth {
            instances,
            days,
            budget_hours,
            seed,
            start,
            output,
        } => {
            let scenario = synth::generate(&synth::SynthParams {
                instances,
                days,
                budget_hours,
                seed,
                start,
            });
            let json = serde_json::to_string_pretty(&scenario)?;
            match output {
                Some(path) => {
                    std::fs::write(&path, json)
                        .with_context(|| format!("Failed to write {}", path.display()))?;
                    info!(
                        "Wrote {} histories to {}",
                        scenario.history_count(),
                        path.display()
                    );
                }
                None => println!("{}", json),
            }
            Ok(())
        }
    }
}

async fn calculate(
    presets: &RulePresets,
    path: &std::path::Path,
    budget: Duration,
    output: Option<PathBuf>,
) -> Result<()> {
    let scenario = Scenario::load(path)?;
    info!(
        "Scenario {}: {} jobs, window {} .. {}",
        path.display(),
        scenario.jobs.len(),
        scenario.query_start,
        scenario.query_end
    );

    let jobs = scenario.into_jobs(presets)?;
    let results = allocation_core::batch::evaluate_all(jobs, budget).await;

    let mut failed = 0;
    let mut finished: Vec<&AllocationResult> = Vec::new();
    for (id, outcome) in &results {
        match outcome {
            Ok(result) => {
                print_result(result);
                finished.push(result);
            }
            Err(e) => {
                warn!("Allocation {} failed: {}", id, e);
                println!("{:<24} ERROR {}", id, e);
                failed += 1;
            }
        }
    }

    if let Some(path) = output {
        let json = serde_json::to_string_pretty(&finished)?;
        std::fs::write(&path, json)
            .with_context(|| format!("Failed to write {}", path.display()))?;
        info!("Results written to {}", path.display());
    }

    if failed > 0 {
        bail!("{} of {} allocations failed", failed, results.len());
    }
    Ok(())
}

fn print_result(result: &AllocationResult) {
    let hours = |seconds: i64| seconds as f64 / 3_600.0;
    if result.unlimited {
        println!(
            "{:<24} {:<14} unlimited",
            result.allocation_id, result.strategy
        );
        return;
    }
    println!(
        "{:<24} {:<14} burned {:>9.2}h  remaining {:>9.2}h{}",
        result.allocation_id,
        result.strategy,
        result.total_burn_hours(),
        hours(result.remaining_seconds),
        if result.is_over_allocation() { "  OVER" } else { "" }
    );
    for instance in &result.per_instance {
        println!(
            "    {:<20} {:>9.2}h",
            instance.instance_id,
            hours(instance.burn_seconds)
        );
    }
}
