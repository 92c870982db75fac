use anyhow::Result;
use backtest_engine::{
    aggregate::AggregationPolicy,
    commands::{generate_data, plan, run, worker},
    config::EngineSettings,
};
use chrono::NaiveDate;
use clap::{Parser, Subcommand};
use log::info;
use std::path::PathBuf;

const DEFAULT_MARKET_DATA_FILE: &str = "data/market-data.bin";

#[derive(Parser)]
#[command(name = "backtest-engine")]
#[command(about = "Deterministic strategy backtesting with multi-process fan-out")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a backtest job and print the job report as JSON
    Run {
        /// Path to the job JSON (symbols, dates, capital, strategy)
        job: PathBuf,
        /// Path to the market data snapshot file
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        /// Write the report here instead of stdout
        #[arg(short, long, value_name = "PATH")]
        output: Option<PathBuf>,
        /// JSON object overriding strategy parameters
        #[arg(long, value_name = "JSON")]
        params: Option<String>,
        /// Upper bound on concurrent workers (default: BACKTEST_MAX_WORKERS, then CPU count)
        #[arg(long)]
        max_workers: Option<usize>,
        /// Kill a worker that runs longer than this
        #[arg(long)]
        timeout_secs: Option<u64>,
        /// Report success when at least one worker group finished
        #[arg(long)]
        allow_partial: bool,
    },
    /// Show the execution plan and time estimate for a job
    Plan {
        job: PathBuf,
        #[arg(long = "data-file", value_name = "PATH")]
        data_file: Option<PathBuf>,
        #[arg(long)]
        max_workers: Option<usize>,
    },
    /// Run one worker group from a config file (used by `run`)
    Worker {
        config: PathBuf,
    },
    /// Write a seeded synthetic market data snapshot
    GenerateData {
        #[arg(short, long = "output", value_name = "PATH")]
        output: Option<PathBuf>,
        #[arg(long, value_delimiter = ',', required = true)]
        symbols: Vec<String>,
        #[arg(long)]
        start: NaiveDate,
        #[arg(long)]
        end: NaiveDate,
        #[arg(long, default_value_t = 42)]
        seed: u64,
        /// Delist a symbol on a date, as SYMBOL=YYYY-MM-DD (repeatable)
        #[arg(long = "delist", value_name = "SYMBOL=DATE")]
        delistings: Vec<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut settings = EngineSettings::from_env()?;

    match cli.command {
        Commands::Run {
            job,
            data_file,
            output,
            params,
            max_workers,
            timeout_secs,
            allow_partial,
        } => {
            if let Some(timeout_secs) = timeout_secs {
                settings.worker_timeout_secs = timeout_secs.max(1);
            }
            let max_workers = resolve_max_workers(max_workers, settings.max_workers);
            let policy = if allow_partial {
                AggregationPolicy::AllowPartial
            } else {
                AggregationPolicy::RequireAll
            };
            info!("Starting backtest job from {}", job.display());
            run::run(
                run::RunOptions {
                    job_path: job,
                    market_data_path: resolve_market_data_path(data_file),
                    output,
                    params_override: params,
                    max_workers,
                    policy,
                },
                settings,
            )
            .await?;
        }
        Commands::Plan {
            job,
            data_file,
            max_workers,
        } => {
            let max_workers = Some(resolve_max_workers(max_workers, settings.max_workers));
            plan::run(
                &job,
                &resolve_market_data_path(data_file),
                &settings,
                max_workers,
            )?;
        }
        Commands::Worker { config } => {
            worker::run(&config)?;
        }
        Commands::GenerateData {
            output,
            symbols,
            start,
            end,
            seed,
            delistings,
        } => {
            generate_data::run(
                &resolve_market_data_path(output),
                symbols,
                start,
                end,
                seed,
                &delistings,
            )?;
        }
    }

    Ok(())
}

fn resolve_market_data_path(cli_value: Option<PathBuf>) -> PathBuf {
    cli_value.unwrap_or_else(|| PathBuf::from(DEFAULT_MARKET_DATA_FILE))
}

/// The flag wins over the environment; the CPU count is the last resort.
fn resolve_max_workers(cli_value: Option<usize>, env_value: Option<usize>) -> usize {
    cli_value
        .or(env_value)
        .unwrap_or_else(num_cpus::get)
        .max(1)
}
