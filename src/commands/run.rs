use crate::aggregate::{aggregate, AggregationPolicy, JobReport};
use crate::commands::market_data_snapshot::ensure_market_data_file;
use crate::config::{load_job_file, EngineSettings};
use crate::market_data::MarketData;
use crate::models::{parse_parameter_map_from_json, BacktestResult, SimulationConfig};
use crate::performance::ResultCalculator;
use crate::planner::{ExecutionMode, ExecutionPlan, ExecutionPlanner};
use crate::progress::{
    ChannelProgressSink, JobProgress, LogProgressSink, ProgressEvent, ProgressSink,
};
use crate::simulation::{run_simulation, CancellationFlag};
use crate::worker::WorkerSpawner;
use anyhow::{anyhow, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use log::{info, warn};
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

pub struct RunOptions {
    pub job_path: PathBuf,
    pub market_data_path: PathBuf,
    pub output: Option<PathBuf>,
    pub params_override: Option<String>,
    pub max_workers: usize,
    pub policy: AggregationPolicy,
}

pub async fn run(options: RunOptions, settings: EngineSettings) -> Result<()> {
    let mut job = load_job_file(&options.job_path)?;
    if let Some(raw) = &options.params_override {
        let overrides = parse_parameter_map_from_json(raw)?;
        job.strategy_parameters.extend(overrides);
        job.validate()?;
    }
    ensure_market_data_file(&options.market_data_path).await?;

    let planner = ExecutionPlanner::new(Some(options.max_workers));
    let plan = planner.create_plan(&job, &options.market_data_path, &settings)?;
    let estimate = planner.estimate_execution_time(&job, plan.worker_configs.len());
    info!(
        "Job covers {} symbol(s) from {} to {} with {}; estimated {:.1}s",
        job.symbols.len(),
        job.start_date,
        job.end_date,
        job.strategy_name,
        estimate.estimated_secs
    );

    let job_id = Uuid::new_v4();
    let report = match plan.mode {
        ExecutionMode::Serial => {
            let result = run_serial(job, &options.market_data_path, settings).await?;
            JobReport::single(job_id, result)
        }
        ExecutionMode::Parallel => {
            run_parallel(job_id, &job, &plan, &settings, options.max_workers, options.policy)
                .await?
        }
    };

    write_report(&report, options.output.as_deref())?;
    if !report.success {
        let detail = report
            .result
            .as_ref()
            .and_then(|result| result.error_message.clone())
            .unwrap_or_else(|| "no worker produced a result".to_string());
        return Err(anyhow!("Job {} failed: {}", job_id, detail));
    }
    Ok(())
}

fn progress_bar(len: u64) -> ProgressBar {
    let pb = ProgressBar::new(len);
    pb.set_style(
        ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} ({eta}) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// Cancels the given flag on Ctrl-C; the returned task is aborted once the run is over.
fn cancel_on_ctrl_c(cancel: CancellationFlag) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling simulation");
            cancel.cancel();
        }
    })
}

async fn run_serial(
    job: SimulationConfig,
    market_data_path: &Path,
    settings: EngineSettings,
) -> Result<BacktestResult> {
    let market_data = MarketData::load_from_file(market_data_path)?;
    let cancel = CancellationFlag::new();
    let interrupt = cancel_on_ctrl_c(cancel.clone());

    let (sender, receiver) = crossbeam_channel::unbounded::<ProgressEvent>();
    let pb = progress_bar(100);
    let bar = pb.clone();
    let display = std::thread::spawn(move || {
        for event in receiver.iter() {
            bar.set_position(event.progress_pct.round() as u64);
            bar.set_message(event.current_date.to_string());
        }
    });

    // without a terminal the bar is hidden, so progress goes to the log instead
    let interactive = std::io::stderr().is_terminal();
    let outcome = tokio::task::spawn_blocking(move || {
        let sink: Box<dyn ProgressSink> = if interactive {
            Box::new(ChannelProgressSink::new(sender))
        } else {
            drop(sender);
            Box::new(LogProgressSink::new(job.strategy_name.clone()))
        };
        run_simulation(&job, &market_data, &settings, sink.as_ref(), cancel)
    })
    .await
    .context("Simulation task panicked")?;
    interrupt.abort();
    if display.join().is_err() {
        warn!("Progress display thread panicked");
    }

    let result = outcome?;
    if result.cancelled {
        pb.abandon_with_message("Simulation cancelled");
    } else {
        pb.finish_with_message("Simulation completed");
    }
    Ok(result)
}

async fn run_parallel(
    job_id: Uuid,
    job: &SimulationConfig,
    plan: &ExecutionPlan,
    settings: &EngineSettings,
    max_workers: usize,
    policy: AggregationPolicy,
) -> Result<JobReport> {
    let progress = JobProgress::new();
    for config in &plan.worker_configs {
        progress.register_worker(config.worker_id);
    }
    progress.set_phase("Running workers");

    let spawner = WorkerSpawner::for_current_exe()?
        .with_timeout(Duration::from_secs(settings.worker_timeout_secs))
        .with_progress(progress.clone());

    let pb = progress_bar(100);
    let ticker = {
        let pb = pb.clone();
        let progress = progress.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_millis(200));
            loop {
                interval.tick().await;
                let snapshot = progress.snapshot();
                pb.set_position(snapshot.overall_pct.round() as u64);
                pb.set_message(format!(
                    "{} ({}/{} workers done, {} failed)",
                    snapshot.phase,
                    snapshot.workers_finished,
                    snapshot.workers_total,
                    snapshot.workers_failed
                ));
            }
        })
    };

    let concurrency = max_workers.clamp(1, plan.worker_configs.len().max(1));
    let results = tokio::select! {
        results = spawner.spawn_parallel_workers(&plan.worker_configs, concurrency) => results,
        _ = tokio::signal::ctrl_c() => {
            ticker.abort();
            pb.abandon_with_message("Interrupted");
            // dropping the spawner future kills every child via kill_on_drop
            return Err(anyhow!("Job {} interrupted before all workers finished", job_id));
        }
    };
    ticker.abort();

    progress.set_phase("Aggregating");
    let report = aggregate(
        job_id,
        job,
        &results,
        policy,
        &ResultCalculator::new(settings.risk_free_rate),
    );
    if report.success {
        pb.finish_with_message("Workers completed");
    } else {
        pb.abandon_with_message("Workers completed with errors");
    }
    Ok(report)
}

fn write_report(report: &JobReport, output: Option<&Path>) -> Result<()> {
    let json = serde_json::to_string_pretty(report).context("Failed to serialize job report")?;
    match output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write report to {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}
