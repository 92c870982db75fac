use crate::config::{load_job_file, EngineSettings};
use crate::planner::{ExecutionEstimate, ExecutionPlan, ExecutionPlanner};
use anyhow::{Context, Result};
use log::info;
use serde::Serialize;
use std::path::Path;

#[derive(Serialize)]
struct PlanReport {
    plan: ExecutionPlan,
    estimate: ExecutionEstimate,
}

pub fn run(
    job_path: &Path,
    market_data_file: &Path,
    settings: &EngineSettings,
    max_workers: Option<usize>,
) -> Result<()> {
    let job = load_job_file(job_path)?;
    let planner = ExecutionPlanner::new(max_workers);
    let plan = planner.create_plan(&job, market_data_file, settings)?;
    let estimate = planner.estimate_execution_time(&job, plan.worker_configs.len());
    info!(
        "Estimated {:.1}s serial, {:.1}s with {} worker(s)",
        estimate.serial_secs, estimate.estimated_secs, estimate.workers
    );

    let report = PlanReport { plan, estimate };
    let json = serde_json::to_string_pretty(&report).context("Failed to serialize plan")?;
    println!("{}", json);
    Ok(())
}
