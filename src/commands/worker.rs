use crate::market_data::MarketData;
use crate::planner::WorkerConfig;
use crate::progress::JsonLinesSink;
use crate::simulation::{run_simulation, CancellationFlag};
use anyhow::{anyhow, Context, Result};
use log::info;
use std::io::{self, Write};
use std::path::Path;

/// Worker side of the process boundary: progress goes to stderr as JSON lines, the result goes
/// to stdout as a single JSON document. Any error ends the process with a non-zero status.
pub fn run(config_path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(config_path)
        .with_context(|| format!("Failed to read worker config {}", config_path.display()))?;
    let config: WorkerConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid worker config in {}", config_path.display()))?;
    info!(
        "Worker {} simulating {} symbol(s): {}",
        config.worker_id,
        config.job.symbols.len(),
        config.job.symbols.join(", ")
    );

    let market_data = MarketData::load_from_file(&config.market_data_path)?;
    let sink = JsonLinesSink::new(io::stderr());
    let result = run_simulation(
        &config.job,
        &market_data,
        &config.settings,
        &sink,
        CancellationFlag::new(),
    )
    .map_err(|error| anyhow!(error.tagged_message()))?;

    let json = serde_json::to_string(&result).context("Failed to serialize backtest result")?;
    let stdout = io::stdout();
    let mut handle = stdout.lock();
    writeln!(handle, "{}", json).context("Failed to write result to stdout")?;
    handle.flush().context("Failed to flush stdout")?;
    Ok(())
}
