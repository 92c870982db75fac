use crate::execution::ExecutionSettings;
use crate::models::SimulationConfig;
use crate::portfolio::CommissionModel;
use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::env;
use std::path::Path;

const SETTINGS_PREFIX: &str = "BACKTEST_";

/// Runtime knobs shared by the CLI, the simulation loop and worker processes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineSettings {
    pub commission: CommissionModel,
    pub target_allocation: f64,
    pub progress_interval_pct: f64,
    pub risk_free_rate: f64,
    pub worker_timeout_secs: u64,
    #[serde(default)]
    pub max_workers: Option<usize>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            commission: CommissionModel::zero(),
            target_allocation: 0.1,
            progress_interval_pct: 5.0,
            risk_free_rate: 0.0,
            worker_timeout_secs: 600,
            max_workers: None,
        }
    }
}

impl EngineSettings {
    /// Reads `BACKTEST_*` settings; absent keys keep their defaults.
    pub fn from_settings_map(settings: &HashMap<String, String>) -> Result<Self> {
        let defaults = Self::default();

        let flat = optional_setting_f64(settings, "BACKTEST_COMMISSION_FLAT", Some(0.0), None)?
            .unwrap_or(defaults.commission.flat);
        let pct = optional_setting_f64(settings, "BACKTEST_COMMISSION_PCT", Some(0.0), Some(1.0))?
            .unwrap_or(defaults.commission.pct);
        let target_allocation =
            optional_setting_f64(settings, "BACKTEST_TARGET_ALLOCATION", Some(0.0), Some(1.0))?
                .unwrap_or(defaults.target_allocation);
        let progress_interval_pct = optional_setting_f64(
            settings,
            "BACKTEST_PROGRESS_INTERVAL_PCT",
            Some(0.0),
            Some(100.0),
        )?
        .unwrap_or(defaults.progress_interval_pct);
        let risk_free_rate =
            optional_setting_f64(settings, "BACKTEST_RISK_FREE_RATE", Some(-1.0), Some(1.0))?
                .unwrap_or(defaults.risk_free_rate);
        let worker_timeout_secs =
            optional_setting_usize(settings, "BACKTEST_WORKER_TIMEOUT_SECS", 1)?
                .map(|value| value as u64)
                .unwrap_or(defaults.worker_timeout_secs);
        let max_workers = optional_setting_usize(settings, "BACKTEST_MAX_WORKERS", 1)?;

        if target_allocation <= 0.0 {
            return Err(anyhow!(
                "BACKTEST_TARGET_ALLOCATION must be > 0 (value: {})",
                target_allocation
            ));
        }
        if progress_interval_pct <= 0.0 {
            return Err(anyhow!(
                "BACKTEST_PROGRESS_INTERVAL_PCT must be > 0 (value: {})",
                progress_interval_pct
            ));
        }

        Ok(Self {
            commission: CommissionModel { flat, pct },
            target_allocation,
            progress_interval_pct,
            risk_free_rate,
            worker_timeout_secs,
            max_workers,
        })
    }

    pub fn from_env() -> Result<Self> {
        let settings: HashMap<String, String> = env::vars()
            .filter(|(key, _)| key.starts_with(SETTINGS_PREFIX))
            .collect();
        Self::from_settings_map(&settings)
    }

    pub fn execution_settings(&self) -> ExecutionSettings {
        ExecutionSettings {
            target_allocation: self.target_allocation,
        }
    }
}

/// Reads and validates a job submission document.
pub fn load_job_file<P: AsRef<Path>>(path: P) -> Result<SimulationConfig> {
    let path = path.as_ref();
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read job file {}", path.display()))?;
    let config: SimulationConfig = serde_json::from_str(&raw)
        .with_context(|| format!("Invalid job JSON in {}", path.display()))?;
    config
        .validate()
        .map_err(|error| anyhow!("Invalid job {}: {}", path.display(), error))?;
    Ok(config)
}

fn optional_setting<'a>(settings: &'a HashMap<String, String>, key: &str) -> Option<&'a str> {
    settings
        .get(key)
        .map(|value| value.trim())
        .filter(|value| !value.is_empty())
}

fn optional_setting_f64(
    settings: &HashMap<String, String>,
    key: &str,
    min: Option<f64>,
    max: Option<f64>,
) -> Result<Option<f64>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if let Some(min_value) = min {
        if value < min_value {
            return Err(anyhow!(
                "Setting {} must be >= {} (value: {})",
                key,
                min_value,
                raw
            ));
        }
    }
    if let Some(max_value) = max {
        if value > max_value {
            return Err(anyhow!(
                "Setting {} must be <= {} (value: {})",
                key,
                max_value,
                raw
            ));
        }
    }
    Ok(Some(value))
}

fn optional_setting_usize(
    settings: &HashMap<String, String>,
    key: &str,
    min: usize,
) -> Result<Option<usize>> {
    let Some(raw) = optional_setting(settings, key) else {
        return Ok(None);
    };
    let value = raw
        .parse::<f64>()
        .map_err(|_| anyhow!("Setting {} must be a number (value: {})", key, raw))?;
    if !value.is_finite() {
        return Err(anyhow!("Setting {} must be finite (value: {})", key, raw));
    }
    if value.fract() != 0.0 {
        return Err(anyhow!(
            "Setting {} must be an integer (value: {})",
            key,
            raw
        ));
    }
    if value < min as f64 {
        return Err(anyhow!(
            "Setting {} must be >= {} (value: {})",
            key,
            min,
            raw
        ));
    }
    Ok(Some(value as usize))
}
