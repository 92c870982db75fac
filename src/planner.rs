use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult};
use crate::models::SimulationConfig;
use log::info;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

const LOW_COMPLEXITY_MAX: f64 = 1_000.0;
const MEDIUM_COMPLEXITY_MAX: f64 = 25_000.0;
const HIGH_COMPLEXITY_MAX: f64 = 250_000.0;
const PARALLEL_FRACTION: f64 = 0.8;
/// Rough cost of one symbol-day of simulation, used only for estimates.
const SECONDS_PER_COMPLEXITY_UNIT: f64 = 0.0005;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComplexityCategory {
    Low,
    Medium,
    High,
    Extreme,
}

impl ComplexityCategory {
    pub fn from_score(score: f64) -> Self {
        if score <= LOW_COMPLEXITY_MAX {
            ComplexityCategory::Low
        } else if score <= MEDIUM_COMPLEXITY_MAX {
            ComplexityCategory::Medium
        } else if score <= HIGH_COMPLEXITY_MAX {
            ComplexityCategory::High
        } else {
            ComplexityCategory::Extreme
        }
    }

    pub fn worker_cap(self) -> usize {
        match self {
            ComplexityCategory::Low => 1,
            ComplexityCategory::Medium => 2,
            ComplexityCategory::High => 4,
            ComplexityCategory::Extreme => 8,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    Serial,
    Parallel,
}

/// Per-strategy cost multipliers. Installed once per process and read-only afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct ComplexityTable {
    multipliers: BTreeMap<String, f64>,
    default_multiplier: f64,
}

impl Default for ComplexityTable {
    fn default() -> Self {
        Self::new(1.0)
            .with_multiplier("moving_average_crossover", 1.0)
            .with_multiplier("rsi", 1.2)
    }
}

impl ComplexityTable {
    pub fn new(default_multiplier: f64) -> Self {
        Self {
            multipliers: BTreeMap::new(),
            default_multiplier,
        }
    }

    pub fn with_multiplier(mut self, strategy_name: &str, multiplier: f64) -> Self {
        self.multipliers
            .insert(strategy_name.trim().to_ascii_lowercase(), multiplier);
        self
    }

    pub fn multiplier(&self, strategy_name: &str) -> f64 {
        let key = strategy_name.trim().to_ascii_lowercase().replace('-', "_");
        self.multipliers
            .get(&key)
            .copied()
            .unwrap_or(self.default_multiplier)
    }
}

static COMPLEXITY_TABLE: OnceLock<ComplexityTable> = OnceLock::new();

/// Installs the process-wide table. Fails, handing the table back, if one is already in place
/// (including the default, once anything has read it).
pub fn install_complexity_table(table: ComplexityTable) -> Result<(), ComplexityTable> {
    COMPLEXITY_TABLE.set(table)
}

pub fn complexity_table() -> &'static ComplexityTable {
    COMPLEXITY_TABLE.get_or_init(ComplexityTable::default)
}

/// Everything a worker process needs; written to a temp file and passed by path.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub worker_id: usize,
    pub job: SimulationConfig,
    pub market_data_path: PathBuf,
    pub settings: EngineSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionPlan {
    pub complexity_score: f64,
    pub complexity: ComplexityCategory,
    pub mode: ExecutionMode,
    pub symbol_groups: Vec<Vec<String>>,
    pub worker_configs: Vec<WorkerConfig>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionEstimate {
    pub workers: usize,
    pub serial_secs: f64,
    pub estimated_secs: f64,
    pub speedup: f64,
}

#[derive(Debug, Clone, Default)]
pub struct ExecutionPlanner {
    max_workers: Option<usize>,
}

impl ExecutionPlanner {
    pub fn new(max_workers: Option<usize>) -> Self {
        Self {
            max_workers: max_workers.filter(|value| *value > 0),
        }
    }

    pub fn complexity_score(&self, config: &SimulationConfig) -> f64 {
        config.symbols.len() as f64
            * config.date_range_days() as f64
            * complexity_table().multiplier(&config.strategy_name)
    }

    pub fn categorize(&self, config: &SimulationConfig) -> ComplexityCategory {
        ComplexityCategory::from_score(self.complexity_score(config))
    }

    pub fn should_parallelize(&self, config: &SimulationConfig) -> bool {
        config.symbols.len() >= 2 && self.categorize(config) != ComplexityCategory::Low
    }

    pub fn recommended_workers(&self, config: &SimulationConfig) -> usize {
        let mut workers = self
            .categorize(config)
            .worker_cap()
            .min(config.symbols.len());
        if let Some(max_workers) = self.max_workers {
            workers = workers.min(max_workers);
        }
        workers.max(1)
    }

    /// Round-robin partition; empty groups are dropped.
    pub fn group_symbols(symbols: &[String], group_count: usize) -> Vec<Vec<String>> {
        let group_count = group_count.max(1);
        let mut groups = vec![Vec::new(); group_count];
        for (index, symbol) in symbols.iter().enumerate() {
            groups[index % group_count].push(symbol.clone());
        }
        groups.retain(|group| !group.is_empty());
        groups
    }

    pub fn create_plan(
        &self,
        config: &SimulationConfig,
        market_data_path: &Path,
        settings: &EngineSettings,
    ) -> EngineResult<ExecutionPlan> {
        config.validate()?;

        let complexity_score = self.complexity_score(config);
        let complexity = ComplexityCategory::from_score(complexity_score);
        let (mode, workers) = if self.should_parallelize(config) {
            (ExecutionMode::Parallel, self.recommended_workers(config))
        } else {
            (ExecutionMode::Serial, 1)
        };
        let symbol_groups = Self::group_symbols(&config.symbols, workers);

        let total_symbols = config.symbols.len() as f64;
        let worker_configs = symbol_groups
            .iter()
            .enumerate()
            .map(|(worker_id, group)| {
                let mut job = config.clone();
                job.symbols = group.clone();
                job.starting_capital =
                    config.starting_capital * group.len() as f64 / total_symbols;
                WorkerConfig {
                    worker_id,
                    job,
                    market_data_path: market_data_path.to_path_buf(),
                    settings: settings.clone(),
                }
            })
            .collect::<Vec<_>>();

        if worker_configs.iter().map(|worker| worker.job.symbols.len()).sum::<usize>()
            != config.symbols.len()
        {
            return Err(EngineError::validation(
                "symbol groups do not partition the requested symbols",
            ));
        }

        info!(
            "Planned {:?} execution: score {:.0} ({:?}), {} group(s)",
            mode,
            complexity_score,
            complexity,
            symbol_groups.len()
        );

        Ok(ExecutionPlan {
            complexity_score,
            complexity,
            mode,
            symbol_groups,
            worker_configs,
        })
    }

    /// Amdahl's law with a fixed parallel fraction.
    pub fn estimate_execution_time(
        &self,
        config: &SimulationConfig,
        workers: usize,
    ) -> ExecutionEstimate {
        let workers = workers.max(1);
        let serial_secs = self.complexity_score(config) * SECONDS_PER_COMPLEXITY_UNIT;
        let speedup = 1.0 / ((1.0 - PARALLEL_FRACTION) + PARALLEL_FRACTION / workers as f64);
        ExecutionEstimate {
            workers,
            serial_secs,
            estimated_secs: serial_secs / speedup,
            speedup,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, NaiveDate};
    use std::collections::HashMap;

    fn config(symbol_count: usize, days: i64, strategy: &str) -> SimulationConfig {
        let start = NaiveDate::from_ymd_opt(2020, 1, 1).unwrap();
        SimulationConfig {
            symbols: (0..symbol_count).map(|i| format!("S{}", i)).collect(),
            start_date: start,
            end_date: start + Duration::days(days - 1),
            starting_capital: 100_000.0,
            strategy_name: strategy.to_string(),
            strategy_parameters: HashMap::new(),
        }
    }

    fn strings(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    #[test]
    fn round_robin_grouping() {
        let groups = ExecutionPlanner::group_symbols(&strings(&["A", "B", "C", "D", "E"]), 2);
        assert_eq!(
            groups,
            vec![strings(&["A", "C", "E"]), strings(&["B", "D"])]
        );
        let groups = ExecutionPlanner::group_symbols(&strings(&["A", "B"]), 4);
        assert_eq!(groups, vec![strings(&["A"]), strings(&["B"])]);
    }

    #[test]
    fn categories_follow_thresholds() {
        assert_eq!(ComplexityCategory::from_score(1_000.0), ComplexityCategory::Low);
        assert_eq!(ComplexityCategory::from_score(1_000.5), ComplexityCategory::Medium);
        assert_eq!(ComplexityCategory::from_score(25_000.0), ComplexityCategory::Medium);
        assert_eq!(ComplexityCategory::from_score(250_000.0), ComplexityCategory::High);
        assert_eq!(ComplexityCategory::from_score(250_001.0), ComplexityCategory::Extreme);
    }

    #[test]
    fn rsi_costs_more_than_ma() {
        let planner = ExecutionPlanner::default();
        let ma = planner.complexity_score(&config(10, 100, "moving_average_crossover"));
        let rsi = planner.complexity_score(&config(10, 100, "rsi"));
        assert!((ma - 1_000.0).abs() < 1e-9);
        assert!((rsi - 1_200.0).abs() < 1e-9);
    }

    #[test]
    fn small_or_single_symbol_jobs_stay_serial() {
        let planner = ExecutionPlanner::default();
        assert!(!planner.should_parallelize(&config(10, 100, "moving_average_crossover")));
        assert!(!planner.should_parallelize(&config(1, 5_000, "rsi")));
        assert!(planner.should_parallelize(&config(20, 365, "rsi")));
    }

    #[test]
    fn worker_count_is_capped() {
        let planner = ExecutionPlanner::default();
        // 3 symbols * 365 days is medium
        assert_eq!(planner.recommended_workers(&config(3, 365, "moving_average_crossover")), 2);
        // extreme, but only 5 symbols
        assert_eq!(planner.recommended_workers(&config(5, 100_000, "rsi")), 5);
        assert_eq!(
            ExecutionPlanner::new(Some(3)).recommended_workers(&config(500, 3_650, "rsi")),
            3
        );
        assert_eq!(planner.recommended_workers(&config(500, 3_650, "rsi")), 8);
    }

    #[test]
    fn plan_partitions_symbols_and_capital() {
        let planner = ExecutionPlanner::default();
        let job = config(5, 3_650, "rsi");
        let plan = planner
            .create_plan(&job, Path::new("data.bin"), &EngineSettings::default())
            .unwrap();
        assert_eq!(plan.mode, ExecutionMode::Parallel);
        assert_eq!(plan.worker_configs.len(), plan.symbol_groups.len());

        let mut all: Vec<String> = plan.symbol_groups.concat();
        all.sort();
        let mut expected = job.symbols.clone();
        expected.sort();
        assert_eq!(all, expected);

        let capital: f64 = plan
            .worker_configs
            .iter()
            .map(|worker| worker.job.starting_capital)
            .sum();
        assert!((capital - job.starting_capital).abs() < 1e-6);
        assert!(plan
            .worker_configs
            .iter()
            .enumerate()
            .all(|(i, worker)| worker.worker_id == i));
    }

    #[test]
    fn serial_plan_has_one_group() {
        let plan = ExecutionPlanner::default()
            .create_plan(
                &config(2, 10, "moving_average_crossover"),
                Path::new("data.bin"),
                &EngineSettings::default(),
            )
            .unwrap();
        assert_eq!(plan.mode, ExecutionMode::Serial);
        assert_eq!(plan.symbol_groups.len(), 1);
    }

    #[test]
    fn amdahl_estimate() {
        let planner = ExecutionPlanner::default();
        let job = config(10, 1_000, "moving_average_crossover");
        let single = planner.estimate_execution_time(&job, 1);
        assert!((single.speedup - 1.0).abs() < 1e-12);
        let four = planner.estimate_execution_time(&job, 4);
        // 1 / (0.2 + 0.2) = 2.5
        assert!((four.speedup - 2.5).abs() < 1e-12);
        assert!((four.estimated_secs - single.serial_secs / 2.5).abs() < 1e-9);
    }

    #[test]
    fn complexity_table_is_installed_once() {
        let current = complexity_table();
        assert_eq!(current.multiplier("RSI"), 1.2);
        assert_eq!(current.multiplier("something_else"), 1.0);
        assert!(install_complexity_table(ComplexityTable::new(3.0)).is_err());
    }
}
