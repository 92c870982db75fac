use crate::models::{BacktestResult, EquityPoint, SimulationConfig};
use crate::performance::ResultCalculator;
use crate::worker::{WorkerResult, WorkerStatus};
use chrono::NaiveDate;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Succeeded,
    PartiallySucceeded,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AggregationPolicy {
    #[default]
    RequireAll,
    AllowPartial,
}

impl AggregationPolicy {
    pub fn accepts(self, status: JobStatus) -> bool {
        match status {
            JobStatus::Succeeded => true,
            JobStatus::PartiallySucceeded => self == AggregationPolicy::AllowPartial,
            JobStatus::Failed => false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerSummary {
    pub worker_id: usize,
    pub symbols: Vec<String>,
    pub status: WorkerStatus,
    pub return_code: Option<i32>,
    pub execution_time_secs: f64,
}

impl From<&WorkerResult> for WorkerSummary {
    fn from(result: &WorkerResult) -> Self {
        Self {
            worker_id: result.worker_id,
            symbols: result.symbols.clone(),
            status: result.status.clone(),
            return_code: result.return_code,
            execution_time_secs: result.execution_time.as_secs_f64(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub status: JobStatus,
    pub success: bool,
    pub policy: AggregationPolicy,
    pub workers: Vec<WorkerSummary>,
    pub result: Option<BacktestResult>,
}

impl JobReport {
    /// Report for a job simulated in-process, without workers.
    pub fn single(job_id: Uuid, result: BacktestResult) -> Self {
        Self {
            job_id,
            status: JobStatus::Succeeded,
            success: true,
            policy: AggregationPolicy::RequireAll,
            workers: Vec::new(),
            result: Some(result),
        }
    }
}

/// Sum of per-group equity curves. Each group contributes its starting capital before its first
/// point and carries its last known value across dates it has no point for.
pub fn merge_equity_curves(curves: &[(f64, &[EquityPoint])]) -> Vec<EquityPoint> {
    let dates: BTreeSet<NaiveDate> = curves
        .iter()
        .flat_map(|(_, curve)| curve.iter().map(|point| point.date))
        .collect();

    let mut cursors = vec![0usize; curves.len()];
    let mut current: Vec<f64> = curves.iter().map(|(capital, _)| *capital).collect();
    dates
        .into_iter()
        .map(|date| {
            for (index, (_, curve)) in curves.iter().enumerate() {
                while cursors[index] < curve.len() && curve[cursors[index]].date <= date {
                    current[index] = curve[cursors[index]].value;
                    cursors[index] += 1;
                }
            }
            EquityPoint {
                date,
                value: current.iter().sum(),
            }
        })
        .collect()
}

pub fn aggregate(
    job_id: Uuid,
    job: &SimulationConfig,
    results: &[WorkerResult],
    policy: AggregationPolicy,
    calculator: &ResultCalculator,
) -> JobReport {
    let workers: Vec<WorkerSummary> = results.iter().map(WorkerSummary::from).collect();
    let succeeded: Vec<(&WorkerResult, &BacktestResult)> = results
        .iter()
        .filter(|worker| worker.is_success())
        .filter_map(|worker| worker.result.as_ref().map(|result| (worker, result)))
        .collect();
    let failures: Vec<String> = results
        .iter()
        .filter(|worker| !worker.is_success())
        .map(|worker| {
            format!(
                "worker {} [{}]: {}",
                worker.worker_id,
                worker.symbols.join(", "),
                worker
                    .failure_reason()
                    .unwrap_or_else(|| "no result".to_string())
            )
        })
        .collect();

    let status = if results.is_empty() || succeeded.is_empty() {
        JobStatus::Failed
    } else if failures.is_empty() {
        JobStatus::Succeeded
    } else {
        JobStatus::PartiallySucceeded
    };
    let success = policy.accepts(status);
    for failure in &failures {
        warn!("{}", failure);
    }
    info!(
        "Job {} aggregated: {:?} ({} of {} worker(s) succeeded)",
        job_id,
        status,
        succeeded.len(),
        results.len()
    );

    let result = if succeeded.is_empty() {
        None
    } else {
        Some(merge_results(job, &succeeded, &failures, calculator))
    };

    JobReport {
        job_id,
        status,
        success,
        policy,
        workers,
        result,
    }
}

fn merge_results(
    job: &SimulationConfig,
    succeeded: &[(&WorkerResult, &BacktestResult)],
    failures: &[String],
    calculator: &ResultCalculator,
) -> BacktestResult {
    let starting_capital: f64 = succeeded
        .iter()
        .map(|(_, result)| result.starting_capital)
        .sum();
    let curves: Vec<(f64, &[EquityPoint])> = succeeded
        .iter()
        .map(|(_, result)| (result.starting_capital, result.equity_curve.as_slice()))
        .collect();
    let equity_curve = merge_equity_curves(&curves);

    let mut trades = Vec::new();
    let mut signals_generated = Vec::new();
    let mut warnings = Vec::new();
    let mut errors = Vec::new();
    let mut covered: HashSet<&str> = HashSet::new();
    let mut cancelled = false;
    for (worker, result) in succeeded {
        trades.extend(result.trades.iter().cloned());
        signals_generated.extend(result.signals_generated.iter().cloned());
        warnings.extend(result.warnings.iter().cloned());
        if let Some(message) = &result.error_message {
            errors.push(format!("worker {}: {}", worker.worker_id, message));
        }
        covered.extend(worker.symbols.iter().map(String::as_str));
        cancelled |= result.cancelled;
    }
    // stable sort keeps per-group execution order within a day
    trades.sort_by_key(|order| order.date);
    signals_generated.sort_by_key(|signal| signal.date);
    errors.extend(failures.iter().cloned());

    let metrics = calculator.calculate(starting_capital, &equity_curve, &trades);
    let ending_value = equity_curve
        .last()
        .map(|point| point.value)
        .unwrap_or(starting_capital);
    let symbols = job
        .symbols
        .iter()
        .filter(|symbol| covered.contains(symbol.as_str()))
        .cloned()
        .collect();

    BacktestResult {
        symbols,
        strategy_name: job.strategy_name.clone(),
        start_date: job.start_date,
        end_date: job.end_date,
        starting_capital,
        ending_value,
        metrics,
        equity_curve,
        trades,
        signals_generated,
        warnings,
        cancelled,
        error_message: if errors.is_empty() {
            None
        } else {
            Some(errors.join("; "))
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PerformanceMetrics;
    use crate::portfolio::{Order, OrderSide};
    use chrono::Duration;
    use std::collections::HashMap;
    use std::time::Duration as StdDuration;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 2).unwrap() + Duration::days(offset)
    }

    fn job() -> SimulationConfig {
        SimulationConfig {
            symbols: vec!["A".to_string(), "B".to_string(), "C".to_string()],
            start_date: day(0),
            end_date: day(5),
            starting_capital: 3_000.0,
            strategy_name: "rsi".to_string(),
            strategy_parameters: HashMap::new(),
        }
    }

    fn curve(points: &[(i64, f64)]) -> Vec<EquityPoint> {
        points
            .iter()
            .map(|(offset, value)| EquityPoint {
                date: day(*offset),
                value: *value,
            })
            .collect()
    }

    fn backtest(symbols: &[&str], capital: f64, equity: Vec<EquityPoint>) -> BacktestResult {
        let mut sell = Order::new(1, symbols[0], OrderSide::Sell, 1, 10.0, day(1), "exit");
        sell.fill(0.0, Some(5.0)).unwrap();
        BacktestResult {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            strategy_name: "rsi".to_string(),
            start_date: day(0),
            end_date: day(5),
            starting_capital: capital,
            ending_value: equity.last().map(|p| p.value).unwrap_or(capital),
            metrics: PerformanceMetrics::default(),
            equity_curve: equity,
            trades: vec![sell],
            signals_generated: Vec::new(),
            warnings: Vec::new(),
            cancelled: false,
            error_message: None,
        }
    }

    fn worker(id: usize, symbols: &[&str], result: Option<BacktestResult>) -> WorkerResult {
        let status = if result.is_some() {
            WorkerStatus::Succeeded
        } else {
            WorkerStatus::TimedOut { timeout_secs: 1 }
        };
        WorkerResult {
            worker_id: id,
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            stdout: String::new(),
            stderr: String::new(),
            return_code: result.as_ref().map(|_| 0),
            execution_time: StdDuration::from_millis(10),
            status,
            result,
        }
    }

    #[test]
    fn equity_curves_are_summed_with_carry_forward() {
        let a = curve(&[(0, 100.0), (1, 110.0), (3, 120.0)]);
        let b = curve(&[(1, 55.0), (2, 60.0)]);
        let merged = merge_equity_curves(&[(100.0, a.as_slice()), (50.0, b.as_slice())]);
        let values: Vec<f64> = merged.iter().map(|p| p.value).collect();
        // day0: 100+50 (b not started), day1: 110+55, day2: 110+60, day3: 120+60
        assert_eq!(values, vec![150.0, 165.0, 170.0, 180.0]);
    }

    #[test]
    fn all_workers_succeeding() {
        let results = vec![
            worker(
                0,
                &["A", "C"],
                Some(backtest(
                    &["A", "C"],
                    2_000.0,
                    curve(&[(0, 2_000.0), (1, 2_100.0)]),
                )),
            ),
            worker(
                1,
                &["B"],
                Some(backtest(&["B"], 1_000.0, curve(&[(0, 1_000.0), (1, 900.0)]))),
            ),
        ];
        let report = aggregate(
            Uuid::new_v4(),
            &job(),
            &results,
            AggregationPolicy::RequireAll,
            &ResultCalculator::default(),
        );
        assert_eq!(report.status, JobStatus::Succeeded);
        assert!(report.success);
        let result = report.result.unwrap();
        assert_eq!(result.symbols, vec!["A", "B", "C"]);
        assert_eq!(result.starting_capital, 3_000.0);
        assert_eq!(result.ending_value, 3_000.0);
        assert_eq!(result.trades.len(), 2);
        assert_eq!(result.metrics.winning_trades, 2);
        assert!(result.error_message.is_none());
    }

    #[test]
    fn partial_success_depends_on_policy() {
        let results = vec![
            worker(
                0,
                &["A", "C"],
                Some(backtest(
                    &["A", "C"],
                    2_000.0,
                    curve(&[(0, 2_000.0), (1, 2_100.0)]),
                )),
            ),
            worker(1, &["B"], None),
        ];
        let strict = aggregate(
            Uuid::new_v4(),
            &job(),
            &results,
            AggregationPolicy::RequireAll,
            &ResultCalculator::default(),
        );
        assert_eq!(strict.status, JobStatus::PartiallySucceeded);
        assert!(!strict.success);
        let message = strict.result.unwrap().error_message.unwrap();
        assert!(message.contains("worker 1 [B]"));
        assert!(message.contains("timed out"));

        let lenient = aggregate(
            Uuid::new_v4(),
            &job(),
            &results,
            AggregationPolicy::AllowPartial,
            &ResultCalculator::default(),
        );
        assert!(lenient.success);
        assert_eq!(lenient.result.unwrap().symbols, vec!["A", "C"]);
    }

    #[test]
    fn no_successful_worker_fails_the_job() {
        let report = aggregate(
            Uuid::new_v4(),
            &job(),
            &[worker(0, &["A"], None)],
            AggregationPolicy::AllowPartial,
            &ResultCalculator::default(),
        );
        assert_eq!(report.status, JobStatus::Failed);
        assert!(!report.success);
        assert!(report.result.is_none());
        assert_eq!(report.workers.len(), 1);
    }
}
