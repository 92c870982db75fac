use crate::models::{
    BacktestResult, EquityPoint, PerformanceMetrics, SimulationConfig, TradingSignal,
};
use crate::portfolio::{Order, OrderSide};
use statrs::statistics::Statistics;

const TRADING_DAYS_PER_YEAR: f64 = 252.0;
const MAX_REPORTED_ERRORS: usize = 20;

/// Everything a finished (or cancelled) simulation hands over for reporting.
#[derive(Debug, Clone, Default)]
pub struct RunRecord {
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Order>,
    pub signals_generated: Vec<TradingSignal>,
    pub warnings: Vec<String>,
    pub errors: Vec<String>,
    pub cancelled: bool,
}

pub struct ResultCalculator {
    risk_free_rate: f64,
}

impl Default for ResultCalculator {
    fn default() -> Self {
        Self::new(0.0)
    }
}

impl ResultCalculator {
    pub fn new(risk_free_rate: f64) -> Self {
        let risk_free_rate = if risk_free_rate.is_finite() {
            risk_free_rate
        } else {
            0.0
        };
        Self { risk_free_rate }
    }

    pub fn calculate(
        &self,
        starting_capital: f64,
        equity_curve: &[EquityPoint],
        trades: &[Order],
    ) -> PerformanceMetrics {
        let filled: Vec<&Order> = trades.iter().filter(|order| order.is_filled()).collect();
        // every SELL closes the whole position, so each one ends a round trip
        let round_trips: Vec<f64> = filled
            .iter()
            .filter(|order| order.side == OrderSide::Sell)
            .map(|order| order.realized_pnl.unwrap_or(0.0))
            .collect();
        let winning_trades = round_trips.iter().filter(|pnl| **pnl > 0.0).count();
        let losing_trades = round_trips.iter().filter(|pnl| **pnl < 0.0).count();
        let win_rate = if round_trips.is_empty() {
            0.0
        } else {
            winning_trades as f64 / round_trips.len() as f64
        };

        let (total_return_pct, max_drawdown, sharpe_ratio) = if equity_curve.len() < 2 {
            (0.0, 0.0, None)
        } else {
            let ending_value = equity_curve
                .last()
                .map(|point| point.value)
                .unwrap_or(starting_capital);
            (
                Self::total_return_pct(starting_capital, ending_value),
                Self::max_drawdown_pct(equity_curve),
                Some(self.sharpe_ratio(equity_curve)),
            )
        };

        PerformanceMetrics {
            total_return_pct,
            total_trades: filled.len(),
            winning_trades,
            losing_trades,
            win_rate,
            max_drawdown,
            sharpe_ratio,
        }
    }

    pub fn build_result(&self, config: &SimulationConfig, record: RunRecord) -> BacktestResult {
        let metrics = self.calculate(config.starting_capital, &record.equity_curve, &record.trades);
        let ending_value = record
            .equity_curve
            .last()
            .map(|point| point.value)
            .unwrap_or(config.starting_capital);

        BacktestResult {
            symbols: config.symbols.clone(),
            strategy_name: config.strategy_name.clone(),
            start_date: config.start_date,
            end_date: config.end_date,
            starting_capital: config.starting_capital,
            ending_value,
            metrics,
            equity_curve: record.equity_curve,
            trades: record.trades,
            signals_generated: record.signals_generated,
            warnings: record.warnings,
            cancelled: record.cancelled,
            error_message: summarize_errors(&record.errors),
        }
    }

    fn total_return_pct(starting_capital: f64, ending_value: f64) -> f64 {
        if starting_capital <= 0.0 || !ending_value.is_finite() {
            return 0.0;
        }
        (ending_value - starting_capital) / starting_capital * 100.0
    }

    /// Largest peak-to-trough decline, in percent of the peak.
    pub fn max_drawdown_pct(equity_curve: &[EquityPoint]) -> f64 {
        let Some(first) = equity_curve.first() else {
            return 0.0;
        };

        let mut peak_value = first.value;
        let mut max_drawdown_percent = 0.0;
        for point in equity_curve {
            if point.value > peak_value {
                peak_value = point.value;
            } else if peak_value > 0.0 {
                let drawdown_percent = (peak_value - point.value) / peak_value * 100.0;
                if drawdown_percent > max_drawdown_percent {
                    max_drawdown_percent = drawdown_percent;
                }
            }
        }
        max_drawdown_percent
    }

    pub fn sharpe_ratio(&self, equity_curve: &[EquityPoint]) -> f64 {
        let returns: Vec<f64> = equity_curve
            .windows(2)
            .map(|window| {
                let prev_value = window[0].value;
                if prev_value > 0.0 {
                    (window[1].value - prev_value) / prev_value
                } else {
                    0.0
                }
            })
            .collect();
        if returns.len() < 2 {
            return 0.0;
        }

        let mean_return = returns.clone().mean();
        let std_dev = returns.std_dev();
        if !std_dev.is_finite() || std_dev == 0.0 {
            return 0.0;
        }

        let annualized_return = mean_return * TRADING_DAYS_PER_YEAR;
        let annualized_volatility = std_dev * TRADING_DAYS_PER_YEAR.sqrt();
        (annualized_return - self.risk_free_rate) / annualized_volatility
    }
}

fn summarize_errors(errors: &[String]) -> Option<String> {
    if errors.is_empty() {
        return None;
    }
    let mut message = errors
        .iter()
        .take(MAX_REPORTED_ERRORS)
        .cloned()
        .collect::<Vec<_>>()
        .join("; ");
    if errors.len() > MAX_REPORTED_ERRORS {
        message.push_str(&format!(
            "; and {} more",
            errors.len() - MAX_REPORTED_ERRORS
        ));
    }
    Some(message)
}
