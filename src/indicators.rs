use crate::error::{EngineError, EngineResult};
use serde::{Deserialize, Serialize};

fn check_period(period: usize, available: usize, required: usize) -> EngineResult<()> {
    if period == 0 {
        return Err(EngineError::InvalidPeriod { period });
    }
    if required > available {
        return Err(EngineError::InsufficientData {
            required,
            available,
        });
    }
    Ok(())
}

/// Simple moving average. Returns `prices.len() - period + 1` values; the first one is the mean
/// of the first `period` prices.
pub fn calculate_sma(prices: &[f64], period: usize) -> EngineResult<Vec<f64>> {
    check_period(period, prices.len(), period)?;

    let mut sma_values = Vec::with_capacity(prices.len() - period + 1);
    let mut window_sum: f64 = prices[..period].iter().sum();
    sma_values.push(window_sum / period as f64);
    for i in period..prices.len() {
        window_sum += prices[i] - prices[i - period];
        sma_values.push(window_sum / period as f64);
    }

    Ok(sma_values)
}

/// Exponential moving average seeded with the first price.
pub fn calculate_ema(prices: &[f64], period: usize) -> EngineResult<Vec<f64>> {
    if period == 0 {
        return Err(EngineError::InvalidPeriod { period });
    }
    if prices.is_empty() {
        return Ok(Vec::new());
    }

    let multiplier = 2.0 / (period as f64 + 1.0);
    let mut ema_values = Vec::with_capacity(prices.len());
    ema_values.push(prices[0]);

    for i in 1..prices.len() {
        let ema = (prices[i] * multiplier) + (ema_values[i - 1] * (1.0 - multiplier));
        ema_values.push(ema);
    }

    Ok(ema_values)
}

fn rsi_from_avgs(avg_gain: f64, avg_loss: f64) -> f64 {
    if avg_loss == 0.0 && avg_gain == 0.0 {
        50.0
    } else if avg_loss == 0.0 {
        100.0
    } else if avg_gain == 0.0 {
        0.0
    } else {
        let rs = avg_gain / avg_loss;
        100.0 - 100.0 / (1.0 + rs)
    }
}

/// Wilder-smoothed RSI. Needs `period + 1` prices and returns `prices.len() - period` values,
/// the first aligned with `prices[period]`.
pub fn calculate_rsi(prices: &[f64], period: usize) -> EngineResult<Vec<f64>> {
    check_period(period, prices.len(), period + 1)?;

    let mut rsi_values = Vec::with_capacity(prices.len() - period);
    let mut sum_gain = 0.0f64;
    let mut sum_loss = 0.0f64;
    for i in 1..=period {
        let delta = prices[i] - prices[i - 1];
        if delta >= 0.0 {
            sum_gain += delta;
        } else {
            sum_loss += -delta;
        }
    }

    let mut avg_gain = sum_gain / period as f64;
    let mut avg_loss = sum_loss / period as f64;
    rsi_values.push(rsi_from_avgs(avg_gain, avg_loss));

    for i in (period + 1)..prices.len() {
        let delta = prices[i] - prices[i - 1];
        let gain = if delta > 0.0 { delta } else { 0.0 };
        let loss = if delta < 0.0 { -delta } else { 0.0 };
        avg_gain = (avg_gain * (period as f64 - 1.0) + gain) / period as f64;
        avg_loss = (avg_loss * (period as f64 - 1.0) + loss) / period as f64;
        rsi_values.push(rsi_from_avgs(avg_gain, avg_loss).clamp(0.0, 100.0));
    }

    Ok(rsi_values)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Crossover {
    Above,
    Below,
}

/// Cross of `fast` over `slow` between `index - 1` and `index`. Only a strict sign change of
/// `fast - slow` counts; touching or staying equal never does.
pub fn crossover_at(fast: &[f64], slow: &[f64], index: usize) -> Option<Crossover> {
    if index == 0 || index >= fast.len() || index >= slow.len() {
        return None;
    }
    let previous = fast[index - 1] - slow[index - 1];
    let current = fast[index] - slow[index];
    if previous < 0.0 && current > 0.0 {
        Some(Crossover::Above)
    } else if previous > 0.0 && current < 0.0 {
        Some(Crossover::Below)
    } else {
        None
    }
}

pub fn detect_crossovers(fast: &[f64], slow: &[f64]) -> Vec<(usize, Crossover)> {
    let len = fast.len().min(slow.len());
    (1..len)
        .filter_map(|index| crossover_at(fast, slow, index).map(|cross| (index, cross)))
        .collect()
}

/// Cross of a series through a fixed level, same strictness as [`crossover_at`].
pub fn level_cross_at(series: &[f64], level: f64, index: usize) -> Option<Crossover> {
    if index == 0 || index >= series.len() {
        return None;
    }
    let previous = series[index - 1] - level;
    let current = series[index] - level;
    if previous < 0.0 && current > 0.0 {
        Some(Crossover::Above)
    } else if previous > 0.0 && current < 0.0 {
        Some(Crossover::Below)
    } else {
        None
    }
}
