use crate::error::{EngineError, EngineResult};
use crate::indicators::{self, Crossover};
use crate::models::{closes, PriceData, TradingSignal};
use crate::param_utils::{first_param, period_param};
use crate::portfolio::Portfolio;
use crate::strategy_utils::{buy_signal, hold_signal, sell_signal};
use std::collections::HashMap;

pub struct MovingAverageCrossoverStrategy {
    short_period: usize,
    long_period: usize,
    param_error: Option<String>,
}

impl MovingAverageCrossoverStrategy {
    pub const NAME: &'static str = "moving_average_crossover";

    pub fn new(short_period: usize, long_period: usize) -> Self {
        Self {
            short_period,
            long_period,
            param_error: None,
        }
    }

    pub fn periods(&self) -> (usize, usize) {
        (self.short_period, self.long_period)
    }

    fn confidence(short_now: f64, long_now: f64) -> f64 {
        if long_now <= 0.0 {
            return 0.5;
        }
        let spread = (short_now - long_now).abs() / long_now;
        (0.5 + spread * 10.0).min(1.0)
    }
}

impl Default for MovingAverageCrossoverStrategy {
    fn default() -> Self {
        Self::new(20, 50)
    }
}

impl crate::strategy::Strategy for MovingAverageCrossoverStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configure(&mut self, parameters: &HashMap<String, f64>) {
        self.param_error = None;
        let short = first_param(parameters, &["short_period", "shortPeriod", "short_window"]);
        if let Some(value) = short {
            match period_param("short_period", *value) {
                Ok(period) => self.short_period = period,
                Err(message) => self.param_error = Some(message),
            }
        }
        let long = first_param(parameters, &["long_period", "longPeriod", "long_window"]);
        if let Some(value) = long {
            match period_param("long_period", *value) {
                Ok(period) => self.long_period = period,
                Err(message) => {
                    self.param_error.get_or_insert(message);
                }
            }
        }
    }

    fn validate_config(&self) -> EngineResult<()> {
        if let Some(message) = &self.param_error {
            return Err(EngineError::validation(message.clone()));
        }
        if self.short_period == 0 {
            return Err(EngineError::validation("short_period must be at least 1"));
        }
        if self.short_period >= self.long_period {
            return Err(EngineError::validation(format!(
                "short_period ({}) must be less than long_period ({})",
                self.short_period, self.long_period
            )));
        }
        Ok(())
    }

    fn min_data_points(&self) -> usize {
        self.long_period + 1
    }

    fn evaluate_signal(
        &self,
        history: &[PriceData],
        _portfolio: &Portfolio,
        symbol: &str,
    ) -> EngineResult<TradingSignal> {
        let Some(bar) = history.last() else {
            return Err(EngineError::MissingData(format!(
                "no price history to evaluate {}",
                symbol
            )));
        };
        if history.len() < self.long_period + 1 {
            return Ok(hold_signal(
                symbol,
                bar,
                format!(
                    "insufficient history ({} of {} bars)",
                    history.len(),
                    self.long_period + 1
                ),
            ));
        }

        // Only the last long_period + 1 bars matter: two long averages and the matching
        // short averages.
        let window = closes(&history[history.len() - (self.long_period + 1)..]);
        let short_sma = indicators::calculate_sma(&window, self.short_period)?;
        let long_sma = indicators::calculate_sma(&window, self.long_period)?;
        let short_tail = &short_sma[short_sma.len() - 2..];

        let short_now = short_tail[1];
        let long_now = long_sma[1];
        match indicators::crossover_at(short_tail, &long_sma, 1) {
            Some(Crossover::Above) => Ok(buy_signal(
                symbol,
                bar,
                Self::confidence(short_now, long_now),
                format!(
                    "SMA({}) crossed above SMA({}): {:.4} > {:.4}",
                    self.short_period, self.long_period, short_now, long_now
                ),
            )),
            Some(Crossover::Below) => Ok(sell_signal(
                symbol,
                bar,
                Self::confidence(short_now, long_now),
                format!(
                    "SMA({}) crossed below SMA({}): {:.4} < {:.4}",
                    self.short_period, self.long_period, short_now, long_now
                ),
            )),
            None => Ok(hold_signal(symbol, bar, "no crossover")),
        }
    }
}
