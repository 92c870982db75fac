use crate::error::{EngineError, EngineResult};
use crate::indicators::{self, Crossover};
use crate::models::{closes, PriceData, TradingSignal};
use crate::param_utils::{first_param, get_param_f64, period_param};
use crate::portfolio::Portfolio;
use crate::strategy_utils::{buy_signal, hold_signal, sell_signal};
use std::collections::HashMap;

pub struct RsiStrategy {
    period: usize,
    oversold_level: f64,
    overbought_level: f64,
    param_error: Option<String>,
}

impl RsiStrategy {
    pub const NAME: &'static str = "rsi";

    pub fn new(period: usize, oversold_level: f64, overbought_level: f64) -> Self {
        Self {
            period,
            oversold_level,
            overbought_level,
            param_error: None,
        }
    }
}

impl Default for RsiStrategy {
    fn default() -> Self {
        Self::new(14, 30.0, 70.0)
    }
}

impl crate::strategy::Strategy for RsiStrategy {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn configure(&mut self, parameters: &HashMap<String, f64>) {
        let mut normalized = HashMap::new();
        let aliases: [(&str, &[&str]); 3] = [
            ("period", &["period", "rsi_period"]),
            ("oversold", &["oversold", "oversold_level", "oversoldLevel"]),
            ("overbought", &["overbought", "overbought_level", "overboughtLevel"]),
        ];
        for (target, keys) in aliases {
            if let Some(value) = first_param(parameters, keys) {
                normalized.insert(target.to_string(), *value);
            }
        }
        self.param_error = None;
        if let Some(value) = normalized.get("period") {
            match period_param("period", *value) {
                Ok(period) => self.period = period,
                Err(message) => self.param_error = Some(message),
            }
        }
        self.oversold_level = get_param_f64(&normalized, "oversold", self.oversold_level);
        self.overbought_level = get_param_f64(&normalized, "overbought", self.overbought_level);
    }

    fn validate_config(&self) -> EngineResult<()> {
        if let Some(message) = &self.param_error {
            return Err(EngineError::validation(message.clone()));
        }
        if self.period == 0 {
            return Err(EngineError::validation("RSI period must be at least 1"));
        }
        if !(0.0..=100.0).contains(&self.oversold_level)
            || !(0.0..=100.0).contains(&self.overbought_level)
        {
            return Err(EngineError::validation(format!(
                "RSI thresholds must lie within [0, 100] (oversold {}, overbought {})",
                self.oversold_level, self.overbought_level
            )));
        }
        if self.oversold_level >= self.overbought_level {
            return Err(EngineError::validation(format!(
                "oversold ({}) must be below overbought ({})",
                self.oversold_level, self.overbought_level
            )));
        }
        Ok(())
    }

    fn min_data_points(&self) -> usize {
        // two RSI readings are needed to see a threshold cross
        self.period + 2
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
        if history.len() < self.min_data_points() {
            return Ok(hold_signal(
                symbol,
                bar,
                format!(
                    "insufficient history ({} of {} bars)",
                    history.len(),
                    self.min_data_points()
                ),
            ));
        }

        let rsi = indicators::calculate_rsi(&closes(history), self.period)?;
        let last = rsi.len() - 1;
        let current = rsi[last];

        if let Some(Crossover::Above) = indicators::level_cross_at(&rsi, self.oversold_level, last)
        {
            let confidence = 0.5 + (self.overbought_level - current).max(0.0) / 200.0;
            return Ok(buy_signal(
                symbol,
                bar,
                confidence,
                format!(
                    "RSI({}) recovered above {:.1}: {:.2}",
                    self.period, self.oversold_level, current
                ),
            ));
        }

        if let Some(Crossover::Below) =
            indicators::level_cross_at(&rsi, self.overbought_level, last)
        {
            let confidence = 0.5 + (current - self.oversold_level).max(0.0) / 200.0;
            return Ok(sell_signal(
                symbol,
                bar,
                confidence,
                format!(
                    "RSI({}) fell below {:.1}: {:.2}",
                    self.period, self.overbought_level, current
                ),
            ));
        }

        Ok(hold_signal(symbol, bar, format!("RSI {:.2}", current)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::SignalAction;
    use crate::strategy::Strategy;
    use chrono::{Duration, NaiveDate};

    fn history(prices: &[f64]) -> Vec<PriceData> {
        let start = NaiveDate::from_ymd_opt(2023, 1, 2).unwrap();
        prices
            .iter()
            .enumerate()
            .map(|(i, &price)| PriceData::flat(start + Duration::days(i as i64), price, 1_000))
            .collect()
    }

    fn actions(strategy: &RsiStrategy, prices: &[f64]) -> Vec<SignalAction> {
        let bars = history(prices);
        let portfolio = Portfolio::new(1_000.0);
        (1..=bars.len())
            .map(|end| {
                strategy
                    .evaluate_signal(&bars[..end], &portfolio, "TEST")
                    .unwrap()
                    .signal
            })
            .collect()
    }

    #[test]
    fn buys_when_rsi_recovers_from_oversold() {
        let strategy = RsiStrategy::new(3, 30.0, 70.0);
        // steady decline pins RSI at 0, then a sharp rebound lifts it through 30
        let prices = [100.0, 98.0, 96.0, 94.0, 92.0, 90.0, 88.0, 95.0, 97.0];
        let actions = actions(&strategy, &prices);
        assert!(actions.contains(&SignalAction::Buy));
        assert!(!actions.contains(&SignalAction::Sell));
    }

    #[test]
    fn sells_when_rsi_falls_from_overbought() {
        let strategy = RsiStrategy::new(3, 30.0, 70.0);
        let prices = [50.0, 52.0, 54.0, 56.0, 58.0, 60.0, 62.0, 55.0, 53.0];
        let actions = actions(&strategy, &prices);
        assert!(actions.contains(&SignalAction::Sell));
        assert!(!actions.contains(&SignalAction::Buy));
    }

    #[test]
    fn short_history_holds() {
        let strategy = RsiStrategy::default();
        let actions = actions(&strategy, &[10.0, 11.0, 12.0]);
        assert!(actions.iter().all(|a| *a == SignalAction::Hold));
    }

    #[test]
    fn thresholds_are_validated() {
        assert!(RsiStrategy::new(14, 70.0, 30.0).validate_config().is_err());
        assert!(RsiStrategy::new(14, 30.0, 30.0).validate_config().is_err());
        assert!(RsiStrategy::new(0, 30.0, 70.0).validate_config().is_err());
        assert!(RsiStrategy::new(14, -5.0, 70.0).validate_config().is_err());
        assert!(RsiStrategy::default().is_valid());
    }

    #[test]
    fn configure_accepts_camel_case_levels() {
        let mut strategy = RsiStrategy::default();
        let mut params = HashMap::new();
        params.insert("oversoldLevel".to_string(), 25.0);
        params.insert("overbought".to_string(), 75.0);
        params.insert("period".to_string(), 10.0);
        strategy.configure(&params);
        assert_eq!(strategy.period, 10);
        assert_eq!(strategy.oversold_level, 25.0);
        assert_eq!(strategy.overbought_level, 75.0);
    }

    #[test]
    fn negative_or_fractional_period_is_rejected() {
        let mut params = HashMap::new();
        params.insert("period".to_string(), -14.0);
        let error = crate::strategy::create_strategy(RsiStrategy::NAME, &params)
            .err()
            .unwrap();
        assert_eq!(error.kind(), crate::error::ErrorKind::Validation);

        let mut strategy = RsiStrategy::default();
        let mut params = HashMap::new();
        params.insert("rsi_period".to_string(), 2.5);
        strategy.configure(&params);
        assert!(strategy.validate_config().is_err());
        assert_eq!(strategy.period, 14);
    }
}
