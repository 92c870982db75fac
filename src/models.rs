use crate::error::{EngineError, EngineResult};
use crate::portfolio::Order;
use anyhow::{anyhow, Result as AnyResult};
use chrono::NaiveDate;
use log::warn;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceData {
    pub date: NaiveDate,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: u64,
}

impl PriceData {
    pub fn flat(date: NaiveDate, price: f64, volume: u64) -> Self {
        Self {
            date,
            open: price,
            high: price,
            low: price,
            close: price,
            volume,
        }
    }
}

pub fn closes(history: &[PriceData]) -> Vec<f64> {
    history.iter().map(|bar| bar.close).collect()
}

/// Listing metadata used to decide whether a symbol may trade on a given day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SymbolListing {
    pub symbol: String,
    pub listed_on: NaiveDate,
    #[serde(default)]
    pub delisted_on: Option<NaiveDate>,
}

impl SymbolListing {
    pub fn is_active_on(&self, date: NaiveDate) -> bool {
        if date < self.listed_on {
            return false;
        }
        match self.delisted_on {
            Some(delisted) => date < delisted,
            None => true,
        }
    }

    pub fn overlaps(&self, start: NaiveDate, end: NaiveDate) -> bool {
        if self.listed_on > end {
            return false;
        }
        match self.delisted_on {
            Some(delisted) => delisted > start,
            None => true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SignalAction {
    Buy,
    Sell,
    Hold,
}

impl SignalAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignalAction::Buy => "BUY",
            SignalAction::Sell => "SELL",
            SignalAction::Hold => "HOLD",
        }
    }

    pub fn is_actionable(&self) -> bool {
        !matches!(self, SignalAction::Hold)
    }
}

impl FromStr for SignalAction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "buy" => Ok(SignalAction::Buy),
            "sell" => Ok(SignalAction::Sell),
            "hold" => Ok(SignalAction::Hold),
            other => Err(anyhow!("Unknown signal action '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradingSignal {
    pub symbol: String,
    pub signal: SignalAction,
    pub price: f64,
    pub date: NaiveDate,
    pub reason: String,
    pub confidence: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulationConfig {
    pub symbols: Vec<String>,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub starting_capital: f64,
    pub strategy_name: String,
    #[serde(default, deserialize_with = "deserialize_parameters_map")]
    pub strategy_parameters: HashMap<String, f64>,
}

impl SimulationConfig {
    pub fn validate(&self) -> EngineResult<()> {
        if self.symbols.is_empty() {
            return Err(EngineError::validation("at least one symbol is required"));
        }
        let mut seen = HashSet::new();
        for symbol in &self.symbols {
            if symbol.trim().is_empty() {
                return Err(EngineError::validation("symbol must not be empty"));
            }
            if !seen.insert(symbol.as_str()) {
                return Err(EngineError::validation(format!(
                    "symbol {} is listed more than once",
                    symbol
                )));
            }
        }
        if !self.starting_capital.is_finite() || self.starting_capital <= 0.0 {
            return Err(EngineError::validation(format!(
                "starting capital must be positive (got {})",
                self.starting_capital
            )));
        }
        if self.start_date > self.end_date {
            return Err(EngineError::validation(format!(
                "start date {} is after end date {}",
                self.start_date, self.end_date
            )));
        }
        if self.strategy_name.trim().is_empty() {
            return Err(EngineError::validation("strategy name must not be empty"));
        }
        Ok(())
    }

    /// Inclusive number of calendar days covered by the window.
    pub fn date_range_days(&self) -> i64 {
        if self.end_date < self.start_date {
            return 0;
        }
        (self.end_date - self.start_date).num_days() + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EquityPoint {
    pub date: NaiveDate,
    pub value: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PerformanceMetrics {
    pub total_return_pct: f64,
    pub total_trades: usize,
    pub winning_trades: usize,
    pub losing_trades: usize,
    pub win_rate: f64,
    pub max_drawdown: f64,
    pub sharpe_ratio: Option<f64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BacktestResult {
    pub symbols: Vec<String>,
    pub strategy_name: String,
    pub start_date: NaiveDate,
    pub end_date: NaiveDate,
    pub starting_capital: f64,
    pub ending_value: f64,
    #[serde(flatten)]
    pub metrics: PerformanceMetrics,
    pub equity_curve: Vec<EquityPoint>,
    pub trades: Vec<Order>,
    pub signals_generated: Vec<TradingSignal>,
    #[serde(default)]
    pub warnings: Vec<String>,
    #[serde(default)]
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

fn normalize_parameter_map(raw: HashMap<String, Value>) -> HashMap<String, f64> {
    let mut cleaned = HashMap::with_capacity(raw.len());

    for (key, value) in raw.into_iter() {
        if let Some(num) = value.as_f64() {
            if num.is_finite() {
                cleaned.insert(key, num);
            } else {
                warn!(
                    "Skipping parameter `{}` due to non-finite numeric value {}",
                    key, value
                );
            }
            continue;
        }

        if let Some(text) = value.as_str() {
            match text.trim().parse::<f64>() {
                Ok(parsed) if parsed.is_finite() => {
                    cleaned.insert(key, parsed);
                }
                _ => {
                    warn!(
                        "Skipping parameter `{}` due to non-numeric string value {:?}",
                        key, text
                    );
                }
            }
            continue;
        }

        if let Some(boolean) = value.as_bool() {
            cleaned.insert(key, if boolean { 1.0 } else { 0.0 });
            continue;
        }

        if value.is_null() {
            warn!("Skipping parameter `{}` due to null value", key);
        } else {
            warn!(
                "Skipping parameter `{}` due to unsupported composite value {}",
                key, value
            );
        }
    }

    cleaned
}

fn deserialize_parameters_map<'de, D>(deserializer: D) -> Result<HashMap<String, f64>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = HashMap::<String, Value>::deserialize(deserializer)?;
    Ok(normalize_parameter_map(raw))
}

pub fn parse_parameter_map_from_json(json: &str) -> AnyResult<HashMap<String, f64>> {
    let raw: HashMap<String, Value> =
        serde_json::from_str(json).map_err(|error| anyhow!("Invalid parameter JSON: {}", error))?;
    Ok(normalize_parameter_map(raw))
}
