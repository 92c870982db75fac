use crate::config::EngineSettings;
use crate::error::{EngineError, EngineResult, ErrorKind};
use crate::execution::{ExecutionOutcome, ExecutionService, PricingContext};
use crate::market_data::MarketDataAccess;
use crate::models::{BacktestResult, EquityPoint, PriceData, SimulationConfig};
use crate::performance::{ResultCalculator, RunRecord};
use crate::portfolio::Portfolio;
use crate::progress::{NullProgressSink, ProgressReporter, ProgressSink, RunStatus};
use crate::strategy::{Strategy, StrategyRegistry};
use crate::temporal::TemporalValidator;
use chrono::{Duration, NaiveDate};
use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Bars handed to a strategy per evaluation, unless it asks for more.
const DEFAULT_LOOKBACK_BARS: usize = 250;

#[derive(Clone, Default, Debug)]
pub struct CancellationFlag(Arc<AtomicBool>);

impl CancellationFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Price history of one symbol plus the index of the first bar after the current day.
struct SymbolSeries {
    bars: Vec<PriceData>,
    cursor: usize,
}

impl SymbolSeries {
    /// Moves the cursor past every bar dated on or before `date` and returns today's bar, if any.
    fn advance_to(&mut self, date: NaiveDate) -> Option<&PriceData> {
        while self.cursor < self.bars.len() && self.bars[self.cursor].date <= date {
            self.cursor += 1;
        }
        self.bars[..self.cursor]
            .last()
            .filter(|bar| bar.date == date)
    }

    fn last_close(&self) -> Option<f64> {
        self.bars[..self.cursor].last().map(|bar| bar.close)
    }

    fn window(&self, length: usize) -> &[PriceData] {
        &self.bars[self.cursor.saturating_sub(length)..self.cursor]
    }
}

/// Day-by-day driver for a single job. Strictly sequential in simulated time.
pub struct SimulationLoop<'a> {
    config: &'a SimulationConfig,
    data: &'a dyn MarketDataAccess,
    registry: StrategyRegistry,
    settings: EngineSettings,
    sink: &'a dyn ProgressSink,
    cancel: CancellationFlag,
}

impl<'a> SimulationLoop<'a> {
    pub fn new(config: &'a SimulationConfig, data: &'a dyn MarketDataAccess) -> Self {
        Self {
            config,
            data,
            registry: StrategyRegistry::with_builtin(),
            settings: EngineSettings::default(),
            sink: &NullProgressSink,
            cancel: CancellationFlag::new(),
        }
    }

    pub fn with_registry(mut self, registry: StrategyRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_settings(mut self, settings: EngineSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_progress(mut self, sink: &'a dyn ProgressSink) -> Self {
        self.sink = sink;
        self
    }

    pub fn with_cancellation(mut self, cancel: CancellationFlag) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn run(self) -> EngineResult<BacktestResult> {
        let config = self.config;
        config.validate()?;
        let strategy = self
            .registry
            .create(&config.strategy_name, &config.strategy_parameters)?;
        let lookback = strategy.min_data_points().max(DEFAULT_LOOKBACK_BARS);

        let mut record = RunRecord::default();
        let mut series = self.load_series(strategy.as_ref(), &mut record.errors);
        let trading_days: Vec<NaiveDate> = series
            .values()
            .flat_map(|symbol_series| symbol_series.bars.iter().map(|bar| bar.date))
            .filter(|date| *date >= config.start_date && *date <= config.end_date)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        if trading_days.is_empty() {
            return Err(EngineError::MissingData(format!(
                "no price data for any of {} between {} and {}",
                config.symbols.join(", "),
                config.start_date,
                config.end_date
            )));
        }

        let mut validator = TemporalValidator::new(self.data);
        for symbol in &config.symbols {
            if validator.has_metadata(symbol)
                && !validator.listed_within(symbol, config.start_date, config.end_date)
            {
                let message = format!(
                    "{}: {} was never listed between {} and {}",
                    ErrorKind::Temporal,
                    symbol,
                    config.start_date,
                    config.end_date
                );
                warn!("{}", message);
                record.warnings.push(message);
            }
        }

        info!(
            "Simulating {} on {} symbol(s) over {} trading days",
            strategy.name(),
            config.symbols.len(),
            trading_days.len()
        );

        let mut portfolio =
            Portfolio::with_commission(config.starting_capital, self.settings.commission);
        let mut executor = ExecutionService::new(self.settings.execution_settings());
        let mut reporter = ProgressReporter::new(self.sink, self.settings.progress_interval_pct);
        let mut last_prices: HashMap<String, f64> = HashMap::new();
        let mut last_date = config.start_date;

        for (day_index, &date) in trading_days.iter().enumerate() {
            if self.cancel.is_cancelled() {
                info!("Simulation cancelled before {}", date);
                record.cancelled = true;
                break;
            }

            for symbol in &config.symbols {
                let Some(symbol_series) = series.get_mut(symbol) else {
                    continue;
                };
                let has_bar_today = symbol_series.advance_to(date).is_some();
                if let Some(close) = symbol_series.last_close() {
                    last_prices.insert(symbol.clone(), close);
                }

                let tradeable = validator.is_tradeable(symbol, date);
                if !tradeable {
                    if portfolio.has_position(symbol) {
                        Self::force_liquidate(
                            &mut executor,
                            &mut portfolio,
                            symbol,
                            date,
                            last_prices.get(symbol).copied(),
                            &mut record,
                        );
                    }
                    continue;
                }
                if !has_bar_today {
                    continue;
                }

                let window = symbol_series.window(lookback);
                let signal = match strategy.evaluate_signal(window, &portfolio, symbol) {
                    Ok(signal) => signal,
                    Err(error) => {
                        record
                            .errors
                            .push(format!("{} {}: {}", symbol, date, error.tagged_message()));
                        continue;
                    }
                };
                if !signal.signal.is_actionable() {
                    continue;
                }

                let pricing = PricingContext {
                    date,
                    prices: &last_prices,
                };
                match executor.execute_signal(&signal, symbol, &mut portfolio, &pricing) {
                    Ok(ExecutionOutcome::NoOp { reason, .. }) => {
                        debug!("{} {} {}: {}", symbol, date, signal.signal.as_str(), reason);
                    }
                    Ok(outcome) => {
                        if let Some(order) = outcome.into_order() {
                            record.trades.push(order);
                        }
                    }
                    Err(error) => {
                        record
                            .errors
                            .push(format!("{} {}: {}", symbol, date, error.tagged_message()));
                    }
                }
                record.signals_generated.push(signal);
            }

            let value = match portfolio.total_value(&last_prices) {
                Ok(value) => value,
                Err(error) => {
                    record
                        .errors
                        .push(format!("{}: {}", date, error.tagged_message()));
                    record
                        .equity_curve
                        .last()
                        .map(|point| point.value)
                        .unwrap_or(config.starting_capital)
                }
            };
            record.equity_curve.push(EquityPoint { date, value });
            last_date = date;
            reporter.day_completed(day_index + 1, trading_days.len(), date);
        }

        record.warnings.extend(validator.take_warnings());
        let simulated = record.equity_curve.len();
        if record.cancelled {
            let pct = simulated as f64 * 100.0 / trading_days.len() as f64;
            reporter.finish(RunStatus::Cancelled, pct, last_date);
        } else {
            reporter.finish(RunStatus::Completed, 100.0, last_date);
        }

        let result =
            ResultCalculator::new(self.settings.risk_free_rate).build_result(config, record);
        info!(
            "Simulation finished: {} days, {} trades, ending value {:.2}",
            simulated,
            result.trades.len(),
            result.ending_value
        );
        Ok(result)
    }

    /// Fetches each symbol's history from far enough before `start_date` that indicators are
    /// defined on the first simulated day.
    fn load_series(
        &self,
        strategy: &dyn Strategy,
        errors: &mut Vec<String>,
    ) -> BTreeMap<String, SymbolSeries> {
        let warmup_bars = strategy.min_data_points() as i64;
        let warmup_days = warmup_bars * 7 / 5 + 10;
        let history_start = self.config.start_date - Duration::days(warmup_days);

        let mut series = BTreeMap::new();
        for symbol in &self.config.symbols {
            match self
                .data
                .historical_prices(symbol, history_start, self.config.end_date)
            {
                Ok(bars) => {
                    series.insert(symbol.clone(), SymbolSeries { bars, cursor: 0 });
                }
                Err(error) => {
                    warn!("Skipping {}: {}", symbol, error);
                    errors.push(format!("{}: {}", symbol, error.tagged_message()));
                }
            }
        }
        series
    }

    fn force_liquidate(
        executor: &mut ExecutionService,
        portfolio: &mut Portfolio,
        symbol: &str,
        date: NaiveDate,
        last_price: Option<f64>,
        record: &mut RunRecord,
    ) {
        let Some(price) = last_price else {
            record.errors.push(format!(
                "{} {}: {}",
                symbol,
                date,
                EngineError::StaleValuation {
                    symbol: symbol.to_string()
                }
                .tagged_message()
            ));
            return;
        };
        let reason = "forced liquidation: no longer tradeable";
        match executor.liquidate(portfolio, symbol, price, date, reason) {
            Ok(Some(outcome)) => {
                info!("Force-liquidated {} on {} at {:.2}", symbol, date, price);
                if let Some(order) = outcome.into_order() {
                    record.trades.push(order);
                }
            }
            Ok(None) => {}
            Err(error) => {
                record
                    .errors
                    .push(format!("{} {}: {}", symbol, date, error.tagged_message()));
            }
        }
    }
}

/// Runs one job with default registry and the given settings.
pub fn run_simulation(
    config: &SimulationConfig,
    data: &dyn MarketDataAccess,
    settings: &EngineSettings,
    sink: &dyn ProgressSink,
    cancel: CancellationFlag,
) -> EngineResult<BacktestResult> {
    SimulationLoop::new(config, data)
        .with_settings(settings.clone())
        .with_progress(sink)
        .with_cancellation(cancel)
        .run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::market_data::MarketData;
    use crate::models::{SignalAction, SymbolListing};
    use crate::portfolio::OrderSide;

    fn day(offset: i64) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, 1).unwrap() + Duration::days(offset)
    }

    fn data_with(symbol: &str, closes: &[f64], delisted_on: Option<NaiveDate>) -> MarketData {
        let mut data = MarketData::new();
        data.insert_series(
            symbol,
            closes
                .iter()
                .enumerate()
                .map(|(i, close)| PriceData::flat(day(i as i64), *close, 1_000))
                .collect(),
        );
        data.insert_listing(SymbolListing {
            symbol: symbol.to_string(),
            listed_on: day(0),
            delisted_on,
        });
        data
    }

    fn ma_config(symbols: &[&str], days: i64) -> SimulationConfig {
        let mut parameters = HashMap::new();
        parameters.insert("short_period".to_string(), 2.0);
        parameters.insert("long_period".to_string(), 4.0);
        SimulationConfig {
            symbols: symbols.iter().map(|s| s.to_string()).collect(),
            start_date: day(0),
            end_date: day(days - 1),
            starting_capital: 10_000.0,
            strategy_name: "moving_average_crossover".to_string(),
            strategy_parameters: parameters,
        }
    }

    #[test]
    fn equity_curve_has_one_point_per_trading_day() {
        let closes: Vec<f64> = (0..30).map(|i| 100.0 + (i as f64 * 0.5).sin() * 5.0).collect();
        let data = data_with("AAA", &closes, None);
        let config = ma_config(&["AAA"], 30);
        let result = SimulationLoop::new(&config, &data).run().unwrap();
        assert_eq!(result.equity_curve.len(), 30);
        assert!(!result.cancelled);
        assert!(result
            .signals_generated
            .iter()
            .all(|signal| signal.signal != SignalAction::Hold));
    }

    #[test]
    fn delisting_forces_liquidation_at_last_close() {
        // crosses up at index 5, then the symbol is delisted at day 9
        let closes = [10.0, 9.0, 8.0, 7.0, 6.0, 10.0, 12.0, 13.0, 14.0];
        let mut data = data_with("GONE", &closes, Some(day(9)));
        data.insert_series(
            "STAY",
            (0..12).map(|i| PriceData::flat(day(i), 50.0, 1_000)).collect(),
        );
        data.insert_listing(SymbolListing {
            symbol: "STAY".to_string(),
            listed_on: day(0),
            delisted_on: None,
        });

        let config = ma_config(&["GONE", "STAY"], 12);
        let result = SimulationLoop::new(&config, &data).run().unwrap();

        let buys: Vec<_> = result
            .trades
            .iter()
            .filter(|order| order.symbol == "GONE" && order.side == OrderSide::Buy)
            .collect();
        let sells: Vec<_> = result
            .trades
            .iter()
            .filter(|order| order.symbol == "GONE" && order.side == OrderSide::Sell)
            .collect();
        assert_eq!(buys.len(), 1);
        assert_eq!(sells.len(), 1);
        assert_eq!(sells[0].date, day(9));
        assert_eq!(sells[0].price, 14.0);
        assert!(sells[0].reason.contains("forced liquidation"));
        assert_eq!(result.equity_curve.len(), 12);
    }

    #[test]
    fn missing_metadata_means_no_trades_and_a_warning() {
        let closes = [10.0, 9.0, 8.0, 7.0, 6.0, 10.0, 12.0, 13.0];
        let mut data = MarketData::new();
        data.insert_series(
            "NOMETA",
            closes
                .iter()
                .enumerate()
                .map(|(i, close)| PriceData::flat(day(i as i64), *close, 1_000))
                .collect(),
        );
        let config = ma_config(&["NOMETA"], 8);
        let result = SimulationLoop::new(&config, &data).run().unwrap();
        assert!(result.trades.is_empty());
        assert_eq!(result.warnings.len(), 1);
        assert_eq!(result.equity_curve.len(), 8);
        assert!(result.equity_curve.iter().all(|point| point.value == 10_000.0));
    }

    #[test]
    fn never_listed_symbol_is_a_warning_not_an_error() {
        let mut data = data_with("AAA", &[10.0; 10], None);
        data.insert_listing(SymbolListing {
            symbol: "LATE".to_string(),
            listed_on: day(100),
            delisted_on: None,
        });
        data.insert_series("LATE", vec![PriceData::flat(day(100), 5.0, 1)]);
        let config = ma_config(&["AAA", "LATE"], 10);
        let result = SimulationLoop::new(&config, &data).run().unwrap();
        assert!(result.warnings.iter().any(|w| w.contains("LATE")));
        assert!(result.error_message.is_none());
    }

    #[test]
    fn no_data_for_any_symbol_is_fatal() {
        let data = MarketData::new();
        let config = ma_config(&["AAA"], 10);
        let error = SimulationLoop::new(&config, &data).run().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Data);
    }

    #[test]
    fn invalid_configuration_is_rejected_before_simulating() {
        let data = data_with("AAA", &[10.0; 10], None);
        let mut config = ma_config(&["AAA"], 10);
        config.starting_capital = -100.0;
        let error = SimulationLoop::new(&config, &data).run().unwrap_err();
        assert_eq!(error.kind(), ErrorKind::Validation);

        let mut config = ma_config(&["AAA"], 10);
        config.strategy_name = "unknown".to_string();
        assert!(matches!(
            SimulationLoop::new(&config, &data).run(),
            Err(EngineError::UnknownStrategy(_))
        ));
    }

    #[test]
    fn cancelled_flag_stops_before_first_day() {
        let data = data_with("AAA", &[10.0; 10], None);
        let config = ma_config(&["AAA"], 10);
        let cancel = CancellationFlag::new();
        cancel.cancel();
        let result = SimulationLoop::new(&config, &data)
            .with_cancellation(cancel)
            .run()
            .unwrap();
        assert!(result.cancelled);
        assert!(result.equity_curve.is_empty());
        assert_eq!(result.ending_value, 10_000.0);
    }
}
