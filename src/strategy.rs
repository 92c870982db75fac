use crate::error::{EngineError, EngineResult};
use crate::models::{PriceData, TradingSignal};
use crate::portfolio::Portfolio;
use std::collections::{BTreeMap, HashMap};

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;

    fn configure(&mut self, parameters: &HashMap<String, f64>);

    fn validate_config(&self) -> EngineResult<()>;

    fn is_valid(&self) -> bool {
        self.validate_config().is_ok()
    }

    /// Bars of history the strategy needs before it can emit anything but HOLD.
    fn min_data_points(&self) -> usize;

    /// Evaluates the last bar of `history`. `history` must be ascending and end on the
    /// evaluation day; nothing after it is visible to the strategy.
    fn evaluate_signal(
        &self,
        history: &[PriceData],
        portfolio: &Portfolio,
        symbol: &str,
    ) -> EngineResult<TradingSignal>;
}

#[path = "strategies/ma_crossover.rs"]
pub mod ma_crossover;

pub use ma_crossover::MovingAverageCrossoverStrategy;

#[path = "strategies/rsi.rs"]
pub mod rsi;

pub use rsi::RsiStrategy;

pub type StrategyFactory = fn() -> Box<dyn Strategy>;

#[derive(Clone, Default)]
pub struct StrategyRegistry {
    factories: BTreeMap<String, StrategyFactory>,
}

impl StrategyRegistry {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn with_builtin() -> Self {
        let mut registry = Self::empty();
        registry.register(MovingAverageCrossoverStrategy::NAME, || {
            Box::new(MovingAverageCrossoverStrategy::default())
        });
        registry.register("ma_crossover", || {
            Box::new(MovingAverageCrossoverStrategy::default())
        });
        registry.register("sma_crossover", || {
            Box::new(MovingAverageCrossoverStrategy::default())
        });
        registry.register(RsiStrategy::NAME, || Box::new(RsiStrategy::default()));
        registry
    }

    pub fn register(&mut self, name: &str, factory: StrategyFactory) {
        self.factories.insert(normalize_name(name), factory);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(&normalize_name(name))
    }

    /// Builds, configures and validates a strategy. Invalid parameter combinations are
    /// rejected here, before any simulation starts.
    pub fn create(
        &self,
        name: &str,
        parameters: &HashMap<String, f64>,
    ) -> EngineResult<Box<dyn Strategy>> {
        let factory = self
            .factories
            .get(&normalize_name(name))
            .ok_or_else(|| EngineError::UnknownStrategy(name.to_string()))?;
        let mut strategy = factory();
        strategy.configure(parameters);
        strategy.validate_config()?;
        Ok(strategy)
    }
}

fn normalize_name(name: &str) -> String {
    name.trim().to_ascii_lowercase().replace('-', "_")
}

pub fn create_strategy(
    name: &str,
    parameters: &HashMap<String, f64>,
) -> EngineResult<Box<dyn Strategy>> {
    StrategyRegistry::with_builtin().create(name, parameters)
}
