use crate::error::{EngineError, EngineResult};
use crate::models::{PriceData, SymbolListing};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc, Weekday};
use log::info;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::Path;

const MARKET_DATA_SNAPSHOT_VERSION: u32 = 1;

/// Source of price history and listing metadata for a simulation.
pub trait MarketDataAccess: Send + Sync {
    /// Bars for `symbol` dated within `[start, end]`, ascending by date.
    fn historical_prices(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<PriceData>>;

    fn listing(&self, symbol: &str) -> Option<SymbolListing>;

    fn is_tradeable(&self, symbol: &str, date: NaiveDate) -> bool {
        self.listing(symbol)
            .map(|listing| listing.is_active_on(date))
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotFormat {
    Bincode,
    Json,
}

impl SnapshotFormat {
    pub fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => SnapshotFormat::Json,
            _ => SnapshotFormat::Bincode,
        }
    }
}

#[derive(Serialize, Deserialize)]
struct MarketDataSnapshot {
    version: u32,
    generated_at: DateTime<Utc>,
    prices: BTreeMap<String, Vec<PriceData>>,
    #[serde(default)]
    listings: BTreeMap<String, SymbolListing>,
}

/// In-memory market data, usually loaded from a snapshot file.
#[derive(Debug, Clone, Default)]
pub struct MarketData {
    prices: BTreeMap<String, Vec<PriceData>>,
    listings: BTreeMap<String, SymbolListing>,
}

impl MarketData {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a price series, sorted ascending with duplicate dates collapsed to the last bar.
    pub fn insert_series(&mut self, symbol: &str, mut bars: Vec<PriceData>) {
        bars.sort_by_key(|bar| bar.date);
        let mut deduped: Vec<PriceData> = Vec::with_capacity(bars.len());
        for bar in bars {
            match deduped.last_mut() {
                Some(last) if last.date == bar.date => *last = bar,
                _ => deduped.push(bar),
            }
        }
        self.prices.insert(symbol.to_string(), deduped);
    }

    pub fn insert_listing(&mut self, listing: SymbolListing) {
        self.listings.insert(listing.symbol.clone(), listing);
    }

    pub fn symbols(&self) -> Vec<&str> {
        self.prices.keys().map(String::as_str).collect()
    }

    pub fn series(&self, symbol: &str) -> Option<&[PriceData]> {
        self.prices.get(symbol).map(Vec::as_slice)
    }

    pub fn bar_count(&self) -> usize {
        self.prices.values().map(Vec::len).sum()
    }

    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).with_context(|| {
            format!("Failed to open market data snapshot at {}", path.display())
        })?;
        let reader = BufReader::new(file);
        let snapshot: MarketDataSnapshot = match SnapshotFormat::from_path(path) {
            SnapshotFormat::Json => {
                serde_json::from_reader(reader).context("Snapshot JSON decode failed")?
            }
            SnapshotFormat::Bincode => {
                bincode::deserialize_from(reader).context("Snapshot decode failed")?
            }
        };

        if snapshot.version != MARKET_DATA_SNAPSHOT_VERSION {
            return Err(anyhow!(
                "Market data snapshot version mismatch (found {}, expected {})",
                snapshot.version,
                MARKET_DATA_SNAPSHOT_VERSION
            ));
        }

        let mut market_data = Self::new();
        for (symbol, bars) in snapshot.prices {
            market_data.insert_series(&symbol, bars);
        }
        for (_, listing) in snapshot.listings {
            market_data.insert_listing(listing);
        }
        if market_data.prices.is_empty() {
            return Err(anyhow!(
                "Market data snapshot at {} has no price series",
                path.display()
            ));
        }

        info!(
            "Loaded market data snapshot from {} ({} symbols, {} bars)",
            path.display(),
            market_data.prices.len(),
            market_data.bar_count()
        );
        Ok(market_data)
    }

    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).with_context(|| {
                    format!("Failed to create snapshot directory {}", parent.display())
                })?;
            }
        }

        let file = File::create(path).with_context(|| {
            format!(
                "Unable to create market data snapshot at {}",
                path.display()
            )
        })?;
        let mut writer = BufWriter::new(file);
        let snapshot = MarketDataSnapshot {
            version: MARKET_DATA_SNAPSHOT_VERSION,
            generated_at: Utc::now(),
            prices: self.prices.clone(),
            listings: self.listings.clone(),
        };
        match SnapshotFormat::from_path(path) {
            SnapshotFormat::Json => serde_json::to_writer(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot as JSON")?,
            SnapshotFormat::Bincode => bincode::serialize_into(&mut writer, &snapshot)
                .context("Failed to serialize market data snapshot")?,
        }
        writer
            .flush()
            .context("Failed to flush market data snapshot to disk")?;
        Ok(())
    }
}

impl MarketDataAccess for MarketData {
    fn historical_prices(
        &self,
        symbol: &str,
        start: NaiveDate,
        end: NaiveDate,
    ) -> EngineResult<Vec<PriceData>> {
        let bars = self.prices.get(symbol).ok_or_else(|| {
            EngineError::MissingData(format!("no price history for {}", symbol))
        })?;
        if start > end {
            return Ok(Vec::new());
        }
        let from = bars.partition_point(|bar| bar.date < start);
        let to = bars.partition_point(|bar| bar.date <= end);
        Ok(bars[from..to].to_vec())
    }

    fn listing(&self, symbol: &str) -> Option<SymbolListing> {
        self.listings.get(symbol).cloned()
    }
}

/// Parameters for deterministic synthetic data.
#[derive(Debug, Clone)]
pub struct SyntheticDataSpec {
    pub symbols: Vec<String>,
    pub start: NaiveDate,
    pub end: NaiveDate,
    pub seed: u64,
    pub start_price: f64,
    pub daily_volatility: f64,
    pub delistings: BTreeMap<String, NaiveDate>,
}

impl SyntheticDataSpec {
    pub fn new(symbols: Vec<String>, start: NaiveDate, end: NaiveDate, seed: u64) -> Self {
        Self {
            symbols,
            start,
            end,
            seed,
            start_price: 100.0,
            daily_volatility: 0.02,
            delistings: BTreeMap::new(),
        }
    }
}

fn is_weekday(date: NaiveDate) -> bool {
    !matches!(date.weekday(), Weekday::Sat | Weekday::Sun)
}

/// Weekday-only random walk per symbol. The same spec always yields the same data.
pub fn generate_synthetic(spec: &SyntheticDataSpec) -> Result<MarketData> {
    if spec.start > spec.end {
        return Err(anyhow!(
            "Start date {} is after end date {}",
            spec.start,
            spec.end
        ));
    }
    if !(spec.start_price.is_finite() && spec.start_price > 0.0) {
        return Err(anyhow!("Start price must be positive"));
    }

    let mut market_data = MarketData::new();
    for (index, symbol) in spec.symbols.iter().enumerate() {
        let mut rng = StdRng::seed_from_u64(spec.seed.wrapping_add(index as u64 * 7_919));
        let delisted_on = spec.delistings.get(symbol).copied();
        let mut bars = Vec::new();
        let mut close = spec.start_price * rng.gen_range(0.5..1.5);
        let mut date = spec.start;
        while date <= spec.end {
            if delisted_on.map_or(false, |delisted| date >= delisted) {
                break;
            }
            if is_weekday(date) {
                let open = close;
                let change = rng.gen_range(-spec.daily_volatility..spec.daily_volatility);
                close = (open * (1.0 + change)).max(0.01);
                let wick = spec.daily_volatility / 2.0;
                let high = open.max(close) * (1.0 + rng.gen_range(0.0..wick));
                let low = open.min(close) * (1.0 - rng.gen_range(0.0..wick));
                bars.push(PriceData {
                    date,
                    open,
                    high,
                    low,
                    close,
                    volume: rng.gen_range(100_000..5_000_000),
                });
            }
            date += Duration::days(1);
        }

        market_data.insert_series(symbol, bars);
        market_data.insert_listing(SymbolListing {
            symbol: symbol.clone(),
            listed_on: spec.start,
            delisted_on,
        });
    }

    Ok(market_data)
}
