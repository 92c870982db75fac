use crate::market_data::{generate_synthetic, SyntheticDataSpec};
use anyhow::{anyhow, Result};
use chrono::NaiveDate;
use log::info;
use std::collections::BTreeMap;
use std::path::Path;

/// Parses `SYMBOL=YYYY-MM-DD` delisting overrides.
pub fn parse_delisting(raw: &str) -> Result<(String, NaiveDate)> {
    let (symbol, date) = raw
        .split_once('=')
        .ok_or_else(|| anyhow!("Delisting must look like SYMBOL=YYYY-MM-DD (value: {})", raw))?;
    let symbol = symbol.trim();
    if symbol.is_empty() {
        return Err(anyhow!("Delisting is missing a symbol (value: {})", raw));
    }
    let date = NaiveDate::parse_from_str(date.trim(), "%Y-%m-%d")
        .map_err(|_| anyhow!("Delisting date must be YYYY-MM-DD (value: {})", raw))?;
    Ok((symbol.to_string(), date))
}

pub fn run(
    output_path: &Path,
    symbols: Vec<String>,
    start: NaiveDate,
    end: NaiveDate,
    seed: u64,
    delistings: &[String],
) -> Result<()> {
    if symbols.is_empty() {
        return Err(anyhow!("At least one symbol is required"));
    }
    let mut spec = SyntheticDataSpec::new(symbols, start, end, seed);
    spec.delistings = delistings
        .iter()
        .map(|raw| parse_delisting(raw))
        .collect::<Result<BTreeMap<_, _>>>()?;

    info!(
        "Generating synthetic market data for {} symbol(s), {} to {}, seed {}",
        spec.symbols.len(),
        start,
        end,
        seed
    );
    let market_data = generate_synthetic(&spec)?;
    market_data.save_to_file(output_path)?;
    info!(
        "Market data snapshot written to {} ({} bars)",
        output_path.display(),
        market_data.bar_count()
    );
    Ok(())
}
