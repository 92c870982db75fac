use crate::error::ErrorKind;
use crate::market_data::MarketDataAccess;
use crate::models::SymbolListing;
use chrono::NaiveDate;
use log::warn;
use std::collections::{BTreeMap, BTreeSet};

/// Decides whether a symbol may be evaluated or held on a given day.
///
/// Listing lookups are cached for the lifetime of the validator. A symbol without listing
/// metadata is never tradeable; the first such lookup is recorded as a warning.
pub struct TemporalValidator<'a> {
    source: &'a dyn MarketDataAccess,
    listings: BTreeMap<String, Option<SymbolListing>>,
    unresolved: BTreeSet<String>,
    warnings: Vec<String>,
}

impl<'a> TemporalValidator<'a> {
    pub fn new(source: &'a dyn MarketDataAccess) -> Self {
        Self {
            source,
            listings: BTreeMap::new(),
            unresolved: BTreeSet::new(),
            warnings: Vec::new(),
        }
    }

    fn lookup(&mut self, symbol: &str) -> Option<&SymbolListing> {
        if !self.listings.contains_key(symbol) {
            let listing = self.source.listing(symbol);
            if listing.is_none() && self.unresolved.insert(symbol.to_string()) {
                let message = format!(
                    "{}: no listing metadata for {}; treating it as not tradeable",
                    ErrorKind::Temporal,
                    symbol
                );
                warn!("{}", message);
                self.warnings.push(message);
            }
            self.listings.insert(symbol.to_string(), listing);
        }
        self.listings.get(symbol).and_then(Option::as_ref)
    }

    pub fn has_metadata(&mut self, symbol: &str) -> bool {
        self.lookup(symbol).is_some()
    }

    pub fn is_tradeable(&mut self, symbol: &str, date: NaiveDate) -> bool {
        self.lookup(symbol)
            .map(|listing| listing.is_active_on(date))
            .unwrap_or(false)
    }

    /// True when the symbol is listed on at least one day of `[start, end]`.
    pub fn listed_within(&mut self, symbol: &str, start: NaiveDate, end: NaiveDate) -> bool {
        self.lookup(symbol)
            .map(|listing| listing.overlaps(start, end))
            .unwrap_or(false)
    }

    pub fn take_warnings(&mut self) -> Vec<String> {
        std::mem::take(&mut self.warnings)
    }
}
