use crate::error::{EngineError, EngineResult};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};

const CASH_EPSILON: f64 = 1e-9;

/// Flat plus proportional commission charged on every fill.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct CommissionModel {
    pub flat: f64,
    pub pct: f64,
}

impl CommissionModel {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn commission_for(&self, trade_value: f64) -> f64 {
        (self.flat + trade_value.abs() * self.pct).max(0.0)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub shares: u64,
    pub average_cost: f64,
}

impl Position {
    pub fn market_value(&self, price: f64) -> f64 {
        self.shares as f64 * price
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Pending,
    Filled,
    Rejected { reason: String },
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "pending",
            OrderStatus::Filled => "filled",
            OrderStatus::Rejected { .. } => "rejected",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, OrderStatus::Pending)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub symbol: String,
    #[serde(rename = "type")]
    pub side: OrderSide,
    pub shares: u64,
    pub price: f64,
    pub date: NaiveDate,
    pub status: OrderStatus,
    #[serde(default)]
    pub commission: f64,
    #[serde(default)]
    pub realized_pnl: Option<f64>,
    #[serde(default)]
    pub reason: String,
}

impl Order {
    pub fn new(
        id: u64,
        symbol: &str,
        side: OrderSide,
        shares: u64,
        price: f64,
        date: NaiveDate,
        reason: impl Into<String>,
    ) -> Self {
        Self {
            id,
            symbol: symbol.to_string(),
            side,
            shares,
            price,
            date,
            status: OrderStatus::Pending,
            commission: 0.0,
            realized_pnl: None,
            reason: reason.into(),
        }
    }

    pub fn is_filled(&self) -> bool {
        matches!(self.status, OrderStatus::Filled)
    }

    pub fn fill(&mut self, commission: f64, realized_pnl: Option<f64>) -> EngineResult<()> {
        self.ensure_pending()?;
        self.commission = commission;
        self.realized_pnl = realized_pnl;
        self.status = OrderStatus::Filled;
        Ok(())
    }

    pub fn reject<S: Into<String>>(&mut self, reason: S) -> EngineResult<()> {
        self.ensure_pending()?;
        self.status = OrderStatus::Rejected {
            reason: reason.into(),
        };
        Ok(())
    }

    fn ensure_pending(&self) -> EngineResult<()> {
        if self.status.is_terminal() {
            return Err(EngineError::OrderFinalized {
                order_id: self.id,
                status: self.status.as_str().to_string(),
            });
        }
        Ok(())
    }
}

/// Cash plus open positions. Positions are kept in a `BTreeMap` so iteration order is stable
/// across runs.
#[derive(Debug, Clone)]
pub struct Portfolio {
    cash: f64,
    initial_capital: f64,
    positions: BTreeMap<String, Position>,
    commission: CommissionModel,
}

impl Portfolio {
    pub fn new(initial_capital: f64) -> Self {
        Self::with_commission(initial_capital, CommissionModel::zero())
    }

    pub fn with_commission(initial_capital: f64, commission: CommissionModel) -> Self {
        Self {
            cash: initial_capital,
            initial_capital,
            positions: BTreeMap::new(),
            commission,
        }
    }

    pub fn cash(&self) -> f64 {
        self.cash
    }

    pub fn initial_capital(&self) -> f64 {
        self.initial_capital
    }

    pub fn position(&self, symbol: &str) -> Option<&Position> {
        self.positions.get(symbol)
    }

    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions.contains_key(symbol)
    }

    pub fn positions(&self) -> impl Iterator<Item = &Position> {
        self.positions.values()
    }

    /// Buys `shares` at `price`, charging commission on top of the cost. Returns the commission.
    pub fn buy(&mut self, symbol: &str, shares: u64, price: f64) -> EngineResult<f64> {
        Self::validate_trade(symbol, shares, price)?;

        let cost = shares as f64 * price;
        let commission = self.commission.commission_for(cost);
        let required = cost + commission;
        if required > self.cash + CASH_EPSILON {
            return Err(EngineError::InsufficientFunds {
                required,
                available: self.cash,
            });
        }

        self.cash = (self.cash - required).max(0.0);
        let position = self
            .positions
            .entry(symbol.to_string())
            .or_insert_with(|| Position {
                symbol: symbol.to_string(),
                shares: 0,
                average_cost: 0.0,
            });
        let old_shares = position.shares as f64;
        let new_shares = position.shares + shares;
        position.average_cost =
            (old_shares * position.average_cost + shares as f64 * price) / new_shares as f64;
        position.shares = new_shares;

        Ok(commission)
    }

    /// Sells `shares` at `price`. Returns `(realized_pnl, commission)`; the realized P&L is net of
    /// the commission. Average cost of any remaining shares is unchanged.
    pub fn sell(&mut self, symbol: &str, shares: u64, price: f64) -> EngineResult<(f64, f64)> {
        Self::validate_trade(symbol, shares, price)?;

        let position = self
            .positions
            .get(symbol)
            .ok_or_else(|| EngineError::NoPosition {
                symbol: symbol.to_string(),
            })?;
        if shares > position.shares {
            return Err(EngineError::InsufficientShares {
                symbol: symbol.to_string(),
                requested: shares,
                held: position.shares,
            });
        }

        let proceeds = shares as f64 * price;
        let commission = self.commission.commission_for(proceeds);
        if self.cash + proceeds - commission < -CASH_EPSILON {
            return Err(EngineError::InsufficientFunds {
                required: commission,
                available: self.cash + proceeds,
            });
        }

        let realized_pnl = shares as f64 * (price - position.average_cost) - commission;
        let remaining = position.shares - shares;
        if remaining == 0 {
            self.positions.remove(symbol);
        } else if let Some(position) = self.positions.get_mut(symbol) {
            position.shares = remaining;
        }
        self.cash = (self.cash + proceeds - commission).max(0.0);

        Ok((realized_pnl, commission))
    }

    pub fn total_value(&self, prices: &HashMap<String, f64>) -> EngineResult<f64> {
        let mut total = self.cash;
        for position in self.positions.values() {
            let price = prices
                .get(&position.symbol)
                .copied()
                .filter(|price| price.is_finite())
                .ok_or_else(|| EngineError::StaleValuation {
                    symbol: position.symbol.clone(),
                })?;
            total += position.market_value(price);
        }
        Ok(total)
    }

    fn validate_trade(symbol: &str, shares: u64, price: f64) -> EngineResult<()> {
        if symbol.trim().is_empty() {
            return Err(EngineError::InvalidSymbol);
        }
        if !price.is_finite() || price <= 0.0 {
            return Err(EngineError::InvalidPrice {
                symbol: symbol.to_string(),
                price,
            });
        }
        if shares == 0 {
            return Err(EngineError::validation(format!(
                "order for {} must have a positive share count",
                symbol
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prices(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(symbol, price)| (symbol.to_string(), *price))
            .collect()
    }

    #[test]
    fn buy_debits_cash_and_tracks_weighted_average_cost() {
        let mut portfolio = Portfolio::new(10_000.0);
        portfolio.buy("AAPL", 10, 100.0).unwrap();
        assert!((portfolio.cash() - 9_000.0).abs() < 1e-9);

        portfolio.buy("AAPL", 30, 120.0).unwrap();
        let position = portfolio.position("AAPL").unwrap();
        assert_eq!(position.shares, 40);
        // (10 * 100 + 30 * 120) / 40 = 115
        assert!((position.average_cost - 115.0).abs() < 1e-9);
        assert!((portfolio.cash() - 5_400.0).abs() < 1e-9);
    }

    #[test]
    fn buy_rejects_when_commission_exceeds_cash() {
        let commission = CommissionModel { flat: 5.0, pct: 0.0 };
        let mut portfolio = Portfolio::with_commission(1_000.0, commission);
        let error = portfolio.buy("AAPL", 10, 100.0).unwrap_err();
        assert!(matches!(error, EngineError::InsufficientFunds { .. }));
        assert!((portfolio.cash() - 1_000.0).abs() < 1e-9);
        assert!(!portfolio.has_position("AAPL"));
    }

    #[test]
    fn sell_credits_proceeds_and_keeps_average_cost() {
        let mut portfolio = Portfolio::new(10_000.0);
        portfolio.buy("AAPL", 20, 100.0).unwrap();
        let cash_before = portfolio.cash();

        let (pnl, commission) = portfolio.sell("AAPL", 5, 110.0).unwrap();
        assert_eq!(commission, 0.0);
        assert!((pnl - 50.0).abs() < 1e-9);
        assert!((portfolio.cash() - (cash_before + 550.0)).abs() < 1e-9);
        let position = portfolio.position("AAPL").unwrap();
        assert_eq!(position.shares, 15);
        assert!((position.average_cost - 100.0).abs() < 1e-9);
    }

    #[test]
    fn selling_everything_removes_the_position() {
        let mut portfolio = Portfolio::new(1_000.0);
        portfolio.buy("MSFT", 4, 50.0).unwrap();
        portfolio.sell("MSFT", 4, 40.0).unwrap();
        assert!(!portfolio.has_position("MSFT"));
        assert!((portfolio.cash() - 960.0).abs() < 1e-9);
    }

    #[test]
    fn sell_failures_are_explicit() {
        let mut portfolio = Portfolio::new(1_000.0);
        assert!(matches!(
            portfolio.sell("MSFT", 1, 10.0),
            Err(EngineError::NoPosition { .. })
        ));
        portfolio.buy("MSFT", 2, 10.0).unwrap();
        assert!(matches!(
            portfolio.sell("MSFT", 3, 10.0),
            Err(EngineError::InsufficientShares {
                requested: 3,
                held: 2,
                ..
            })
        ));
    }

    #[test]
    fn invalid_trades_are_rejected() {
        let mut portfolio = Portfolio::new(1_000.0);
        assert!(matches!(
            portfolio.buy("", 1, 10.0),
            Err(EngineError::InvalidSymbol)
        ));
        assert!(matches!(
            portfolio.buy("AAPL", 1, 0.0),
            Err(EngineError::InvalidPrice { .. })
        ));
        assert!(portfolio.buy("AAPL", 0, 10.0).is_err());
    }

    #[test]
    fn total_value_requires_prices_for_every_holding() {
        let mut portfolio = Portfolio::new(1_000.0);
        portfolio.buy("AAPL", 2, 100.0).unwrap();
        portfolio.buy("MSFT", 1, 50.0).unwrap();

        let value = portfolio
            .total_value(&prices(&[("AAPL", 110.0), ("MSFT", 60.0)]))
            .unwrap();
        assert!((value - (750.0 + 220.0 + 60.0)).abs() < 1e-9);

        let error = portfolio
            .total_value(&prices(&[("AAPL", 110.0)]))
            .unwrap_err();
        assert_eq!(
            error,
            EngineError::StaleValuation {
                symbol: "MSFT".to_string()
            }
        );
    }

    #[test]
    fn order_status_is_terminal_once_resolved() {
        let date = NaiveDate::from_ymd_opt(2023, 1, 3).unwrap();
        let mut order = Order::new(1, "AAPL", OrderSide::Buy, 10, 100.0, date, "test");
        order.fill(0.0, None).unwrap();
        assert!(order.is_filled());
        assert!(matches!(
            order.reject("late"),
            Err(EngineError::OrderFinalized { order_id: 1, .. })
        ));

        let mut rejected = Order::new(2, "AAPL", OrderSide::Buy, 10, 100.0, date, "test");
        rejected.reject("insufficient funds").unwrap();
        assert!(rejected.fill(0.0, None).is_err());
        assert_eq!(
            rejected.status,
            OrderStatus::Rejected {
                reason: "insufficient funds".to_string()
            }
        );
    }
}
