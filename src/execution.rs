use crate::error::{EngineError, EngineResult};
use crate::models::{SignalAction, TradingSignal};
use crate::portfolio::{Order, OrderSide, Portfolio};
use chrono::NaiveDate;
use log::debug;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSettings {
    /// Fraction of total portfolio value committed by each BUY.
    pub target_allocation: f64,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            target_allocation: 0.1,
        }
    }
}

/// Prices known on the execution day. `prices` holds the latest close for every symbol the
/// portfolio may need to value, not just the ones that traded on `date`.
#[derive(Debug, Clone, Copy)]
pub struct PricingContext<'a> {
    pub date: NaiveDate,
    pub prices: &'a HashMap<String, f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ExecutionOutcome {
    Filled(Order),
    Rejected(Order),
    NoOp { symbol: String, reason: String },
}

impl ExecutionOutcome {
    pub fn order(&self) -> Option<&Order> {
        match self {
            ExecutionOutcome::Filled(order) | ExecutionOutcome::Rejected(order) => Some(order),
            ExecutionOutcome::NoOp { .. } => None,
        }
    }

    pub fn into_order(self) -> Option<Order> {
        match self {
            ExecutionOutcome::Filled(order) | ExecutionOutcome::Rejected(order) => Some(order),
            ExecutionOutcome::NoOp { .. } => None,
        }
    }
}

/// Turns signals into portfolio mutations. Owns the order id sequence for one run.
pub struct ExecutionService {
    settings: ExecutionSettings,
    next_order_id: u64,
}

impl ExecutionService {
    pub fn new(settings: ExecutionSettings) -> Self {
        Self {
            settings,
            next_order_id: 1,
        }
    }

    pub fn settings(&self) -> ExecutionSettings {
        self.settings
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_order_id;
        self.next_order_id += 1;
        id
    }

    pub fn execute_signal(
        &mut self,
        signal: &TradingSignal,
        symbol: &str,
        portfolio: &mut Portfolio,
        pricing: &PricingContext<'_>,
    ) -> EngineResult<ExecutionOutcome> {
        if symbol.trim().is_empty() {
            return Err(EngineError::InvalidSymbol);
        }
        if !signal.price.is_finite() || signal.price <= 0.0 {
            return Err(EngineError::InvalidPrice {
                symbol: symbol.to_string(),
                price: signal.price,
            });
        }
        if signal.date != pricing.date {
            return Err(EngineError::InvalidDate {
                symbol: symbol.to_string(),
                signal_date: signal.date,
                execution_date: pricing.date,
            });
        }

        match signal.signal {
            SignalAction::Hold => Err(EngineError::HoldSignal {
                symbol: symbol.to_string(),
            }),
            SignalAction::Buy => self.buy(signal, symbol, portfolio, pricing),
            SignalAction::Sell => {
                let closed = self.liquidate(
                    portfolio,
                    symbol,
                    signal.price,
                    signal.date,
                    &signal.reason,
                )?;
                match closed {
                    Some(outcome) => Ok(outcome),
                    None => Ok(ExecutionOutcome::NoOp {
                        symbol: symbol.to_string(),
                        reason: "no open position to sell".to_string(),
                    }),
                }
            }
        }
    }

    fn buy(
        &mut self,
        signal: &TradingSignal,
        symbol: &str,
        portfolio: &mut Portfolio,
        pricing: &PricingContext<'_>,
    ) -> EngineResult<ExecutionOutcome> {
        let total_value = portfolio.total_value(pricing.prices)?;
        let budget = self.settings.target_allocation * total_value;
        let shares = (budget / signal.price).floor();
        if !shares.is_finite() || shares < 1.0 {
            debug!(
                "{} BUY on {} sized to zero shares (budget {:.2}, price {:.2})",
                symbol, signal.date, budget, signal.price
            );
            return Ok(ExecutionOutcome::NoOp {
                symbol: symbol.to_string(),
                reason: format!(
                    "allocation {:.2} below price {:.2}",
                    budget, signal.price
                ),
            });
        }
        let shares = shares as u64;

        let mut order = Order::new(
            self.next_id(),
            symbol,
            OrderSide::Buy,
            shares,
            signal.price,
            signal.date,
            signal.reason.clone(),
        );
        match portfolio.buy(symbol, shares, signal.price) {
            Ok(commission) => {
                order.fill(commission, None)?;
                Ok(ExecutionOutcome::Filled(order))
            }
            Err(error @ EngineError::InsufficientFunds { .. }) => {
                order.reject(error.to_string())?;
                Ok(ExecutionOutcome::Rejected(order))
            }
            Err(error) => Err(error),
        }
    }

    /// Sells the whole position in `symbol`. Returns `None` when nothing is held.
    pub fn liquidate(
        &mut self,
        portfolio: &mut Portfolio,
        symbol: &str,
        price: f64,
        date: NaiveDate,
        reason: &str,
    ) -> EngineResult<Option<ExecutionOutcome>> {
        let Some(shares) = portfolio.position(symbol).map(|position| position.shares) else {
            return Ok(None);
        };

        let mut order = Order::new(
            self.next_id(),
            symbol,
            OrderSide::Sell,
            shares,
            price,
            date,
            reason,
        );
        match portfolio.sell(symbol, shares, price) {
            Ok((realized_pnl, commission)) => {
                order.fill(commission, Some(realized_pnl))?;
                Ok(Some(ExecutionOutcome::Filled(order)))
            }
            Err(error @ EngineError::InsufficientFunds { .. }) => {
                order.reject(error.to_string())?;
                Ok(Some(ExecutionOutcome::Rejected(order)))
            }
            Err(error) => Err(error),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::portfolio::{CommissionModel, OrderStatus};

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, 1, d).unwrap()
    }

    fn signal(action: SignalAction, symbol: &str, price: f64, day: u32) -> TradingSignal {
        TradingSignal {
            symbol: symbol.to_string(),
            signal: action,
            price,
            date: date(day),
            reason: "test".to_string(),
            confidence: 1.0,
        }
    }

    fn prices(entries: &[(&str, f64)]) -> HashMap<String, f64> {
        entries
            .iter()
            .map(|(symbol, price)| (symbol.to_string(), *price))
            .collect()
    }

    #[test]
    fn buy_sizes_by_target_allocation() {
        let mut service = ExecutionService::new(ExecutionSettings::default());
        let mut portfolio = Portfolio::new(10_000.0);
        let prices = prices(&[("AAPL", 150.0)]);
        let pricing = PricingContext {
            date: date(3),
            prices: &prices,
        };

        let outcome = service
            .execute_signal(
                &signal(SignalAction::Buy, "AAPL", 150.0, 3),
                "AAPL",
                &mut portfolio,
                &pricing,
            )
            .unwrap();
        let ExecutionOutcome::Filled(order) = outcome else {
            panic!("expected a fill, got {:?}", outcome);
        };
        // floor(0.1 * 10000 / 150) = 6
        assert_eq!(order.shares, 6);
        assert_eq!(order.id, 1);
        assert!((portfolio.cash() - 9_100.0).abs() < 1e-9);
    }

    #[test]
    fn buy_that_sizes_to_zero_is_a_no_op() {
        let mut service = ExecutionService::new(ExecutionSettings::default());
        let mut portfolio = Portfolio::new(1_000.0);
        let prices = prices(&[("BRK", 500.0)]);
        let pricing = PricingContext {
            date: date(3),
            prices: &prices,
        };
        let outcome = service
            .execute_signal(
                &signal(SignalAction::Buy, "BRK", 500.0, 3),
                "BRK",
                &mut portfolio,
                &pricing,
            )
            .unwrap();
        assert!(matches!(outcome, ExecutionOutcome::NoOp { .. }));
        assert_eq!(portfolio.cash(), 1_000.0);
    }

    #[test]
    fn insufficient_funds_yields_rejected_order() {
        let mut service = ExecutionService::new(ExecutionSettings {
            target_allocation: 1.0,
        });
        let commission = CommissionModel { flat: 10.0, pct: 0.0 };
        let mut portfolio = Portfolio::with_commission(1_000.0, commission);
        let prices = prices(&[("AAPL", 100.0)]);
        let pricing = PricingContext {
            date: date(3),
            prices: &prices,
        };
        let outcome = service
            .execute_signal(
                &signal(SignalAction::Buy, "AAPL", 100.0, 3),
                "AAPL",
                &mut portfolio,
                &pricing,
            )
            .unwrap();
        let ExecutionOutcome::Rejected(order) = outcome else {
            panic!("expected a rejection, got {:?}", outcome);
        };
        assert!(matches!(order.status, OrderStatus::Rejected { .. }));
        assert_eq!(portfolio.cash(), 1_000.0);
    }

    #[test]
    fn sell_closes_entire_position_or_is_a_no_op() {
        let mut service = ExecutionService::new(ExecutionSettings::default());
        let mut portfolio = Portfolio::new(10_000.0);
        portfolio.buy("AAPL", 7, 100.0).unwrap();
        let prices = prices(&[("AAPL", 110.0)]);
        let pricing = PricingContext {
            date: date(4),
            prices: &prices,
        };

        let outcome = service
            .execute_signal(
                &signal(SignalAction::Sell, "AAPL", 110.0, 4),
                "AAPL",
                &mut portfolio,
                &pricing,
            )
            .unwrap();
        let order = outcome.into_order().unwrap();
        assert_eq!(order.shares, 7);
        assert_eq!(order.realized_pnl, Some(70.0));
        assert!(!portfolio.has_position("AAPL"));

        let again = service
            .execute_signal(
                &signal(SignalAction::Sell, "AAPL", 110.0, 4),
                "AAPL",
                &mut portfolio,
                &pricing,
            )
            .unwrap();
        assert!(matches!(again, ExecutionOutcome::NoOp { .. }));
    }

    #[test]
    fn invalid_signals_are_rejected_explicitly() {
        let mut service = ExecutionService::new(ExecutionSettings::default());
        let mut portfolio = Portfolio::new(10_000.0);
        let prices = prices(&[("AAPL", 100.0)]);
        let pricing = PricingContext {
            date: date(5),
            prices: &prices,
        };

        let hold = signal(SignalAction::Hold, "AAPL", 100.0, 5);
        assert!(matches!(
            service.execute_signal(&hold, "AAPL", &mut portfolio, &pricing),
            Err(EngineError::HoldSignal { .. })
        ));
        let bad_price = signal(SignalAction::Buy, "AAPL", 0.0, 5);
        assert!(matches!(
            service.execute_signal(&bad_price, "AAPL", &mut portfolio, &pricing),
            Err(EngineError::InvalidPrice { .. })
        ));
        let stale = signal(SignalAction::Buy, "AAPL", 100.0, 4);
        assert!(matches!(
            service.execute_signal(&stale, "AAPL", &mut portfolio, &pricing),
            Err(EngineError::InvalidDate { .. })
        ));
        let buy = signal(SignalAction::Buy, "", 100.0, 5);
        assert!(matches!(
            service.execute_signal(&buy, "", &mut portfolio, &pricing),
            Err(EngineError::InvalidSymbol)
        ));
        assert_eq!(portfolio.cash(), 10_000.0);
    }
}
