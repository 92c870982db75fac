use crate::models::{PriceData, SignalAction, TradingSignal};

fn signal_at(
    symbol: &str,
    bar: &PriceData,
    signal: SignalAction,
    confidence: f64,
    reason: String,
) -> TradingSignal {
    TradingSignal {
        symbol: symbol.to_string(),
        signal,
        price: bar.close,
        date: bar.date,
        reason,
        confidence: confidence.clamp(0.0, 1.0),
    }
}

/// Create a hold signal (default action when no trade signal is generated)
pub fn hold_signal<S: Into<String>>(symbol: &str, bar: &PriceData, reason: S) -> TradingSignal {
    signal_at(symbol, bar, SignalAction::Hold, 0.0, reason.into())
}

/// Create a buy signal priced at the bar's close
pub fn buy_signal<S: Into<String>>(
    symbol: &str,
    bar: &PriceData,
    confidence: f64,
    reason: S,
) -> TradingSignal {
    signal_at(symbol, bar, SignalAction::Buy, confidence, reason.into())
}

/// Create a sell signal priced at the bar's close
pub fn sell_signal<S: Into<String>>(
    symbol: &str,
    bar: &PriceData,
    confidence: f64,
    reason: S,
) -> TradingSignal {
    signal_at(symbol, bar, SignalAction::Sell, confidence, reason.into())
}
