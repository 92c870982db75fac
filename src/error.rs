use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Validation,
    Data,
    Temporal,
    Execution,
    Process,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Validation => "validation",
            ErrorKind::Data => "data",
            ErrorKind::Temporal => "temporal",
            ErrorKind::Execution => "execution",
            ErrorKind::Process => "process",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum EngineError {
    #[error("{0}")]
    Validation(String),

    #[error("unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("insufficient funds: required {required:.2}, available {available:.2}")]
    InsufficientFunds { required: f64, available: f64 },

    #[error("no open position in {symbol}")]
    NoPosition { symbol: String },

    #[error("cannot sell {requested} shares of {symbol}: only {held} held")]
    InsufficientShares {
        symbol: String,
        requested: u64,
        held: u64,
    },

    #[error("no price available to value held position in {symbol}")]
    StaleValuation { symbol: String },

    #[error("invalid indicator period {period}")]
    InvalidPeriod { period: usize },

    #[error("insufficient data: need {required} points, have {available}")]
    InsufficientData { required: usize, available: usize },

    #[error("{0}")]
    MissingData(String),

    #[error("signal symbol is empty")]
    InvalidSymbol,

    #[error("invalid price {price} for {symbol}")]
    InvalidPrice { symbol: String, price: f64 },

    #[error("signal for {symbol} dated {signal_date} does not match execution date {execution_date}")]
    InvalidDate {
        symbol: String,
        signal_date: NaiveDate,
        execution_date: NaiveDate,
    },

    #[error("HOLD signal for {symbol} is not executable")]
    HoldSignal { symbol: String },

    #[error("order {order_id} is already {status}")]
    OrderFinalized { order_id: u64, status: String },

    #[error("worker {worker_id}: {message}")]
    Process { worker_id: usize, message: String },

    #[error("worker {worker_id} timed out after {timeout_secs}s")]
    Timeout { worker_id: usize, timeout_secs: u64 },
}

impl EngineError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            EngineError::Validation(_) | EngineError::UnknownStrategy(_) => ErrorKind::Validation,
            EngineError::StaleValuation { .. }
            | EngineError::InvalidPeriod { .. }
            | EngineError::InsufficientData { .. }
            | EngineError::MissingData(_) => ErrorKind::Data,
            EngineError::InsufficientFunds { .. }
            | EngineError::NoPosition { .. }
            | EngineError::InsufficientShares { .. }
            | EngineError::InvalidSymbol
            | EngineError::InvalidPrice { .. }
            | EngineError::InvalidDate { .. }
            | EngineError::HoldSignal { .. }
            | EngineError::OrderFinalized { .. } => ErrorKind::Execution,
            EngineError::Process { .. } | EngineError::Timeout { .. } => ErrorKind::Process,
        }
    }

    pub fn validation<S: Into<String>>(message: S) -> Self {
        EngineError::Validation(message.into())
    }

    /// `kind: message` form used when errors are folded into a result's `error_message`.
    pub fn tagged_message(&self) -> String {
        format!("{}: {}", self.kind(), self)
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;
