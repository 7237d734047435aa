//! Domain error taxonomy.
//!
//! Anything outside these cases travels as `anyhow::Error`.

use thiserror::Error;

/// An underlying could not be brought up for the session. The underlying is
/// dropped and the session carries on with the rest.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("invalid database row for {symbol}: {reason}")]
    InvalidRow { symbol: String, reason: String },

    #[error("no valid trading schedule for {symbol} on {exchange}")]
    NoSchedule { symbol: String, exchange: String },

    #[error("schedule for {symbol} does not leave room for a full holding period")]
    EntryWindowTooShort { symbol: String },

    #[error("contract for {symbol} failed to qualify: {reason}")]
    ContractNotQualified { symbol: String, reason: String },

    #[error("market data line for {symbol} did not load within {timeout_secs}s")]
    DataLineTimeout { symbol: String, timeout_secs: u64 },

    #[error("option chain for {symbol} is empty")]
    EmptyChain { symbol: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// Pre-trade validation failed. Raised only before an order is placed.
#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("net position exists for {symbol}")]
    PositionExists { symbol: String },

    #[error("failed to validate spot price")]
    InvalidSpot,

    #[error("no valid calls or no valid puts found")]
    MissingLeg,

    #[error("one or both legs have no valid ask prices")]
    NoValidAsks,

    #[error("invalid tenor of `{0}` seconds")]
    InvalidTenor(i64),

    #[error("invalid order action `{0}`; must be BUY or SELL")]
    InvalidAction(String),

    #[error("invalid time-in-force `{0}`; must be one of IOC, FOK, DTC, DAY")]
    InvalidTimeInForce(String),

    #[error("no tradable quantity")]
    ZeroQuantity,
}

/// An order went inactive before any part of it filled.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum OrderError {
    #[error("order {order_id} went inactive without fills")]
    Inactive { order_id: String },

    #[error("order {order_id} timed out after {timeout_secs}s")]
    TimedOut { order_id: String, timeout_secs: u64 },
}

/// Failures that end the whole session.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("all exchanges are closed for the day")]
    AllExchangesClosed,

    #[error("no underlyings initialized successfully")]
    NoValidUnderlyings,

    #[error("invalid session datetimes: {0}")]
    InvalidDatetimes(String),

    #[error("broker connection not ready after {0}s")]
    ConnectTimeout(u64),
}
