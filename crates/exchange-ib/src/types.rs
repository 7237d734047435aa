//! Core types for IB options trading.

use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use straddle_core::errors::ValidationError;

/// Options contract right (call or put).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptionRight {
    Call,
    Put,
}

impl OptionRight {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Call => "C",
            Self::Put => "P",
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Call => Self::Put,
            Self::Put => Self::Call,
        }
    }
}

impl std::fmt::Display for OptionRight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptionRight {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "C" | "CALL" => Ok(Self::Call),
            "P" | "PUT" => Ok(Self::Put),
            other => anyhow::bail!("invalid option right `{other}`"),
        }
    }
}

/// Security type of an underlying.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecType {
    /// Stocks and ETFs.
    #[serde(rename = "STK")]
    Stock,
    #[serde(rename = "IND")]
    Index,
}

impl SecType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Stock => "STK",
            Self::Index => "IND",
        }
    }
}

impl std::fmt::Display for SecType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SecType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "STK" => Ok(Self::Stock),
            "IND" => Ok(Self::Index),
            other => anyhow::bail!("invalid sec type `{other}`; must be STK or IND"),
        }
    }
}

/// A stock or index contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnderlyingContract {
    /// 0 until qualified.
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: SecType,
    pub currency: String,
    pub exchange: String,
    pub primary_exchange: Option<String>,
}

/// An options contract specification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionsContract {
    /// 0 until qualified.
    pub con_id: i64,
    pub symbol: String,
    /// Last trading day, `YYYYMMDD`.
    pub expiry: String,
    pub strike: Decimal,
    pub right: OptionRight,
    /// Exchange routing (e.g., "SMART", "CBOE").
    pub exchange: String,
    pub trading_class: Option<String>,
    /// Contract multiplier (100 for standard US equity options).
    pub multiplier: Decimal,
    pub currency: String,
}

impl OptionsContract {
    /// Create a new, unqualified US options contract.
    #[must_use]
    pub fn new(symbol: &str, expiry: &str, strike: Decimal, right: OptionRight) -> Self {
        Self {
            con_id: 0,
            symbol: symbol.to_uppercase(),
            expiry: expiry.to_string(),
            strike,
            right,
            exchange: "SMART".to_string(),
            trading_class: None,
            multiplier: Decimal::from(100),
            currency: "USD".to_string(),
        }
    }

    /// Human-readable contract description (e.g., "NVDA 140C 20260320").
    #[must_use]
    pub fn display_name(&self) -> String {
        format!("{} {}{} {}", self.symbol, self.strike, self.right, self.expiry)
    }

    #[must_use]
    pub fn expiry_date(&self) -> Option<NaiveDate> {
        NaiveDate::parse_from_str(&self.expiry, "%Y%m%d").ok()
    }
}

/// Live top-of-book for one market data line. Absent fields have not ticked yet.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Quote {
    pub bid: Option<Decimal>,
    pub ask: Option<Decimal>,
    pub last: Option<Decimal>,
    pub close: Option<Decimal>,
    pub bid_size: i64,
    pub ask_size: i64,
    pub bid_iv: Option<f64>,
    pub ask_iv: Option<f64>,
}

impl Quote {
    fn positive(value: Option<Decimal>) -> Option<Decimal> {
        value.filter(|v| v.is_sign_positive() && !v.is_zero())
    }

    #[must_use]
    pub fn midpoint(&self) -> Option<Decimal> {
        match (Self::positive(self.bid), Self::positive(self.ask)) {
            (Some(bid), Some(ask)) => Some((bid + ask) / Decimal::TWO),
            _ => None,
        }
    }

    /// Last price when it sits inside the spread, else the midpoint, else
    /// last, else the prior close.
    #[must_use]
    pub fn market_price(&self) -> Option<Decimal> {
        let last = Self::positive(self.last);
        match (self.midpoint(), last) {
            (Some(_), Some(last))
                if self.bid.is_some_and(|b| b <= last) && self.ask.is_some_and(|a| last <= a) =>
            {
                Some(last)
            }
            (Some(mid), _) => Some(mid),
            (None, Some(last)) => Some(last),
            (None, None) => Self::positive(self.close),
        }
    }
}

/// One `(exchange, trading class)` slice of an option chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionChainParams {
    pub exchange: String,
    pub underlying_con_id: i64,
    pub trading_class: String,
    pub multiplier: String,
    /// `YYYYMMDD`.
    pub expirations: Vec<String>,
    pub strikes: Vec<Decimal>,
}

/// IB account summary.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AccountSummary {
    pub account_id: String,
    pub net_liquidation: Decimal,
    pub buying_power: Decimal,
    pub available_funds: Decimal,
    pub excess_liquidity: Decimal,
    pub total_cash_value: Decimal,
    pub maintenance_margin: Decimal,
    /// Excess liquidity as a fraction of net liquidation.
    pub cushion: Decimal,
}

/// Order side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    /// +1 for buys, -1 for sells.
    #[must_use]
    pub const fn sign(self) -> i64 {
        match self {
            Self::Buy => 1,
            Self::Sell => -1,
        }
    }

    #[must_use]
    pub const fn opposite(self) -> Self {
        match self {
            Self::Buy => Self::Sell,
            Self::Sell => Self::Buy,
        }
    }

    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Buy => "BUY",
            Self::Sell => "SELL",
        }
    }
}

impl std::fmt::Display for OrderSide {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OrderSide {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "BUY" => Ok(Self::Buy),
            "SELL" => Ok(Self::Sell),
            _ => Err(ValidationError::InvalidAction(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TimeInForce {
    /// Immediate or cancel.
    Ioc,
    /// Fill or kill.
    Fok,
    /// Day till cancelled.
    Dtc,
    Day,
}

impl TimeInForce {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Ioc => "IOC",
            Self::Fok => "FOK",
            Self::Dtc => "DTC",
            Self::Day => "DAY",
        }
    }
}

impl std::fmt::Display for TimeInForce {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimeInForce {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "IOC" => Ok(Self::Ioc),
            "FOK" => Ok(Self::Fok),
            "DTC" => Ok(Self::Dtc),
            "DAY" => Ok(Self::Day),
            _ => Err(ValidationError::InvalidTimeInForce(s.to_string())),
        }
    }
}

/// A limit order. Always sweep-to-fill, regular trading hours only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitOrder {
    pub side: OrderSide,
    pub quantity: i64,
    pub limit_price: Decimal,
    pub tif: TimeInForce,
    pub account: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    PendingSubmit,
    PreSubmitted,
    Submitted,
    ApiCancelled,
    Cancelled,
    Filled,
    Inactive,
}

impl OrderStatus {
    /// No further fills can arrive.
    #[must_use]
    pub const fn is_done(self) -> bool {
        matches!(self, Self::ApiCancelled | Self::Cancelled | Self::Filled)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fill {
    pub quantity: i64,
    pub price: Decimal,
    pub commission: Decimal,
    pub time: NaiveDateTime,
}

/// Broker-side view of a placed order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderState {
    pub order_id: String,
    pub contract: OptionsContract,
    pub order: LimitOrder,
    pub status: OrderStatus,
    pub fills: Vec<Fill>,
}

impl OrderState {
    #[must_use]
    pub fn filled(&self) -> i64 {
        self.fills.iter().map(|f| f.quantity).sum()
    }

    #[must_use]
    pub fn remaining(&self) -> i64 {
        (self.order.quantity - self.filled()).max(0)
    }

    #[must_use]
    pub fn commission(&self) -> Decimal {
        self.fills.iter().map(|f| f.commission).sum()
    }

    /// Quantity-weighted fill price, zero before the first fill.
    #[must_use]
    pub fn avg_fill_price(&self) -> Decimal {
        let filled = self.filled();
        if filled == 0 {
            return Decimal::ZERO;
        }
        let notional: Decimal = self
            .fills
            .iter()
            .map(|f| f.price * Decimal::from(f.quantity))
            .sum();
        notional / Decimal::from(filled)
    }
}

/// An open position as the broker reports it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BrokerPosition {
    pub account: String,
    pub contract: OptionsContract,
    /// Contracts, signed.
    pub quantity: i64,
    /// Average cost per contract, multiplier included.
    pub avg_cost: Decimal,
}

impl BrokerPosition {
    /// Average cost per share, comparable to a quoted price.
    #[must_use]
    pub fn avg_price(&self) -> Decimal {
        if self.contract.multiplier.is_zero() {
            self.avg_cost
        } else {
            self.avg_cost / self.contract.multiplier
        }
    }
}
