//! Intraday long-straddle trading.
//!
//! A [`Session`] tracks a set of underlyings through the trading day:
//! - keeps option data lines open on the strikes around spot
//! - logs every quote on a 250ms grid and derives volatility features
//! - buys a straddle when the signal model fires inside the entry window
//! - hands each open straddle to a monitor task that sells it at the profit
//!   target or when the holding period ends
//! - flattens anything left before the close

pub mod account;
pub mod clock;
pub mod context;
pub mod executor;
pub mod monitor;
pub mod positions;
pub mod service;
pub mod underlying;
pub mod validate;

#[cfg(test)]
pub(crate) mod testkit;

pub use account::Account;
pub use clock::{Clock, MarketClock, SimulatedClock};
pub use context::TradingContext;
pub use executor::PricingInputs;
pub use monitor::MonitorTarget;
pub use positions::Position;
pub use service::{launch_monitor, preliminary_market_check, RunningMonitor, Session};
pub use underlying::{TrackedOption, TrackedUnderlying};
pub use validate::Candidate;
