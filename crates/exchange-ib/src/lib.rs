//! Broker integration for the straddle trader.
//!
//! Provides the [`Broker`] seam the trader runs against, an in-memory
//! [`PaperBroker`] for dry runs and tests, gateway process control, and the
//! Interactive Brokers adapter (feature `ib`).

pub mod broker;
#[cfg(feature = "ib")]
pub mod client;
pub mod gateway;
pub mod paper;
pub mod types;

pub use broker::Broker;
#[cfg(feature = "ib")]
pub use client::{IBConfig, IbBroker};
pub use gateway::{wait_until_ready, GatewayController};
pub use paper::PaperBroker;
pub use straddle_core::config::TradingMode;
pub use types::{
    AccountSummary, BrokerPosition, Fill, LimitOrder, OptionChainParams, OptionRight,
    OptionsContract, OrderSide, OrderState, OrderStatus, Quote, SecType, TimeInForce,
    UnderlyingContract,
};
