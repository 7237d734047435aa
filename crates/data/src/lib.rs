//! SQLite persistence for the straddle trader.
//!
//! This crate provides:
//! - Connection setup with embedded migrations
//! - Row and input models for underlyings, options, quotes and trades
//! - Repositories for typed table access

pub mod database;
pub mod models;
pub mod repositories;

pub use database::{connect, connect_in_memory, Database};

pub use models::{
    NewOption, NewUnderlying, NullTarget, OptionRecord, OptionSnapshot, PositionRecord,
    TradeRecord, TradeRow, UnderlyingRecord,
};

pub use repositories::{
    MarketDataRepository, OptionRepository, Repositories, TradeRepository, UnderlyingRepository,
};
