//! Core building blocks of the straddle trader: configuration, error
//! taxonomy, exchange calendars, Black-Scholes pricing, realized volatility
//! and the entry signal model.

pub mod calendar;
pub mod config;
pub mod config_loader;
pub mod errors;
pub mod model;
pub mod pricing;
pub mod volatility;

pub use calendar::{market_now, MarketCalendar, Session};
pub use config::{
    AppConfig, BrokerConfig, BrokerKind, CalendarConfig, DatabaseConfig, EarlyClose,
    GatewayConfig, LoggingConfig, ModelWeights, StrategyConfig, TradingMode,
};
pub use config_loader::ConfigLoader;
pub use errors::{InitError, OrderError, SessionError, ValidationError};
pub use model::{Features, SignalModel};
