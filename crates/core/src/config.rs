use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Serialize};

/// Ports served by live (not paper) gateway and TWS sessions.
pub const LIVE_PORTS: [u16; 2] = [4001, 7496];

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub broker: BrokerConfig,
    pub gateway: GatewayConfig,
    pub database: DatabaseConfig,
    pub strategy: StrategyConfig,
    pub calendar: CalendarConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrokerKind {
    /// Interactive Brokers gateway/TWS (requires the `ib` feature).
    Ib,
    /// In-process simulated broker.
    Simulated,
}

/// Account mode a session runs under. Drives log directory layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TradingMode {
    Live,
    Paper,
    Testing,
}

impl std::fmt::Display for TradingMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Live => write!(f, "live"),
            Self::Paper => write!(f, "paper"),
            Self::Testing => write!(f, "testing"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    pub kind: BrokerKind,
    /// Gateway/TWS host (use 127.0.0.1, not localhost).
    pub host: String,
    /// Gateway port (4001 = live, 4002 = paper).
    pub port: u16,
    pub client_id: i32,
    pub account: String,
    /// Seconds to wait for the gateway connection to become ready.
    pub connect_timeout_secs: u64,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            kind: BrokerKind::Ib,
            host: "127.0.0.1".to_string(),
            port: 4002,
            client_id: 100,
            account: String::new(),
            connect_timeout_secs: 120,
        }
    }
}

impl BrokerConfig {
    /// Live for the live gateway/TWS ports, paper otherwise.
    #[must_use]
    pub fn trading_mode(&self) -> TradingMode {
        if LIVE_PORTS.contains(&self.port) {
            TradingMode::Live
        } else {
            TradingMode::Paper
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Launcher for the gateway process. `None` attaches to an already running gateway.
    pub command: Option<String>,
    pub args: Vec<String>,
    pub tws_version: u32,
    pub trading_mode: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            command: None,
            args: Vec::new(),
            tws_version: 981,
            trading_mode: "paper".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "sqlite://db/alpha.db".to_string(),
            max_connections: 5,
        }
    }
}

/// Trading rules. All percentages are fractions (0.25 = 25%).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StrategyConfig {
    pub holding_period_minutes: i64,
    /// Earliest entry, measured from the exchange open.
    pub entry_delay_minutes: i64,
    /// Latest entry, measured back from the exchange close.
    pub entry_cutoff_minutes: i64,
    /// Open positions are flattened this long before a close.
    pub close_buffer_minutes: i64,
    pub vol_lookback_minutes: i64,
    pub risk_free_rate: f64,
    /// Asks at or above this are treated as bad quotes.
    pub max_ask: f64,
    /// Maximum ask premium over the Black-Scholes value.
    pub max_bsm_premium: f64,
    /// Fraction of available funds one straddle may deploy.
    pub capital_fraction: f64,
    /// The session stops trading below this level of available funds.
    pub min_available_funds: f64,
    pub take_profit: f64,
    pub max_order_attempts: u32,
    pub max_balance_depth: u32,
    /// Strikes tracked on each side of spot.
    pub strike_window: usize,
    pub load_timeout_secs: u64,
    pub order_timeout_secs: u64,
    pub max_liquidation_rounds: u32,
    pub model: ModelWeights,
}

impl Default for StrategyConfig {
    fn default() -> Self {
        Self {
            holding_period_minutes: 29,
            entry_delay_minutes: 15,
            entry_cutoff_minutes: 240,
            close_buffer_minutes: 15,
            vol_lookback_minutes: 15,
            risk_free_rate: 0.02,
            max_ask: 30.0,
            max_bsm_premium: 0.20,
            capital_fraction: 0.25,
            min_available_funds: 10_000.0,
            take_profit: 0.50,
            max_order_attempts: 12,
            max_balance_depth: 4,
            strike_window: 3,
            load_timeout_secs: 12,
            order_timeout_secs: 30,
            max_liquidation_rounds: 120,
            model: ModelWeights::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelWeights {
    pub w1: f64,
    pub w2: f64,
    pub w3: f64,
}

impl Default for ModelWeights {
    fn default() -> Self {
        Self {
            w1: 0.0,
            w2: 0.05,
            w3: 0.25,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CalendarConfig {
    pub holidays: Vec<NaiveDate>,
    pub early_closes: Vec<EarlyClose>,
}

/// A shortened session. `close` is exchange-local time.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EarlyClose {
    pub date: NaiveDate,
    pub close: NaiveTime,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub dir: String,
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: "logs".to_string(),
            level: "warn".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn live_ports_map_to_live_mode() {
        let mut broker = BrokerConfig::default();
        assert_eq!(broker.trading_mode(), TradingMode::Paper);

        broker.port = 4001;
        assert_eq!(broker.trading_mode(), TradingMode::Live);

        broker.port = 7496;
        assert_eq!(broker.trading_mode(), TradingMode::Live);

        broker.port = 7497;
        assert_eq!(broker.trading_mode(), TradingMode::Paper);
    }

    #[test]
    fn holding_period_fits_inside_entry_cutoff() {
        let strategy = StrategyConfig::default();
        assert!(strategy.holding_period_minutes < strategy.entry_cutoff_minutes);
    }

    #[test]
    fn trading_mode_displays_lowercase() {
        assert_eq!(TradingMode::Testing.to_string(), "testing");
        assert_eq!(TradingMode::Live.to_string(), "live");
    }
}
