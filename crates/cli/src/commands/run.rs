//! Full trading session: gateway, broker connection, straddle loop.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::NaiveDateTime;
use clap::Args;
use straddle_core::{
    market_now, AppConfig, BrokerConfig, ConfigLoader, MarketCalendar, SessionError, TradingMode,
};
use straddle_data::Database;
use straddle_ib::{wait_until_ready, Broker, GatewayController};
use straddle_options_manager::{preliminary_market_check, MarketClock, Session, TradingContext};
use tracing::{error, info, warn};

use crate::logging;

/// Arguments for a trading session.
#[derive(Args, Debug)]
pub struct RunArgs {
    /// Account number to trade (overrides `broker.account`)
    #[arg(long)]
    pub account: Option<String>,

    /// Gateway port; 4001 and 7496 trade live (overrides `broker.port`)
    #[arg(long)]
    pub port: Option<u16>,

    /// File logs under the testing tree regardless of port
    #[arg(long)]
    pub testing: bool,

    /// Config file path
    #[arg(short, long, default_value = "config/Config.toml")]
    pub config: String,
}

/// Resolves the config with command-line overrides applied.
fn resolve(args: &RunArgs) -> Result<(AppConfig, TradingMode)> {
    let mut config = ConfigLoader::load(&args.config)?;
    if let Some(account) = &args.account {
        config.broker.account.clone_from(account);
    }
    if let Some(port) = args.port {
        config.broker.port = port;
    }
    anyhow::ensure!(
        !config.broker.account.is_empty(),
        "No account number; pass --account or set broker.account"
    );

    let mode = if args.testing {
        TradingMode::Testing
    } else {
        config.broker.trading_mode()
    };
    Ok((config, mode))
}

pub async fn run_session(args: RunArgs) -> Result<()> {
    let (config, mode) = resolve(&args)?;
    let session_start = market_now();
    let log_file = logging::init_session(
        Path::new(&config.logging.dir),
        mode,
        session_start,
        "session",
        &config.logging.level,
    )?;
    println!("Logging to {}", log_file.display());
    info!(
        %mode,
        account = config.broker.account,
        port = config.broker.port,
        %session_start,
        "Starting session"
    );

    let db = Database::connect(&config.database.url, config.database.max_connections).await?;
    let rows = db.repos().underlyings.all_underlyings().await?;
    let calendar = Arc::new(MarketCalendar::new(&config.calendar));
    if let Err(e) = preliminary_market_check(&calendar, &rows, session_start) {
        warn!(error = %e, "Nothing to trade today");
        db.close().await;
        return Err(e.into());
    }

    let mut gateway = GatewayController::new(config.gateway.clone());
    gateway.start()?;

    let result = trade(&config, db.clone(), calendar, session_start).await;
    if let Err(e) = &result {
        error!(error = %e, "Session failed");
    }

    if let Err(e) = gateway.stop().await {
        warn!(error = %e, "Failed to stop gateway");
    }
    db.close().await;
    result
}

async fn trade(
    config: &AppConfig,
    db: Database,
    calendar: Arc<MarketCalendar>,
    session_start: NaiveDateTime,
) -> Result<()> {
    let timeout_secs = config.broker.connect_timeout_secs;
    let broker = connect_broker(&config.broker).await?;
    if !wait_until_ready(broker.as_ref(), Duration::from_secs(timeout_secs)).await {
        return Err(SessionError::ConnectTimeout(timeout_secs).into());
    }

    let rows = db.repos().underlyings.all_underlyings().await?;
    let ctx = TradingContext {
        broker,
        db,
        clock: Arc::new(MarketClock),
        calendar,
        strategy: config.strategy.clone(),
        account_num: config.broker.account.clone(),
        session_start,
    };

    let mut session = Session::start(ctx, &rows).await?;
    let interrupted = tokio::select! {
        result = session.run() => {
            result?;
            false
        }
        () = shutdown_signal() => true,
    };
    if interrupted {
        session.shutdown().await;
    }

    info!("Session complete");
    Ok(())
}

#[cfg(feature = "ib")]
async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    use anyhow::Context;
    use straddle_core::BrokerKind;
    use straddle_ib::{IBConfig, IbBroker};
    use tokio::time::Instant;

    anyhow::ensure!(
        config.kind == BrokerKind::Ib,
        "The simulated broker has no market data feed; set broker.kind = \"ib\""
    );

    // The gateway may still be starting up.
    let deadline = Instant::now() + Duration::from_secs(config.connect_timeout_secs);
    loop {
        match IbBroker::connect(IBConfig::from(config)).await {
            Ok(broker) => return Ok(Arc::new(broker)),
            Err(e) if Instant::now() < deadline => {
                warn!(error = %e, "Gateway not accepting connections yet");
                tokio::time::sleep(Duration::from_secs(5)).await;
            }
            Err(e) => {
                return Err(e).context(SessionError::ConnectTimeout(config.connect_timeout_secs))
            }
        }
    }
}

#[cfg(not(feature = "ib"))]
async fn connect_broker(config: &BrokerConfig) -> Result<Arc<dyn Broker>> {
    anyhow::bail!(
        "Built without the `ib` feature; cannot reach the gateway at {}:{}",
        config.host,
        config.port
    )
}

/// Resolves on SIGINT or SIGTERM.
async fn shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(sigterm) => sigterm,
        Err(e) => {
            warn!(error = %e, "Failed to install SIGTERM handler");
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Received SIGINT (Ctrl+C), shutting down");
            }
            return;
        }
    };

    tokio::select! {
        _ = sigterm.recv() => info!("Received SIGTERM, shutting down"),
        _ = tokio::signal::ctrl_c() => info!("Received SIGINT (Ctrl+C), shutting down"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn args(config: &str) -> RunArgs {
        RunArgs {
            account: None,
            port: None,
            testing: false,
            config: config.to_string(),
        }
    }

    fn config_file(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn port_decides_the_mode() {
        let file = config_file("[broker]\naccount = \"DU1\"\nport = 4002\n");
        let path = file.path().to_str().unwrap();

        let (_, mode) = resolve(&args(path)).unwrap();
        assert_eq!(mode, TradingMode::Paper);

        let live = RunArgs {
            port: Some(4001),
            ..args(path)
        };
        let (config, mode) = resolve(&live).unwrap();
        assert_eq!(config.broker.port, 4001);
        assert_eq!(mode, TradingMode::Live);

        let testing = RunArgs {
            port: Some(4001),
            testing: true,
            ..args(path)
        };
        assert_eq!(resolve(&testing).unwrap().1, TradingMode::Testing);
    }

    #[test]
    fn account_is_required() {
        let file = config_file("[broker]\nport = 4002\n");
        let path = file.path().to_str().unwrap();
        assert!(resolve(&args(path)).is_err());

        let with_account = RunArgs {
            account: Some("DU7".to_string()),
            ..args(path)
        };
        assert_eq!(resolve(&with_account).unwrap().0.broker.account, "DU7");
    }
}
