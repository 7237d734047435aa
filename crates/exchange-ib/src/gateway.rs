//! IB Gateway process control.
//!
//! The gateway is started through an IBC-style launcher
//! (`<command> <args..> <tws version> --gateway --mode=<mode>`) and killed on
//! stop. With no command configured the trader attaches to a gateway that is
//! already running.

use std::time::Duration;

use anyhow::{Context, Result};
use straddle_core::config::GatewayConfig;
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use crate::broker::Broker;

pub struct GatewayController {
    config: GatewayConfig,
    child: Option<Child>,
}

impl GatewayController {
    #[must_use]
    pub const fn new(config: GatewayConfig) -> Self {
        Self {
            config,
            child: None,
        }
    }

    #[must_use]
    pub const fn is_running(&self) -> bool {
        self.child.is_some()
    }

    /// Launches the gateway. A no-op when no command is configured or the
    /// gateway is already running.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be spawned.
    pub fn start(&mut self) -> Result<()> {
        let Some(command) = self.config.command.as_deref() else {
            info!("No gateway command configured, attaching to a running gateway");
            return Ok(());
        };
        if self.child.is_some() {
            return Ok(());
        }

        let child = Command::new(command)
            .args(&self.config.args)
            .arg(self.config.tws_version.to_string())
            .arg("--gateway")
            .arg(format!("--mode={}", self.config.trading_mode))
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("Failed to launch gateway with `{command}`"))?;

        info!(
            command,
            pid = child.id(),
            tws_version = self.config.tws_version,
            mode = self.config.trading_mode,
            "Gateway launched"
        );
        self.child = Some(child);
        Ok(())
    }

    /// Terminates the gateway process if this controller started it.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be killed.
    pub async fn stop(&mut self) -> Result<()> {
        let Some(mut child) = self.child.take() else {
            return Ok(());
        };

        if let Ok(Some(status)) = child.try_wait() {
            warn!(%status, "Gateway had already exited");
            return Ok(());
        }

        child.kill().await.context("Failed to terminate gateway")?;
        info!("Gateway terminated");
        Ok(())
    }
}

/// Polls the broker once per second until it reports connected or `timeout`
/// has elapsed. Returns whether the connection came up.
pub async fn wait_until_ready(broker: &dyn Broker, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if broker.is_connected().await {
            info!("Broker connection ready");
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(timeout_secs = timeout.as_secs(), "Broker connection not ready");
            return false;
        }
        debug!("Waiting for broker connection");
        tokio::time::sleep(Duration::from_secs(1)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::PaperBroker;
    use rust_decimal::Decimal;

    #[tokio::test]
    async fn attaches_when_no_command_configured() {
        let mut gateway = GatewayController::new(GatewayConfig::default());
        gateway.start().unwrap();
        assert!(!gateway.is_running());
        gateway.stop().await.unwrap();
    }

    #[tokio::test]
    async fn missing_launcher_is_an_error() {
        let mut gateway = GatewayController::new(GatewayConfig {
            command: Some("/nonexistent/ibcstart.sh".to_string()),
            ..GatewayConfig::default()
        });
        assert!(gateway.start().is_err());
        assert!(!gateway.is_running());
    }

    #[tokio::test]
    async fn ready_immediately_when_connected() {
        let broker = PaperBroker::new("DU1", Decimal::ZERO);
        assert!(wait_until_ready(&broker, Duration::from_secs(5)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn gives_up_after_timeout() {
        let broker = PaperBroker::new("DU1", Decimal::ZERO);
        broker.set_connected(false);
        assert!(!wait_until_ready(&broker, Duration::from_secs(3)).await);
    }
}
