//! Account balances the session sizes trades against.

use anyhow::{Context, Result};
use rust_decimal::Decimal;
use straddle_ib::Broker;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Account {
    pub account_num: String,
    pub cash: Decimal,
    pub cushion: Decimal,
    pub buying_power: Decimal,
    pub available_funds: Decimal,
    pub excess_liquidity: Decimal,
    pub total_cash_value: Decimal,
    pub maintenance_margin: Decimal,
}

impl Account {
    #[must_use]
    pub fn new(account_num: &str) -> Self {
        Self {
            account_num: account_num.to_string(),
            ..Self::default()
        }
    }

    /// Pulls the latest account summary from the broker.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker request fails.
    pub async fn refresh(&mut self, broker: &dyn Broker) -> Result<()> {
        let summary = broker
            .account_summary(&self.account_num)
            .await
            .with_context(|| format!("Failed to fetch account summary for {}", self.account_num))?;

        self.cash = summary.total_cash_value;
        self.cushion = summary.cushion;
        self.buying_power = summary.buying_power;
        self.available_funds = summary.available_funds;
        self.excess_liquidity = summary.excess_liquidity;
        self.total_cash_value = summary.total_cash_value;
        self.maintenance_margin = summary.maintenance_margin;

        debug!(
            account = self.account_num,
            available_funds = %self.available_funds,
            cushion = %self.cushion,
            "Account refreshed"
        );
        Ok(())
    }

    /// Whether enough funds remain to keep trading.
    #[must_use]
    pub fn is_funded(&self, min_available_funds: Decimal) -> bool {
        self.available_funds >= min_available_funds
    }
}
