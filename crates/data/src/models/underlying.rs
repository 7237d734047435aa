//! Underlying (stock or index) definitions the trader tracks.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

pub const VALID_SEC_TYPES: [&str; 2] = ["STK", "IND"];
pub const VALID_OPTION_STYLES: [&str; 2] = ["EUROPEAN", "AMERICAN"];
pub const VALID_OPTION_SETTLEMENTS: [&str; 2] = ["CASH", "PHYSICAL"];

/// A row of the `Underlying` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct UnderlyingRecord {
    #[sqlx(rename = "ID")]
    pub id: i64,
    #[sqlx(rename = "ConID")]
    pub con_id: i64,
    #[sqlx(rename = "Symbol")]
    pub symbol: String,
    /// `STK` (stocks and ETFs) or `IND`.
    #[sqlx(rename = "SecType")]
    pub sec_type: String,
    #[sqlx(rename = "Currency")]
    pub currency: String,
    #[sqlx(rename = "OptionStyle")]
    pub option_style: String,
    #[sqlx(rename = "OptionSettlement")]
    pub option_settlement: String,
    #[sqlx(rename = "OptionMultiplier")]
    pub option_multiplier: String,
    #[sqlx(rename = "OptionExchange")]
    pub option_exchange: Option<String>,
    #[sqlx(rename = "OptionTradingClass")]
    pub option_trading_class: Option<String>,
    /// Qualifies for 60/40 long/short-term capital gains treatment.
    #[sqlx(rename = "Is1256Contract")]
    pub is_1256_contract: bool,
    #[sqlx(rename = "Exchange")]
    pub exchange: String,
    #[sqlx(rename = "PrimaryExchange")]
    pub primary_exchange: Option<String>,
}

/// Input for registering a new underlying.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewUnderlying {
    pub con_id: i64,
    pub symbol: String,
    pub sec_type: String,
    pub currency: String,
    pub option_style: String,
    pub option_settlement: String,
    pub option_multiplier: String,
    pub option_trading_class: Option<String>,
    pub is_1256_contract: bool,
    pub exchange: String,
    pub option_exchange: Option<String>,
    pub primary_exchange: Option<String>,
}

fn blank_to_none(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_uppercase())
        .filter(|v| !v.is_empty())
}

impl NewUnderlying {
    /// Upper-cases every text field and turns empty optionals into `None`.
    #[must_use]
    pub fn normalized(self) -> Self {
        Self {
            con_id: self.con_id,
            symbol: self.symbol.trim().to_uppercase(),
            sec_type: self.sec_type.trim().to_uppercase(),
            currency: self.currency.trim().to_uppercase(),
            option_style: self.option_style.trim().to_uppercase(),
            option_settlement: self.option_settlement.trim().to_uppercase(),
            option_multiplier: self.option_multiplier.trim().to_string(),
            option_trading_class: blank_to_none(self.option_trading_class),
            is_1256_contract: self.is_1256_contract,
            exchange: self.exchange.trim().to_uppercase(),
            option_exchange: blank_to_none(self.option_exchange),
            primary_exchange: blank_to_none(self.primary_exchange),
        }
    }

    /// Checks enumerated fields and required values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid field.
    pub fn validate(&self) -> Result<()> {
        if self.con_id <= 0 {
            bail!("conid must be positive, got {}", self.con_id);
        }
        if self.symbol.is_empty() {
            bail!("symbol is required");
        }
        if !VALID_SEC_TYPES.contains(&self.sec_type.as_str()) {
            bail!("invalid sec type `{}`; expected one of {VALID_SEC_TYPES:?}", self.sec_type);
        }
        if !VALID_OPTION_STYLES.contains(&self.option_style.as_str()) {
            bail!(
                "invalid option style `{}`; expected one of {VALID_OPTION_STYLES:?}",
                self.option_style
            );
        }
        if !VALID_OPTION_SETTLEMENTS.contains(&self.option_settlement.as_str()) {
            bail!(
                "invalid option settlement `{}`; expected one of {VALID_OPTION_SETTLEMENTS:?}",
                self.option_settlement
            );
        }
        if self.option_multiplier.parse::<u32>().map_or(true, |m| m == 0) {
            bail!("invalid option multiplier `{}`", self.option_multiplier);
        }
        if self.exchange.is_empty() {
            bail!("exchange is required");
        }
        Ok(())
    }
}
