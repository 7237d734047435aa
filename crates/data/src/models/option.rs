//! Option contracts seen on a tracked underlying's chain.

use serde::{Deserialize, Serialize};

/// Input for `OptionRepository::log_options`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewOption {
    pub con_id: i64,
    /// `YYYYMMDD`.
    pub expiration: String,
    /// `C` or `P`.
    pub right: String,
    pub strike: f64,
    pub exchange: Option<String>,
}

/// A row of the `Option` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OptionRecord {
    #[sqlx(rename = "ID")]
    pub id: i64,
    #[sqlx(rename = "ConID")]
    pub con_id: i64,
    #[sqlx(rename = "UnderlyingID")]
    pub underlying_id: i64,
    #[sqlx(rename = "LastTradeDateOrContractMonth")]
    pub expiration: String,
    #[sqlx(rename = "Right")]
    pub right: String,
    #[sqlx(rename = "Strike")]
    pub strike: f64,
    #[sqlx(rename = "Exchange")]
    pub exchange: Option<String>,
}
