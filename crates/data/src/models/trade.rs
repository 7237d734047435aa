//! Executed trades and the positions aggregated from them.

use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};

/// A fill to be recorded. `quantity` is signed: buys positive, sells negative.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TradeRecord {
    pub account: String,
    pub time: NaiveDateTime,
    pub con_id: i64,
    pub order_ref: String,
    pub quantity: i64,
    pub avg_price: f64,
    pub commission: f64,
}

/// A row of the `Trade` table.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct TradeRow {
    #[sqlx(rename = "ID")]
    pub id: i64,
    #[sqlx(rename = "AccountNum")]
    pub account: String,
    #[sqlx(rename = "Time")]
    pub time: NaiveDateTime,
    #[sqlx(rename = "OptionID")]
    pub option_id: i64,
    #[sqlx(rename = "OrderRef")]
    pub order_ref: String,
    #[sqlx(rename = "Quantity")]
    pub quantity: i64,
    #[sqlx(rename = "AvgPrice")]
    pub avg_price: f64,
    #[sqlx(rename = "Commission")]
    pub commission: f64,
}

/// Net position in one option contract, aggregated from trades since a time.
///
/// `avg_price` is the quantity-weighted average of the buy fills.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, sqlx::FromRow)]
pub struct PositionRecord {
    pub quantity: i64,
    pub avg_price: f64,
    pub con_id: i64,
    pub strike: f64,
    pub right: String,
    pub exchange: Option<String>,
    pub expiration: String,
    pub symbol: String,
    pub multiplier: String,
    pub trading_class: Option<String>,
}
