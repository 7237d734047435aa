//! Tick-level market data rows.

use serde::{Deserialize, Serialize};

/// One option quote to be logged. Missing fields are stored as NULL.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct OptionSnapshot {
    pub con_id: i64,
    pub ask: Option<f64>,
    pub bid: Option<f64>,
    pub ask_iv: Option<f64>,
    pub bid_iv: Option<f64>,
}

/// An underlying and the options it had live when ticks were missed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NullTarget {
    pub underlying_id: i64,
    pub option_con_ids: Vec<i64>,
}
