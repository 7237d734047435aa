//! Row and input models. Prices are stored as SQLite REALs (`f64`).

pub mod market_data;
pub mod option;
pub mod trade;
pub mod underlying;

pub use market_data::{NullTarget, OptionSnapshot};
pub use option::{NewOption, OptionRecord};
pub use trade::{PositionRecord, TradeRecord, TradeRow};
pub use underlying::{
    NewUnderlying, UnderlyingRecord, VALID_OPTION_SETTLEMENTS, VALID_OPTION_STYLES,
    VALID_SEC_TYPES,
};
