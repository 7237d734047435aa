//! CLI commands for the straddle trader.

pub mod add_underlying;
pub mod database;
pub mod run;

pub use add_underlying::{run_add_underlying, AddUnderlyingArgs};
pub use database::{
    run_clear_trades, run_init_db, run_list_underlyings, run_positions, ClearTradesArgs,
    DatabaseArgs, PositionsArgs,
};
pub use run::{run_session, RunArgs};
