//! Typed access to each table. Every repository holds a clone of the pool.

pub mod market_data_repo;
pub mod option_repo;
pub mod trade_repo;
pub mod underlying_repo;

pub use market_data_repo::{missed_timestamps, MarketDataRepository};
pub use option_repo::OptionRepository;
pub use trade_repo::TradeRepository;
pub use underlying_repo::UnderlyingRepository;

use sqlx::SqlitePool;

#[derive(Clone)]
pub struct Repositories {
    pub underlyings: UnderlyingRepository,
    pub options: OptionRepository,
    pub market_data: MarketDataRepository,
    pub trades: TradeRepository,
}

impl Repositories {
    #[must_use]
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            underlyings: UnderlyingRepository::new(pool.clone()),
            options: OptionRepository::new(pool.clone()),
            market_data: MarketDataRepository::new(pool.clone()),
            trades: TradeRepository::new(pool),
        }
    }
}
