//! Repository for the `Underlying` table.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::debug;

use crate::models::{NewUnderlying, UnderlyingRecord};

#[derive(Clone)]
pub struct UnderlyingRepository {
    pool: SqlitePool,
}

impl UnderlyingRepository {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Registers an underlying. Returns `false` when the symbol or conid is
    /// already present.
    ///
    /// # Errors
    /// Returns an error if the insert fails for any other reason.
    pub async fn log_underlying(&self, underlying: &NewUnderlying) -> Result<bool> {
        let result = sqlx::query(
            r"
            INSERT OR IGNORE INTO Underlying (
                ConID, Symbol, SecType, Currency, OptionStyle, OptionSettlement,
                OptionMultiplier, OptionExchange, OptionTradingClass, Is1256Contract,
                Exchange, PrimaryExchange)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ",
        )
        .bind(underlying.con_id)
        .bind(&underlying.symbol)
        .bind(&underlying.sec_type)
        .bind(&underlying.currency)
        .bind(&underlying.option_style)
        .bind(&underlying.option_settlement)
        .bind(&underlying.option_multiplier)
        .bind(&underlying.option_exchange)
        .bind(&underlying.option_trading_class)
        .bind(underlying.is_1256_contract)
        .bind(&underlying.exchange)
        .bind(&underlying.primary_exchange)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        debug!(symbol = underlying.symbol, inserted, "Logged underlying");
        Ok(inserted)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn underlying_id(&self, symbol: &str) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>("SELECT ID FROM Underlying WHERE Symbol = ?1")
            .bind(symbol)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn all_underlyings(&self) -> Result<Vec<UnderlyingRecord>> {
        let rows = sqlx::query_as::<_, UnderlyingRecord>("SELECT * FROM Underlying ORDER BY ID")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
