//! Repository for executed trades and the positions derived from them.
//!
//! The database only knows about trades this process placed. The broker's
//! own position list is the authority; these queries scope to one session
//! via a `since` time.

use anyhow::Result;
use chrono::NaiveDateTime;
use sqlx::SqlitePool;
use tracing::{info, warn};

use crate::models::{PositionRecord, TradeRecord, TradeRow};

const POSITION_COLUMNS: &str = r#"
    SELECT SUM(t.Quantity) AS quantity,
           CAST(COALESCE(
               SUM(CASE WHEN t.Quantity > 0 THEN t.Quantity * t.AvgPrice END)
               / SUM(CASE WHEN t.Quantity > 0 THEN t.Quantity END),
               0.0) AS REAL) AS avg_price,
           o.ConID AS con_id,
           o.Strike AS strike,
           o."Right" AS "right",
           o.Exchange AS exchange,
           o.LastTradeDateOrContractMonth AS expiration,
           u.Symbol AS symbol,
           u.OptionMultiplier AS multiplier,
           u.OptionTradingClass AS trading_class
    FROM Trade AS t
    JOIN "Option" AS o ON t.OptionID = o.ID
    JOIN Underlying AS u ON o.UnderlyingID = u.ID
"#;

#[derive(Clone)]
pub struct TradeRepository {
    pool: SqlitePool,
}

impl TradeRepository {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records a fill. Returns `false` when the contract is not in the
    /// `Option` table, in which case nothing is written.
    ///
    /// # Errors
    /// Returns an error if the lookup or insert fails.
    pub async fn log_trade(&self, trade: &TradeRecord) -> Result<bool> {
        let option_id =
            sqlx::query_scalar::<_, i64>(r#"SELECT ID FROM "Option" WHERE ConID = ?1"#)
                .bind(trade.con_id)
                .fetch_optional(&self.pool)
                .await?;

        let Some(option_id) = option_id else {
            warn!(con_id = trade.con_id, "Trade for unregistered option not logged");
            return Ok(false);
        };

        sqlx::query(
            r"
            INSERT INTO Trade (AccountNum, Time, OptionID, OrderRef, Quantity, AvgPrice, Commission)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            ",
        )
        .bind(&trade.account)
        .bind(trade.time)
        .bind(option_id)
        .bind(&trade.order_ref)
        .bind(trade.quantity)
        .bind(trade.avg_price)
        .bind(trade.commission)
        .execute(&self.pool)
        .await?;

        info!(
            con_id = trade.con_id,
            order_ref = trade.order_ref,
            quantity = trade.quantity,
            avg_price = trade.avg_price,
            "Trade logged"
        );
        Ok(true)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn all_trades(&self) -> Result<Vec<TradeRow>> {
        let rows = sqlx::query_as::<_, TradeRow>("SELECT * FROM Trade ORDER BY Time, ID")
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Returns the number of rows removed.
    ///
    /// # Errors
    /// Returns an error if the delete fails.
    pub async fn delete_all_trades(&self) -> Result<u64> {
        let result = sqlx::query("DELETE FROM Trade").execute(&self.pool).await?;
        Ok(result.rows_affected())
    }

    /// Net contracts held in `symbol`'s options from trades after `since`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn position_size(&self, symbol: &str, since: NaiveDateTime) -> Result<i64> {
        let size = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COALESCE(SUM(t.Quantity), 0)
            FROM Trade AS t
            JOIN "Option" AS o ON t.OptionID = o.ID
            JOIN Underlying AS u ON o.UnderlyingID = u.ID
            WHERE u.Symbol = ?1 AND t.Time > ?2
            "#,
        )
        .bind(symbol)
        .bind(since)
        .fetch_one(&self.pool)
        .await?;
        Ok(size)
    }

    /// Open positions in `symbol`'s options from trades after `since`, one
    /// row per contract. Flat contracts are left out.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn positions(&self, symbol: &str, since: NaiveDateTime) -> Result<Vec<PositionRecord>> {
        let sql = format!(
            "{POSITION_COLUMNS} WHERE u.Symbol = ?1 AND t.Time > ?2 \
             GROUP BY o.ID HAVING SUM(t.Quantity) != 0 ORDER BY o.Strike, o.\"Right\""
        );
        let rows = sqlx::query_as::<_, PositionRecord>(&sql)
            .bind(symbol)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }

    /// Open positions across every symbol from trades after `since`.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn all_positions(&self, since: NaiveDateTime) -> Result<Vec<PositionRecord>> {
        let sql = format!(
            "{POSITION_COLUMNS} WHERE t.Time > ?1 \
             GROUP BY o.ID HAVING SUM(t.Quantity) != 0 ORDER BY u.Symbol, o.Strike, o.\"Right\""
        );
        let rows = sqlx::query_as::<_, PositionRecord>(&sql)
            .bind(since)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
