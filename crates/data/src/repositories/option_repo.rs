//! Repository for the `Option` table.

use anyhow::Result;
use sqlx::SqlitePool;
use tracing::warn;

use crate::models::{NewOption, OptionRecord};

#[derive(Clone)]
pub struct OptionRepository {
    pool: SqlitePool,
}

impl OptionRepository {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Records option contracts for an underlying. Contracts already known
    /// are skipped; a failing contract does not stop the rest.
    ///
    /// Returns the number of new rows. Per-row failures are logged, not returned.
    pub async fn log_options(&self, underlying_id: i64, options: &[NewOption]) -> u64 {
        let mut inserted = 0;

        for option in options {
            let result = sqlx::query(
                r#"
                INSERT OR IGNORE INTO "Option" (
                    ConID, UnderlyingID, LastTradeDateOrContractMonth, "Right", Strike, Exchange)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                "#,
            )
            .bind(option.con_id)
            .bind(underlying_id)
            .bind(&option.expiration)
            .bind(&option.right)
            .bind(option.strike)
            .bind(&option.exchange)
            .execute(&self.pool)
            .await;

            match result {
                Ok(r) => inserted += r.rows_affected(),
                Err(e) => warn!(con_id = option.con_id, error = %e, "Failed to log option"),
            }
        }

        inserted
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn option_id_for_con_id(&self, con_id: i64) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(r#"SELECT ID FROM "Option" WHERE ConID = ?1"#)
            .bind(con_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn all_options(&self) -> Result<Vec<OptionRecord>> {
        let rows = sqlx::query_as::<_, OptionRecord>(r#"SELECT * FROM "Option" ORDER BY ID"#)
            .fetch_all(&self.pool)
            .await?;
        Ok(rows)
    }
}
