//! Repository for tick data: `UnderlyingData`, `OptionData` and `BuySignal`.
//!
//! Ticks land every 250ms. Duplicate (id, time) rows are ignored so a replayed
//! tick never fails the trading loop.

use anyhow::Result;
use chrono::{Duration, NaiveDateTime};
use sqlx::SqlitePool;
use tracing::{debug, warn};

use straddle_core::volatility;

use crate::models::{NullTarget, OptionSnapshot};

/// Spacing between logged ticks.
pub const TICK_MILLIS: i64 = 250;

#[derive(Clone)]
pub struct MarketDataRepository {
    pool: SqlitePool,
}

impl MarketDataRepository {
    #[must_use]
    pub const fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn log_underlying_data(
        &self,
        underlying_id: i64,
        price: Option<f64>,
        time: NaiveDateTime,
    ) -> Result<()> {
        sqlx::query(
            "INSERT OR IGNORE INTO UnderlyingData (UnderlyingID, Time, Price) VALUES (?1, ?2, ?3)",
        )
        .bind(underlying_id)
        .bind(time)
        .bind(price.filter(|p| p.is_finite()))
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Logs one quote row per option. Options missing from the `Option`
    /// table are skipped.
    ///
    /// # Errors
    /// Returns an error if a lookup or insert fails.
    pub async fn log_option_data(&self, options: &[OptionSnapshot], time: NaiveDateTime) -> Result<()> {
        for option in options {
            let Some(option_id) = self.option_id(option.con_id).await? else {
                debug!(con_id = option.con_id, "Option not registered, skipping quote");
                continue;
            };

            sqlx::query(
                r"
                INSERT OR IGNORE INTO OptionData (OptionID, Time, Ask, Bid, AskImpVol, BidImpVol)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6)
                ",
            )
            .bind(option_id)
            .bind(time)
            .bind(finite(option.ask))
            .bind(finite(option.bid))
            .bind(finite(option.ask_iv))
            .bind(finite(option.bid_iv))
            .execute(&self.pool)
            .await?;
        }
        Ok(())
    }

    /// Backfills NULL rows for ticks the loop missed so the tick grid stays
    /// gap-free.
    ///
    /// # Errors
    /// Returns an error if a lookup fails. Individual insert failures are logged.
    pub async fn log_null(
        &self,
        targets: &[NullTarget],
        last_logged_time: NaiveDateTime,
        num_ticks_missed: u32,
    ) -> Result<()> {
        for time in missed_timestamps(last_logged_time, num_ticks_missed) {
            for target in targets {
                if let Err(e) = self.log_underlying_data(target.underlying_id, None, time).await {
                    warn!(underlying_id = target.underlying_id, error = %e, "Failed to backfill tick");
                }

                let blanks: Vec<OptionSnapshot> = target
                    .option_con_ids
                    .iter()
                    .map(|con_id| OptionSnapshot {
                        con_id: *con_id,
                        ..OptionSnapshot::default()
                    })
                    .collect();
                self.log_option_data(&blanks, time).await?;
            }
        }
        Ok(())
    }

    /// # Errors
    /// Returns an error if the insert fails.
    pub async fn log_buy_signal(&self, underlying_id: i64, time: NaiveDateTime) -> Result<()> {
        sqlx::query("INSERT OR IGNORE INTO BuySignal (UnderlyingID, Time) VALUES (?1, ?2)")
            .bind(underlying_id)
            .bind(time)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    /// Low and high price for each minute after `time - lookback_minutes`,
    /// oldest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn price_extrema(
        &self,
        underlying_id: i64,
        time: NaiveDateTime,
        lookback_minutes: i64,
    ) -> Result<Vec<(f64, f64)>> {
        let since = time - Duration::minutes(lookback_minutes);
        let rows = sqlx::query_as::<_, (f64, f64)>(
            r"
            SELECT MIN(Price), MAX(Price)
            FROM UnderlyingData
            WHERE UnderlyingID = ?1
                AND Time > ?2
                AND Price IS NOT NULL
            GROUP BY strftime('%Y%m%d%H%M', Time)
            ORDER BY MIN(Time) ASC
            ",
        )
        .bind(underlying_id)
        .bind(since)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Realized volatility over the lookback window. NaN without data.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn sigma(
        &self,
        underlying_id: i64,
        time: NaiveDateTime,
        lookback_minutes: i64,
    ) -> Result<f64> {
        let extrema = self.price_extrema(underlying_id, time, lookback_minutes).await?;
        Ok(volatility::realized_vol_ma(&extrema))
    }

    /// Last logged non-NULL price.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn spot(&self, underlying_id: i64) -> Result<Option<f64>> {
        let price = sqlx::query_scalar::<_, f64>(
            r"
            SELECT Price
            FROM UnderlyingData
            WHERE UnderlyingID = ?1 AND Price IS NOT NULL
            ORDER BY Time DESC
            LIMIT 1
            ",
        )
        .bind(underlying_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(price)
    }

    /// Every logged tick for an underlying, oldest first.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn underlying_ticks(&self, underlying_id: i64) -> Result<Vec<(NaiveDateTime, Option<f64>)>> {
        let rows = sqlx::query_as::<_, (NaiveDateTime, Option<f64>)>(
            "SELECT Time, Price FROM UnderlyingData WHERE UnderlyingID = ?1 ORDER BY Time ASC",
        )
        .bind(underlying_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Number of quote rows logged for an option contract.
    ///
    /// # Errors
    /// Returns an error if the query fails.
    pub async fn option_tick_count(&self, con_id: i64) -> Result<i64> {
        let count = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT COUNT(*)
            FROM OptionData AS d
            JOIN "Option" AS o ON d.OptionID = o.ID
            WHERE o.ConID = ?1
            "#,
        )
        .bind(con_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(count)
    }

    /// # Errors
    /// Returns an error if the query fails.
    pub async fn buy_signal_count(&self, underlying_id: i64) -> Result<i64> {
        let count =
            sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM BuySignal WHERE UnderlyingID = ?1")
                .bind(underlying_id)
                .fetch_one(&self.pool)
                .await?;
        Ok(count)
    }

    async fn option_id(&self, con_id: i64) -> Result<Option<i64>> {
        let id = sqlx::query_scalar::<_, i64>(r#"SELECT ID FROM "Option" WHERE ConID = ?1"#)
            .bind(con_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(id)
    }
}

fn finite(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite())
}

/// Timestamps of the `num_ticks_missed` ticks after `last_logged_time`.
#[must_use]
pub fn missed_timestamps(last_logged_time: NaiveDateTime, num_ticks_missed: u32) -> Vec<NaiveDateTime> {
    (1..=i64::from(num_ticks_missed))
        .map(|i| last_logged_time + Duration::milliseconds(i * TICK_MILLIS))
        .collect()
}
