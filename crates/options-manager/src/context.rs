//! Shared handles passed to every trading routine.

use std::sync::Arc;
use std::time::Duration;

use chrono::{Duration as ChronoDuration, NaiveDateTime};
use straddle_core::{MarketCalendar, StrategyConfig};
use straddle_data::Database;
use straddle_ib::Broker;

use crate::clock::Clock;

/// Cheap to clone into spawned monitor tasks.
#[derive(Clone)]
pub struct TradingContext {
    pub broker: Arc<dyn Broker>,
    pub db: Database,
    pub clock: Arc<dyn Clock>,
    pub calendar: Arc<MarketCalendar>,
    pub strategy: StrategyConfig,
    pub account_num: String,
    /// Trades logged before this instant belong to earlier sessions.
    pub session_start: NaiveDateTime,
}

impl TradingContext {
    #[must_use]
    pub fn now(&self) -> NaiveDateTime {
        self.clock.now()
    }

    /// The session time `duration` from now.
    #[must_use]
    pub fn deadline_after(&self, duration: Duration) -> NaiveDateTime {
        let now = self.now();
        ChronoDuration::from_std(duration)
            .ok()
            .and_then(|d| now.checked_add_signed(d))
            .unwrap_or(NaiveDateTime::MAX)
    }

    pub async fn sleep(&self, duration: Duration) {
        self.clock.sleep(duration).await;
    }

    /// Sleeps until `target` on the session clock.
    pub async fn sleep_until(&self, target: NaiveDateTime) {
        self.clock.sleep(crate::clock::until(self.now(), target)).await;
    }
}
