//! Time source for the session.
//!
//! Every timestamp the trader logs or schedules against is exchange-local
//! (America/New_York) naive time. Trading routines sleep through the clock
//! too, so a simulated clock can run a whole session without waiting.

use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use straddle_core::calendar::market_now;

#[async_trait]
pub trait Clock: Send + Sync {
    fn now(&self) -> NaiveDateTime;

    async fn sleep(&self, duration: Duration);
}

/// The real market clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct MarketClock;

#[async_trait]
impl Clock for MarketClock {
    fn now(&self) -> NaiveDateTime {
        market_now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Starts at a fixed market time and only moves when someone sleeps on it.
///
/// A sleep advances the clock by its full duration and yields, so
/// concurrent tasks interleave without any real waiting.
#[derive(Debug)]
pub struct SimulatedClock {
    now: Mutex<NaiveDateTime>,
}

impl SimulatedClock {
    #[must_use]
    pub const fn starting_at(origin: NaiveDateTime) -> Self {
        Self {
            now: Mutex::new(origin),
        }
    }

    /// Jumps straight to `time`.
    pub fn set(&self, time: NaiveDateTime) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = time;
    }

    pub fn advance(&self, duration: Duration) {
        let step = ChronoDuration::from_std(duration).unwrap_or(ChronoDuration::MAX);
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now = now.checked_add_signed(step).unwrap_or(*now);
    }
}

#[async_trait]
impl Clock for SimulatedClock {
    fn now(&self) -> NaiveDateTime {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn sleep(&self, duration: Duration) {
        self.advance(duration);
        tokio::task::yield_now().await;
    }
}

/// `std` duration from `now` until `target`, zero when `target` has passed.
#[must_use]
pub fn until(now: NaiveDateTime, target: NaiveDateTime) -> Duration {
    (target - now).to_std().unwrap_or_default()
}
