//! The trading session: brings underlyings up, drives the quarter-second
//! evaluation loop across exchange opens and closes, and flattens
//! everything on the way out.

use std::collections::HashSet;
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDateTime, Timelike};
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use straddle_core::{MarketCalendar, SessionError, SignalModel, ValidationError};
use straddle_data::repositories::market_data_repo::TICK_MILLIS;
use straddle_data::UnderlyingRecord;
use straddle_ib::BrokerPosition;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::context::TradingContext;
use crate::executor::{self, PricingInputs};
use crate::monitor::{self, MonitorTarget};
use crate::underlying::TrackedUnderlying;

const SMART: &str = "SMART";
/// Ticks are taken when the clock is this close past a tick boundary.
const TICK_TOLERANCE_MS: i64 = 120;
const MIN_LOOP_SLEEP: Duration = Duration::from_millis(5);
/// Wake this long before the open to poll the rest of the way.
const OPEN_LEAD_SECS: i64 = 15;
const OPEN_POLL: Duration = Duration::from_millis(100);

fn row_exchange(row: &UnderlyingRecord) -> &str {
    let exchange = row.exchange.trim();
    if exchange.is_empty() {
        SMART
    } else {
        exchange
    }
}

/// Fails when every underlying's exchange has already closed for the day.
///
/// # Errors
///
/// Returns [`SessionError::AllExchangesClosed`].
pub fn preliminary_market_check(
    calendar: &MarketCalendar,
    rows: &[UnderlyingRecord],
    now: NaiveDateTime,
) -> Result<(), SessionError> {
    let open = rows
        .iter()
        .filter_map(|row| calendar.schedule(row_exchange(row), now.date()))
        .any(|session| now < session.close);
    if open {
        Ok(())
    } else {
        Err(SessionError::AllExchangesClosed)
    }
}

/// The tick `now` belongs to, if it falls close enough after a tick
/// boundary, along with how far past the boundary it is.
#[must_use]
pub fn tick_time(now: NaiveDateTime) -> Option<(NaiveDateTime, i64)> {
    let millis = i64::from(now.nanosecond().min(999_999_999) / 1_000_000);
    let offset = millis % TICK_MILLIS;
    if offset >= TICK_TOLERANCE_MS {
        return None;
    }
    let tick = now.with_nanosecond(0)? + ChronoDuration::milliseconds(millis - offset);
    Some((tick, offset))
}

/// Ticks skipped between two logged ticks.
#[must_use]
pub fn missed_ticks(last: NaiveDateTime, now: NaiveDateTime) -> u32 {
    let elapsed = (now - last).num_milliseconds();
    if elapsed > TICK_MILLIS {
        u32::try_from(elapsed / TICK_MILLIS - 1).unwrap_or(u32::MAX)
    } else {
        0
    }
}

/// A spawned monitor and the underlying whose straddle it owns.
pub struct RunningMonitor {
    pub symbol: String,
    pub handle: JoinHandle<()>,
}

impl RunningMonitor {
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

/// Drops finished monitors before recording a new one.
fn track_monitor(monitors: &mut Vec<RunningMonitor>, monitor: RunningMonitor) {
    monitors.retain(RunningMonitor::is_running);
    monitors.push(monitor);
}

/// Spawns a monitor for a freshly opened straddle.
pub fn launch_monitor(
    ctx: &TradingContext,
    target: MonitorTarget,
    preexisting: Vec<BrokerPosition>,
) -> RunningMonitor {
    let ctx = ctx.clone();
    let symbol = target.symbol.clone();
    let handle = tokio::spawn(async move {
        let symbol = target.symbol.clone();
        if let Err(e) = monitor::monitor(ctx, target, preexisting).await {
            error!(symbol, error = %e, "Monitor failed");
        }
    });
    RunningMonitor { symbol, handle }
}

/// Initializes every row, dropping (and logging) the ones that fail.
async fn instantiate_underlyings(
    ctx: &TradingContext,
    rows: &[UnderlyingRecord],
) -> Vec<TrackedUnderlying> {
    let session_date = ctx.session_start.date();
    let mut underlyings = Vec::with_capacity(rows.len());
    for row in rows {
        match TrackedUnderlying::initialize(ctx, row, session_date).await {
            Ok(underlying) => underlyings.push(underlying),
            Err(e) => error!(symbol = row.symbol, error = %e, "Underlying failed to initialize"),
        }
    }
    underlyings
}

/// One trading day across every configured underlying.
pub struct Session {
    ctx: TradingContext,
    account: Account,
    model: SignalModel,
    /// Initialized, waiting for their exchange to open.
    untracked: Vec<TrackedUnderlying>,
    /// Open and evaluated every tick.
    underlyings: Vec<TrackedUnderlying>,
    first_open: NaiveDateTime,
    next_open: Option<NaiveDateTime>,
    next_close: Option<NaiveDateTime>,
    close_buffer: Option<NaiveDateTime>,
    last_close: NaiveDateTime,
    monitors: Vec<RunningMonitor>,
}

impl Session {
    /// Pulls the account, initializes every underlying and checks the day's
    /// schedule makes sense.
    ///
    /// # Errors
    ///
    /// Returns an error if the account cannot be read, no underlying comes
    /// up, or the session times are inconsistent.
    pub async fn start(ctx: TradingContext, rows: &[UnderlyingRecord]) -> Result<Self> {
        let mut account = Account::new(&ctx.account_num);
        account.refresh(ctx.broker.as_ref()).await?;

        let untracked = instantiate_underlyings(&ctx, rows).await;
        if untracked.is_empty() {
            return Err(SessionError::NoValidUnderlyings.into());
        }

        let model = SignalModel::new(ctx.strategy.model);
        let mut session = Self {
            ctx,
            account,
            model,
            untracked,
            underlyings: Vec::new(),
            first_open: NaiveDateTime::MAX,
            next_open: None,
            next_close: None,
            close_buffer: None,
            last_close: NaiveDateTime::MIN,
            monitors: Vec::new(),
        };
        session.first_open = session.next_open_time().unwrap_or(NaiveDateTime::MAX);
        session.next_open = session.next_open_time();
        session.last_close = session.last_close_time().unwrap_or(NaiveDateTime::MIN);
        session.set_next_close();
        session.validate_datetimes()?;

        info!(
            underlyings = session.untracked.len(),
            first_open = %session.first_open,
            last_close = %session.last_close,
            available_funds = %session.account.available_funds,
            "Session started"
        );
        Ok(session)
    }

    #[must_use]
    pub fn tracked(&self) -> &[TrackedUnderlying] {
        &self.underlyings
    }

    #[must_use]
    pub fn untracked(&self) -> &[TrackedUnderlying] {
        &self.untracked
    }

    #[must_use]
    pub const fn account(&self) -> &Account {
        &self.account
    }

    #[must_use]
    pub const fn last_close(&self) -> NaiveDateTime {
        self.last_close
    }

    fn next_open_time(&self) -> Option<NaiveDateTime> {
        self.untracked.iter().map(|u| u.open_time).min()
    }

    /// Earliest close among open underlyings, else among waiting ones.
    fn next_close_time(&self) -> Option<NaiveDateTime> {
        self.underlyings
            .iter()
            .map(|u| u.close_time)
            .min()
            .or_else(|| self.untracked.iter().map(|u| u.close_time).min())
    }

    fn last_close_time(&self) -> Option<NaiveDateTime> {
        self.untracked
            .iter()
            .chain(self.underlyings.iter())
            .map(|u| u.close_time)
            .max()
    }

    fn set_next_close(&mut self) {
        self.next_close = self.next_close_time();
        self.close_buffer = self
            .next_close
            .map(|close| close - ChronoDuration::minutes(self.ctx.strategy.close_buffer_minutes));
    }

    fn validate_datetimes(&self) -> Result<(), SessionError> {
        let today = self.ctx.session_start.date();
        let times = self
            .untracked
            .iter()
            .flat_map(|u| [u.open_time, u.close_time])
            .chain(self.next_close)
            .chain(self.close_buffer);
        for time in times {
            if time.date() != today {
                return Err(SessionError::InvalidDatetimes(format!("{time} is not on {today}")));
            }
        }
        if self.first_open >= self.last_close {
            return Err(SessionError::InvalidDatetimes(format!(
                "first open {} is not before last close {}",
                self.first_open, self.last_close
            )));
        }
        Ok(())
    }

    /// Starts evaluating underlyings whose exchange has opened.
    fn add_open_underlyings(&mut self, now: NaiveDateTime) {
        let (open, waiting): (Vec<_>, Vec<_>) =
            self.untracked.drain(..).partition(|u| now >= u.open_time);
        self.untracked = waiting;
        for underlying in open {
            info!(symbol = underlying.symbol, "Exchange open, tracking underlying");
            self.underlyings.push(underlying);
        }
    }

    /// Shuts down underlyings whose exchange has closed.
    async fn cull_closed_underlyings(&mut self, now: NaiveDateTime) {
        let (closed, open): (Vec<_>, Vec<_>) =
            self.underlyings.drain(..).partition(|u| now >= u.close_time);
        self.underlyings = open;
        for mut underlying in closed {
            info!(symbol = underlying.symbol, "Exchange closed");
            underlying.shutdown(self.ctx.broker.as_ref()).await;
        }
    }

    /// Reacts to exchanges opening and closing. Inside the close buffer,
    /// positions are flattened every pass.
    async fn check_exchanges(&mut self, now: NaiveDateTime) {
        if let Some(next_open) = self.next_open {
            if now >= next_open {
                self.add_open_underlyings(now);
                self.next_open = self.next_open_time();
                self.set_next_close();
            }
        }

        if let Some(buffer) = self.close_buffer {
            if now >= buffer {
                self.check_for_positions().await;
                if self.next_close.is_some_and(|close| now >= close) {
                    self.cull_closed_underlyings(now).await;
                    self.set_next_close();
                }
            }
        }
    }

    /// Liquidates whatever the trade log shows still open this session,
    /// except straddles a running monitor is still responsible for.
    pub async fn check_for_positions(&self) {
        let rows = match self
            .ctx
            .db
            .repos()
            .trades
            .all_positions(self.ctx.session_start)
            .await
        {
            Ok(rows) => rows,
            Err(e) => {
                error!(error = %e, "Failed to read open positions");
                return;
            }
        };
        let monitored: HashSet<&str> = self
            .monitors
            .iter()
            .filter(|m| m.is_running())
            .map(|m| m.symbol.as_str())
            .collect();
        for row in rows {
            if monitored.contains(row.symbol.as_str()) {
                debug!(symbol = row.symbol, con_id = row.con_id, "Left to its monitor");
                continue;
            }
            if let Err(e) = executor::close_position(&self.ctx, &row).await {
                error!(symbol = row.symbol, con_id = row.con_id, error = %e, "Failed to close position");
            }
        }
    }

    /// Sleeps until shortly before the first exchange opens.
    pub async fn wait_for_market_open(&self) {
        let mut announced = false;
        loop {
            let now = self.ctx.now();
            if now >= self.first_open {
                return;
            }
            let time_to_open = self.first_open - now;
            if !announced {
                info!(first_open = %self.first_open, "Waiting for market open");
                announced = true;
            }
            let lead = (time_to_open - ChronoDuration::seconds(OPEN_LEAD_SECS))
                .to_std()
                .unwrap_or_default();
            self.ctx.sleep(lead.max(OPEN_POLL)).await;
        }
    }

    /// Logs the tick's quotes for every open underlying.
    async fn log_tick(&self, time: NaiveDateTime) {
        let market_data = &self.ctx.db.repos().market_data;
        for underlying in &self.underlyings {
            let (price, options) = underlying.snapshot();
            if let Err(e) = market_data.log_underlying_data(underlying.db_id, price, time).await {
                warn!(symbol = underlying.symbol, error = %e, "Failed to log underlying data");
            }
            if let Err(e) = market_data.log_option_data(&options, time).await {
                warn!(symbol = underlying.symbol, error = %e, "Failed to log option data");
            }
        }
    }

    /// Refreshes features for every open underlying, buys where the model
    /// signals inside the entry window, then logs the tick.
    pub async fn eval_sequence(&mut self, time: NaiveDateTime) {
        let ctx = &self.ctx;
        for underlying in &mut self.underlyings {
            if let Err(e) = underlying.refresh_features(ctx, time).await {
                warn!(symbol = underlying.symbol, error = %e, "Failed to refresh features");
                continue;
            }
            if !(self.model.eval(&underlying.features) && underlying.in_entry_window(time)) {
                continue;
            }

            debug!(symbol = underlying.symbol, features = ?underlying.features, "Buy signal");
            let preexisting = match ctx.broker.positions(&ctx.account_num).await {
                Ok(positions) => positions,
                Err(e) => {
                    error!(error = %e, "Failed to snapshot positions, skipping entry");
                    continue;
                }
            };

            match executor::buy(ctx, &self.account, underlying, time, &preexisting).await {
                Ok(true) => {
                    let target = MonitorTarget {
                        symbol: underlying.symbol.clone(),
                        pricing: PricingInputs::of(underlying),
                        entry_time: time,
                        exit_by: underlying.close_time
                            - ChronoDuration::minutes(ctx.strategy.close_buffer_minutes),
                    };
                    track_monitor(&mut self.monitors, launch_monitor(ctx, target, preexisting));
                    if let Err(e) = self.account.refresh(ctx.broker.as_ref()).await {
                        warn!(error = %e, "Failed to refresh account");
                    }
                }
                Ok(false) => info!(symbol = underlying.symbol, "No straddle opened"),
                Err(e) => match e.downcast_ref::<ValidationError>() {
                    Some(reason) => debug!(symbol = underlying.symbol, %reason, "Entry rejected"),
                    None => error!(symbol = underlying.symbol, error = %e, "Entry failed"),
                },
            }

            if let Err(e) = ctx.db.repos().market_data.log_buy_signal(underlying.db_id, time).await {
                warn!(symbol = underlying.symbol, error = %e, "Failed to log buy signal");
            }
        }

        self.log_tick(time).await;
    }

    /// Evaluates on a 250ms grid until funds run low, the last exchange
    /// closes, or no underlyings remain. Missed ticks are backfilled with
    /// NULL rows.
    ///
    /// # Errors
    ///
    /// Currently infallible; errors inside a tick are logged and skipped.
    pub async fn run_algo_loop(&mut self) -> Result<()> {
        let min_funds = Decimal::from_f64(self.ctx.strategy.min_available_funds).unwrap_or_default();
        let mut last_tick: Option<NaiveDateTime> = None;
        let mut tick = self.ctx.now();

        while self.account.is_funded(min_funds) && tick < self.last_close {
            let now = self.ctx.now();
            self.check_exchanges(now).await;
            if self.underlyings.is_empty() && self.untracked.is_empty() {
                info!("No underlyings left");
                break;
            }

            let Some((time, offset)) = tick_time(now).filter(|(t, _)| last_tick.map_or(true, |l| *t > l))
            else {
                let millis = i64::from(now.nanosecond().min(999_999_999) / 1_000_000);
                let wait = TICK_MILLIS - millis % TICK_MILLIS;
                self.ctx.sleep(Duration::from_millis(wait.unsigned_abs()).max(MIN_LOOP_SLEEP)).await;
                continue;
            };

            if let Some(last) = last_tick {
                let missed = missed_ticks(last, time);
                if missed > 0 {
                    debug!(missed, %last, "Backfilling missed ticks");
                    let targets: Vec<_> = self.underlyings.iter().map(TrackedUnderlying::null_target).collect();
                    if let Err(e) = self.ctx.db.repos().market_data.log_null(&targets, last, missed).await {
                        warn!(error = %e, "Failed to backfill ticks");
                    }
                }
            }
            last_tick = Some(time);
            tick = time;

            self.eval_sequence(time).await;

            let elapsed = (self.ctx.now() - time).num_milliseconds().max(offset);
            let wait = (TICK_MILLIS - elapsed).max(0);
            self.ctx.sleep(Duration::from_millis(wait.unsigned_abs()).max(MIN_LOOP_SLEEP)).await;
        }

        info!(
            available_funds = %self.account.available_funds,
            "Algo loop finished"
        );
        Ok(())
    }

    /// Stops monitors, flattens leftover positions and closes every data line.
    pub async fn shutdown(&mut self) {
        for monitor in self.monitors.drain(..) {
            if monitor.is_running() {
                warn!(symbol = monitor.symbol, "Aborting running monitor");
                monitor.handle.abort();
                let _ = monitor.handle.await;
            }
        }
        self.check_for_positions().await;

        let broker = self.ctx.broker.clone();
        for underlying in self.underlyings.iter_mut().chain(self.untracked.iter_mut()) {
            underlying.shutdown(broker.as_ref()).await;
        }
        self.underlyings.clear();
        self.untracked.clear();
        info!("Session shut down");
    }

    /// Waits for the open, trades the day, then shuts down.
    ///
    /// # Errors
    ///
    /// Returns the loop's error after shutdown completes.
    pub async fn run(&mut self) -> Result<()> {
        self.wait_for_market_open().await;
        let result = self.run_algo_loop().await;
        self.shutdown().await;
        result
    }
}
