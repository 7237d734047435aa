//! A stock or index the session trades options on.
//!
//! Each tracked underlying owns a market data line on itself and on the
//! options nearest its spot price. The option lines follow spot as it moves:
//! the two strikes bracketing spot form the straddle set, the next strikes
//! out on either side form the strangle set.

use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDate, NaiveDateTime};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use straddle_core::calendar::Session;
use straddle_core::{volatility, Features, InitError, StrategyConfig};
use straddle_data::{Database, NewOption, NullTarget, OptionSnapshot, UnderlyingRecord};
use straddle_ib::{Broker, OptionRight, OptionsContract, Quote, SecType, UnderlyingContract};
use tracing::{debug, error, info, warn};

use crate::context::TradingContext;

const SMART: &str = "SMART";
const LOAD_POLL: Duration = Duration::from_millis(100);

/// An option with a live data line.
#[derive(Debug, Clone, PartialEq)]
pub struct TrackedOption {
    pub contract: OptionsContract,
    pub quote: Quote,
}

impl TrackedOption {
    #[must_use]
    pub fn right(&self) -> OptionRight {
        self.contract.right
    }

    #[must_use]
    pub fn strike(&self) -> Decimal {
        self.contract.strike
    }
}

pub struct TrackedUnderlying {
    pub db_id: i64,
    pub symbol: String,
    pub exchange: String,
    pub option_exchange: String,
    pub option_trading_class: Option<String>,
    pub option_multiplier: Decimal,
    pub contract: UnderlyingContract,
    pub quote: Quote,
    /// Every qualified option on the nearest expiration.
    pub chain: Vec<OptionsContract>,
    /// Unique chain strikes, ascending.
    pub strikes: Vec<Decimal>,
    pub straddle_options: Vec<TrackedOption>,
    pub strangle_options: Vec<TrackedOption>,
    /// Exchange close on the expiration day.
    pub options_expiration: NaiveDateTime,
    pub open_time: NaiveDateTime,
    pub close_time: NaiveDateTime,
    /// Earliest entry.
    pub t1: NaiveDateTime,
    /// Latest entry.
    pub t2: NaiveDateTime,
    pub features: Features,
    pub is_alive: bool,
}

impl std::fmt::Debug for TrackedUnderlying {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrackedUnderlying")
            .field("symbol", &self.symbol)
            .field("con_id", &self.contract.con_id)
            .field("strikes", &self.strikes.len())
            .field("open_time", &self.open_time)
            .field("close_time", &self.close_time)
            .field("is_alive", &self.is_alive)
            .finish_non_exhaustive()
    }
}

fn invalid_row(row: &UnderlyingRecord, reason: impl Into<String>) -> InitError {
    InitError::InvalidRow {
        symbol: row.symbol.clone(),
        reason: reason.into(),
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|v| !v.is_empty()).map(str::to_string)
}

/// Earliest and latest entry for a session. `None` when a position opened at
/// the latest entry could not be held for the full holding period.
#[must_use]
pub fn permissible_times(
    session: Session,
    strategy: &StrategyConfig,
) -> Option<(NaiveDateTime, NaiveDateTime)> {
    let t1 = session.open + ChronoDuration::minutes(strategy.entry_delay_minutes);
    let t2 = session.close - ChronoDuration::minutes(strategy.entry_cutoff_minutes);
    let latest_exit = t2 + ChronoDuration::minutes(strategy.holding_period_minutes);
    (latest_exit < session.close && t1 <= t2).then_some((t1, t2))
}

/// Strikes around `spot`: `(straddle, strangle)`.
///
/// Up to `window` strikes below the spot insertion point and `window` at or
/// above it are tracked. The straddle pair is the nearest strike below spot
/// and the nearest at or above; the rest form the strangle set. Near the ends
/// of the chain the window is cut short.
#[must_use]
pub fn adjacent_strikes(
    strikes: &[Decimal],
    spot: Decimal,
    window: usize,
) -> (Vec<Decimal>, Vec<Decimal>) {
    let idx = strikes.partition_point(|s| *s < spot);
    let lo = idx.saturating_sub(window);
    let hi = (idx + window).min(strikes.len());

    let straddle_lo = idx.saturating_sub(1).max(lo);
    let straddle_hi = (idx + 1).min(hi);

    let mut straddle = Vec::new();
    let mut strangle = Vec::new();
    for (i, strike) in strikes.iter().enumerate().take(hi).skip(lo) {
        if (straddle_lo..straddle_hi).contains(&i) {
            straddle.push(*strike);
        } else {
            strangle.push(*strike);
        }
    }
    (straddle, strangle)
}

fn positive(value: Option<Decimal>) -> Option<f64> {
    value
        .and_then(|v| v.to_f64())
        .filter(|v| v.is_finite() && *v > 0.0)
}

fn snapshot_of(option: &TrackedOption) -> OptionSnapshot {
    OptionSnapshot {
        con_id: option.contract.con_id,
        ask: option.quote.ask.and_then(|v| v.to_f64()),
        bid: option.quote.bid.and_then(|v| v.to_f64()),
        ask_iv: option.quote.ask_iv,
        bid_iv: option.quote.bid_iv,
    }
}

impl TrackedUnderlying {
    /// Brings an underlying up for the session: checks the database row,
    /// the exchange schedule, the contract, its data line and its option
    /// chain. Every data line opened along the way is closed on failure.
    ///
    /// # Errors
    ///
    /// Returns an [`InitError`] naming the first check that failed.
    pub async fn initialize(
        ctx: &TradingContext,
        row: &UnderlyingRecord,
        session_date: NaiveDate,
    ) -> Result<Self, InitError> {
        info!(symbol = row.symbol, "Initializing underlying");

        let sec_type: SecType = row
            .sec_type
            .parse()
            .map_err(|e: anyhow::Error| invalid_row(row, e.to_string()))?;
        let option_multiplier = row
            .option_multiplier
            .trim()
            .parse::<Decimal>()
            .map_err(|_| invalid_row(row, format!("multiplier `{}`", row.option_multiplier)))?;
        let exchange = non_empty(Some(row.exchange.as_str())).unwrap_or_else(|| SMART.to_string());
        let option_exchange =
            non_empty(row.option_exchange.as_deref()).unwrap_or_else(|| SMART.to_string());

        let session = ctx
            .calendar
            .schedule(&exchange, session_date)
            .filter(|s| s.open.date() == session_date && s.close.date() == session_date)
            .ok_or_else(|| InitError::NoSchedule {
                symbol: row.symbol.clone(),
                exchange: exchange.clone(),
            })?;
        let (t1, t2) = permissible_times(session, &ctx.strategy).ok_or_else(|| {
            InitError::EntryWindowTooShort {
                symbol: row.symbol.clone(),
            }
        })?;

        let contract_exchange = match sec_type {
            SecType::Stock => SMART.to_string(),
            SecType::Index => exchange.clone(),
        };

        let mut underlying = Self {
            db_id: row.id,
            symbol: row.symbol.to_uppercase(),
            exchange,
            option_exchange,
            option_trading_class: non_empty(row.option_trading_class.as_deref()),
            option_multiplier,
            contract: UnderlyingContract {
                con_id: row.con_id,
                symbol: row.symbol.to_uppercase(),
                sec_type,
                currency: row.currency.clone(),
                exchange: contract_exchange,
                primary_exchange: non_empty(row.primary_exchange.as_deref()),
            },
            quote: Quote::default(),
            chain: Vec::new(),
            strikes: Vec::new(),
            straddle_options: Vec::new(),
            strangle_options: Vec::new(),
            options_expiration: session.close,
            open_time: session.open,
            close_time: session.close,
            t1,
            t2,
            features: Features::default(),
            is_alive: true,
        };

        if let Err(e) = underlying.bring_up(ctx, row.con_id, session_date).await {
            error!(symbol = underlying.symbol, error = %e, "Underlying failed to initialize");
            underlying.shutdown(ctx.broker.as_ref()).await;
            return Err(e);
        }

        info!(
            symbol = underlying.symbol,
            con_id = underlying.contract.con_id,
            chain = underlying.chain.len(),
            expiration = %underlying.options_expiration,
            open = %underlying.open_time,
            close = %underlying.close_time,
            "Underlying initialized"
        );
        Ok(underlying)
    }

    async fn bring_up(
        &mut self,
        ctx: &TradingContext,
        expected_con_id: i64,
        session_date: NaiveDate,
    ) -> Result<(), InitError> {
        self.qualify(ctx.broker.as_ref(), expected_con_id).await?;
        self.load_data_line(ctx).await?;
        self.build_option_chain(ctx, session_date).await?;
        self.manage_option_data_lines(ctx).await;
        self.refresh_quotes(ctx.broker.as_ref()).await;
        Ok(())
    }

    async fn qualify(&mut self, broker: &dyn Broker, expected_con_id: i64) -> Result<(), InitError> {
        let not_qualified = |reason: String| InitError::ContractNotQualified {
            symbol: self.symbol.clone(),
            reason,
        };

        let qualified = broker
            .qualify_underlying(&self.contract)
            .await
            .map_err(|e| not_qualified(e.to_string()))?;

        if qualified.con_id != expected_con_id {
            return Err(not_qualified(format!(
                "con id {} does not match {expected_con_id}",
                qualified.con_id
            )));
        }
        if !qualified.symbol.eq_ignore_ascii_case(&self.symbol) {
            return Err(not_qualified(format!("symbol {} does not match", qualified.symbol)));
        }

        self.contract = qualified;
        Ok(())
    }

    /// Opens the underlying's data line and waits for a usable price.
    async fn load_data_line(&mut self, ctx: &TradingContext) -> Result<(), InitError> {
        let con_id = self.contract.con_id;
        ctx.broker.request_market_data(con_id).await?;

        let timeout_secs = ctx.strategy.load_timeout_secs;
        let deadline = ctx.deadline_after(Duration::from_secs(timeout_secs));
        info!(symbol = self.symbol, "Loading data line");

        loop {
            if let Some(quote) = ctx.broker.quote(con_id).await {
                if quote.market_price().is_some() {
                    self.quote = quote;
                    return Ok(());
                }
            }
            if ctx.now() >= deadline {
                return Err(InitError::DataLineTimeout {
                    symbol: self.symbol.clone(),
                    timeout_secs,
                });
            }
            ctx.sleep(LOAD_POLL).await;
        }
    }

    /// Qualifies a call and a put for every strike on the nearest expiration
    /// listed on the option exchange (and trading class, when set).
    async fn build_option_chain(
        &mut self,
        ctx: &TradingContext,
        session_date: NaiveDate,
    ) -> Result<(), InitError> {
        let empty_chain = || InitError::EmptyChain {
            symbol: self.symbol.clone(),
        };

        let params: Vec<_> = ctx
            .broker
            .option_chain_params(&self.contract)
            .await?
            .into_iter()
            .filter(|p| p.exchange.eq_ignore_ascii_case(&self.option_exchange))
            .filter(|p| {
                self.option_trading_class
                    .as_deref()
                    .map_or(true, |tc| p.trading_class.eq_ignore_ascii_case(tc))
            })
            .collect();

        let expiry = params
            .iter()
            .flat_map(|p| p.expirations.iter())
            .filter_map(|e| NaiveDate::parse_from_str(e, "%Y%m%d").ok().map(|d| (d, e)))
            .filter(|(date, _)| *date >= session_date)
            .min_by_key(|(date, _)| *date)
            .map(|(_, e)| e.clone())
            .ok_or_else(empty_chain)?;

        let strikes: BTreeSet<Decimal> = params
            .iter()
            .flat_map(|p| p.strikes.iter())
            .map(|s| s.normalize())
            .collect();

        let raw: Vec<OptionsContract> = strikes
            .iter()
            .flat_map(|strike| {
                [OptionRight::Call, OptionRight::Put].map(|right| {
                    let mut contract = OptionsContract::new(&self.symbol, &expiry, *strike, right);
                    contract.exchange.clone_from(&self.option_exchange);
                    contract.trading_class.clone_from(&self.option_trading_class);
                    contract.multiplier = self.option_multiplier;
                    contract.currency.clone_from(&self.contract.currency);
                    contract
                })
            })
            .collect();

        let qualified = ctx.broker.qualify_options(&raw).await?;
        let dropped = raw.len().saturating_sub(qualified.len());
        self.chain = qualified
            .into_iter()
            .filter(|c| c.con_id > 0 && c.symbol.eq_ignore_ascii_case(&self.symbol))
            .collect();
        if dropped > 0 {
            debug!(symbol = self.symbol, dropped, "Contracts failed to qualify");
        }
        if self.chain.is_empty() {
            return Err(empty_chain());
        }

        let expiry_date = NaiveDate::parse_from_str(&expiry, "%Y%m%d")
            .map_err(|e| InitError::Other(e.into()))?;
        self.options_expiration = ctx
            .calendar
            .schedule_range(&self.exchange, session_date, expiry_date)
            .map(|s| s.close)
            .ok_or_else(|| InitError::NoSchedule {
                symbol: self.symbol.clone(),
                exchange: self.exchange.clone(),
            })?;

        self.strikes = self
            .chain
            .iter()
            .map(|c| c.strike.normalize())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Ok(())
    }

    /// Spot price: last trade, else the line's market price, else the last
    /// logged price, else zero.
    pub async fn spot(&self, db: &Database) -> f64 {
        if let Some(last) = positive(self.quote.last) {
            return last;
        }
        if let Some(price) = positive(self.quote.market_price()) {
            return price;
        }
        match db.repos().market_data.spot(self.db_id).await {
            Ok(Some(price)) if price.is_finite() && price > 0.0 => price,
            Ok(_) => 0.0,
            Err(e) => {
                warn!(symbol = self.symbol, error = %e, "Failed to read logged spot");
                0.0
            }
        }
    }

    /// Keeps data lines open on exactly the strikes around spot: lines that
    /// left the window are cancelled, newly needed ones requested and their
    /// contracts recorded. A contract whose line cannot be opened is skipped
    /// and retried on the next pass.
    pub async fn manage_option_data_lines(&mut self, ctx: &TradingContext) {
        let spot = Decimal::from_f64(self.spot(&ctx.db).await).unwrap_or_default();
        let (straddle, strangle) =
            adjacent_strikes(&self.strikes, spot, ctx.strategy.strike_window);
        let straddle: HashSet<Decimal> = straddle.into_iter().collect();
        let needed: HashSet<Decimal> = straddle.iter().chain(strangle.iter()).copied().collect();

        let live: Vec<TrackedOption> = self
            .straddle_options
            .drain(..)
            .chain(self.strangle_options.drain(..))
            .collect();
        let live_con_ids: HashSet<i64> = live.iter().map(|o| o.contract.con_id).collect();

        let (mut kept, stale): (Vec<_>, Vec<_>) =
            live.into_iter().partition(|o| needed.contains(&o.strike()));
        for option in &stale {
            if let Err(e) = ctx.broker.cancel_market_data(option.contract.con_id).await {
                warn!(contract = option.contract.display_name(), error = %e, "Failed to cancel data line");
            }
        }

        let mut opened = Vec::new();
        for contract in self
            .chain
            .iter()
            .filter(|c| needed.contains(&c.strike) && !live_con_ids.contains(&c.con_id))
        {
            match ctx.broker.request_market_data(contract.con_id).await {
                Ok(()) => opened.push(contract.clone()),
                Err(e) => warn!(contract = contract.display_name(), error = %e, "Failed to open data line"),
            }
        }
        if !opened.is_empty() {
            let rows: Vec<NewOption> = opened
                .iter()
                .map(|c| NewOption {
                    con_id: c.con_id,
                    expiration: c.expiry.clone(),
                    right: c.right.as_str().to_string(),
                    strike: c.strike.to_f64().unwrap_or_default(),
                    exchange: Some(c.exchange.clone()),
                })
                .collect();
            ctx.db.repos().options.log_options(self.db_id, &rows).await;
            debug!(symbol = self.symbol, added = opened.len(), dropped = stale.len(), "Option lines moved");
            kept.extend(opened.into_iter().map(|contract| TrackedOption {
                contract,
                quote: Quote::default(),
            }));
        }

        kept.sort_by(|a, b| {
            a.strike()
                .cmp(&b.strike())
                .then_with(|| a.right().as_str().cmp(b.right().as_str()))
        });
        let (straddle_options, strangle_options): (Vec<_>, Vec<_>) =
            kept.into_iter().partition(|o| straddle.contains(&o.strike()));
        self.straddle_options = straddle_options;
        self.strangle_options = strangle_options;
    }

    /// Pulls the latest quotes off every open line.
    pub async fn refresh_quotes(&mut self, broker: &dyn Broker) {
        if let Some(quote) = broker.quote(self.contract.con_id).await {
            self.quote = quote;
        }
        for option in self
            .straddle_options
            .iter_mut()
            .chain(self.strangle_options.iter_mut())
        {
            if let Some(quote) = broker.quote(option.contract.con_id).await {
                option.quote = quote;
            }
        }
    }

    /// Rebuilds the feature vector: implied vol is the mean ask IV of the
    /// straddle options, realized vol comes from the logged price extrema.
    ///
    /// # Errors
    ///
    /// Returns an error if the extrema query fails.
    pub async fn refresh_features(&mut self, ctx: &TradingContext, time: NaiveDateTime) -> Result<()> {
        self.refresh_quotes(ctx.broker.as_ref()).await;
        self.manage_option_data_lines(ctx).await;
        self.refresh_quotes(ctx.broker.as_ref()).await;

        let iv = volatility::mean_ignoring_nan(
            self.straddle_options
                .iter()
                .map(|o| o.quote.ask_iv.unwrap_or(f64::NAN)),
        );
        let extrema = ctx
            .db
            .repos()
            .market_data
            .price_extrema(self.db_id, time, ctx.strategy.vol_lookback_minutes)
            .await?;

        self.features = Features::new(
            iv,
            volatility::realized_vol_last(&extrema),
            volatility::realized_vol_ma(&extrema),
        );
        Ok(())
    }

    /// Every option with an open line.
    #[must_use]
    pub fn options(&self) -> Vec<TrackedOption> {
        self.straddle_options
            .iter()
            .chain(self.strangle_options.iter())
            .cloned()
            .collect()
    }

    /// The underlying's last price and its straddle quotes, as logged each tick.
    #[must_use]
    pub fn snapshot(&self) -> (Option<f64>, Vec<OptionSnapshot>) {
        let price = positive(self.quote.last).or_else(|| positive(self.quote.market_price()));
        (price, self.straddle_options.iter().map(snapshot_of).collect())
    }

    #[must_use]
    pub fn null_target(&self) -> NullTarget {
        NullTarget {
            underlying_id: self.db_id,
            option_con_ids: self
                .straddle_options
                .iter()
                .map(|o| o.contract.con_id)
                .collect(),
        }
    }

    #[must_use]
    pub fn is_open(&self, now: NaiveDateTime) -> bool {
        self.open_time <= now && now < self.close_time
    }

    #[must_use]
    pub fn in_entry_window(&self, now: NaiveDateTime) -> bool {
        self.t1 <= now && now <= self.t2
    }

    /// Cancels every data line and marks the underlying dead.
    pub async fn shutdown(&mut self, broker: &dyn Broker) {
        if self.contract.con_id > 0 {
            if let Err(e) = broker.cancel_market_data(self.contract.con_id).await {
                warn!(symbol = self.symbol, error = %e, "Failed to cancel data line");
            }
        }
        for option in self.straddle_options.drain(..).chain(self.strangle_options.drain(..)) {
            if let Err(e) = broker.cancel_market_data(option.contract.con_id).await {
                warn!(contract = option.contract.display_name(), error = %e, "Failed to cancel data line");
            }
        }
        self.is_alive = false;
        info!(symbol = self.symbol, "Underlying shut down");
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::testkit::{self, EXPIRY};
    use rust_decimal_macros::dec;

    fn strikes() -> Vec<Decimal> {
        [150, 155, 160, 165, 170, 175, 180].map(Decimal::from).to_vec()
    }

    #[test]
    fn window_brackets_spot() {
        let (straddle, strangle) = adjacent_strikes(&strikes(), dec!(162.5), 3);
        assert_eq!(straddle, vec![dec!(160), dec!(165)]);
        assert_eq!(strangle, vec![dec!(150), dec!(155), dec!(170), dec!(175)]);
    }

    #[test]
    fn spot_on_a_strike_counts_as_above() {
        let (straddle, _) = adjacent_strikes(&strikes(), dec!(160), 3);
        assert_eq!(straddle, vec![dec!(155), dec!(160)]);
    }

    #[test]
    fn window_is_clamped_at_chain_edges() {
        let (straddle, strangle) = adjacent_strikes(&strikes(), dec!(151), 3);
        assert_eq!(straddle, vec![dec!(150), dec!(155)]);
        assert_eq!(strangle, vec![dec!(160), dec!(165)]);

        let (straddle, strangle) = adjacent_strikes(&strikes(), dec!(500), 3);
        assert_eq!(straddle, vec![dec!(180)]);
        assert_eq!(strangle, vec![dec!(165), dec!(170), dec!(175)]);

        assert_eq!(adjacent_strikes(&[], dec!(100), 3), (vec![], vec![]));
    }

    #[test]
    fn entry_window_needs_room_for_holding_period() {
        let day = NaiveDate::from_ymd_opt(2021, 11, 24).unwrap();
        let session = Session {
            open: day.and_hms_opt(9, 30, 0).unwrap(),
            close: day.and_hms_opt(16, 0, 0).unwrap(),
        };
        let strategy = StrategyConfig::default();
        let (t1, t2) = permissible_times(session, &strategy).unwrap();
        assert_eq!(t1, day.and_hms_opt(9, 45, 0).unwrap());
        assert_eq!(t2, day.and_hms_opt(12, 0, 0).unwrap());

        let half_day = Session {
            open: day.and_hms_opt(9, 30, 0).unwrap(),
            close: day.and_hms_opt(13, 0, 0).unwrap(),
        };
        assert!(permissible_times(half_day, &strategy).is_none());
    }

    #[tokio::test]
    async fn initializes_against_paper_broker() {
        let harness = testkit::harness().await;
        let row = harness.row().await;

        let underlying = TrackedUnderlying::initialize(&harness.ctx, &row, testkit::day())
            .await
            .unwrap();

        assert!(underlying.is_alive);
        assert_eq!(underlying.strikes.len(), 7);
        assert_eq!(underlying.chain.len(), 14);
        let straddle: Vec<_> = underlying.straddle_options.iter().map(TrackedOption::strike).collect();
        assert_eq!(straddle, vec![dec!(160), dec!(160), dec!(165), dec!(165)]);
        assert_eq!(underlying.strangle_options.len(), 8);
        assert_eq!(
            underlying.options_expiration,
            NaiveDate::parse_from_str(EXPIRY, "%Y%m%d")
                .unwrap()
                .and_hms_opt(16, 0, 0)
                .unwrap()
        );
        // underlying + 12 options
        assert_eq!(harness.broker.open_lines(), 13);
        assert_eq!(harness.db.repos().options.all_options().await.unwrap().len(), 12);
    }

    #[tokio::test]
    async fn lines_follow_spot() {
        let harness = testkit::harness().await;
        let row = harness.row().await;
        let mut underlying = TrackedUnderlying::initialize(&harness.ctx, &row, testkit::day())
            .await
            .unwrap();

        harness
            .broker
            .update_quote(testkit::UNDERLYING_CON_ID, |q| q.last = Some(dec!(171)));
        underlying.refresh_quotes(harness.broker.as_ref()).await;
        underlying.manage_option_data_lines(&harness.ctx).await;

        let straddle: HashSet<_> = underlying.straddle_options.iter().map(TrackedOption::strike).collect();
        assert_eq!(straddle, HashSet::from([dec!(170), dec!(175)]));
        // 160..180 tracked, 150 and 155 dropped
        assert_eq!(underlying.strangle_options.len(), 6);
        assert!(underlying.options().iter().all(|o| o.strike() >= dec!(160)));
        assert_eq!(harness.broker.open_lines(), 11);
    }

    #[tokio::test]
    async fn unopenable_line_is_skipped_without_leaking_the_rest() {
        let harness = testkit::harness().await;
        let row = harness.row().await;
        let mut underlying = TrackedUnderlying::initialize(&harness.ctx, &row, testkit::day())
            .await
            .unwrap();
        // the broker has no definition for this one
        let unknown = underlying
            .chain
            .iter_mut()
            .find(|c| c.strike == dec!(180) && c.right == OptionRight::Call)
            .unwrap();
        unknown.con_id = 99;

        harness
            .broker
            .update_quote(testkit::UNDERLYING_CON_ID, |q| q.last = Some(dec!(171)));
        underlying.refresh_quotes(harness.broker.as_ref()).await;
        underlying.manage_option_data_lines(&harness.ctx).await;

        assert_eq!(underlying.straddle_options.len(), 4);
        assert_eq!(underlying.strangle_options.len(), 5);
        assert!(underlying.options().iter().all(|o| o.contract.con_id != 99));
        // underlying + 9 options
        assert_eq!(harness.broker.open_lines(), 10);

        // still missing, so the next pass asks again without touching the rest
        underlying.manage_option_data_lines(&harness.ctx).await;
        assert_eq!(underlying.options().len(), 9);
        assert_eq!(harness.broker.open_lines(), 10);

        underlying.shutdown(harness.broker.as_ref()).await;
        assert_eq!(harness.broker.open_lines(), 0);
    }

    #[tokio::test]
    async fn mismatched_con_id_fails_and_closes_lines() {
        let harness = testkit::harness().await;
        let mut row = harness.row().await;
        row.con_id = 1;

        let err = TrackedUnderlying::initialize(&harness.ctx, &row, testkit::day())
            .await
            .unwrap_err();
        assert!(matches!(err, InitError::ContractNotQualified { .. }));
        assert_eq!(harness.broker.open_lines(), 0);
    }

    #[tokio::test]
    async fn dead_data_line_times_out() {
        let harness = testkit::harness().await;
        harness
            .broker
            .set_quote(testkit::UNDERLYING_CON_ID, Quote::default());
        let row = harness.row().await;

        let err = TrackedUnderlying::initialize(&harness.ctx, &row, testkit::day())
            .await
            .unwrap_err();
        assert!(matches!(err, InitError::DataLineTimeout { timeout_secs: 12, .. }));
        assert_eq!(harness.broker.open_lines(), 0);
    }

    #[tokio::test]
    async fn weekend_has_no_schedule() {
        let harness = testkit::harness().await;
        let row = harness.row().await;
        let saturday = NaiveDate::from_ymd_opt(2021, 11, 27).unwrap();

        let err = TrackedUnderlying::initialize(&harness.ctx, &row, saturday)
            .await
            .unwrap_err();
        assert!(matches!(err, InitError::NoSchedule { .. }));
    }

    #[tokio::test]
    async fn snapshot_logs_straddle_quotes() {
        let harness = testkit::harness().await;
        let row = harness.row().await;
        let underlying = TrackedUnderlying::initialize(&harness.ctx, &row, testkit::day())
            .await
            .unwrap();

        let (price, options) = underlying.snapshot();
        assert_eq!(price, Some(162.5));
        assert_eq!(options.len(), 4);
        assert!(options.iter().all(|o| o.ask.is_some() && o.ask_iv.is_some()));
        assert_eq!(underlying.null_target().option_con_ids.len(), 4);
    }
}
