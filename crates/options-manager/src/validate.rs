//! Pre-trade checks.
//!
//! Quotes keep ticking while orders work, so the prices an order is placed
//! at are locked here, at validation time.

use anyhow::Result;
use chrono::NaiveDateTime;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use straddle_core::{pricing, ValidationError};
use straddle_data::Database;
use straddle_ib::{OptionRight, OptionsContract, OrderSide, Quote};
use tracing::debug;

use crate::context::TradingContext;
use crate::underlying::{TrackedOption, TrackedUnderlying};

/// Widest ask/bid ratio at which the bid is trusted as a sell price.
const MAX_SELL_SPREAD: Decimal = dec!(1.1);
/// Bids this far over the model value are treated as bad prints.
const MAX_BID_OVER_MODEL: Decimal = dec!(1.25);

/// An option that passed attribute validation, with its order price locked.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub option: TrackedOption,
    pub locked_ask: Option<Decimal>,
    pub locked_bid: Option<Decimal>,
    pub bsm_price: f64,
    /// Ask premium over the model value, as a fraction.
    pub bsm_margin: f64,
}

impl Candidate {
    fn new(option: TrackedOption) -> Self {
        Self {
            option,
            locked_ask: None,
            locked_bid: None,
            bsm_price: f64::NAN,
            bsm_margin: f64::NAN,
        }
    }

    #[must_use]
    pub const fn contract(&self) -> &OptionsContract {
        &self.option.contract
    }

    #[must_use]
    pub fn right(&self) -> OptionRight {
        self.option.contract.right
    }
}

/// The underlying's last trade, which must be a positive price.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidSpot`] otherwise.
pub fn validate_spot(quote: &Quote) -> Result<f64, ValidationError> {
    quote
        .last
        .and_then(|last| last.to_f64())
        .filter(|last| last.is_finite() && *last > 0.0)
        .ok_or(ValidationError::InvalidSpot)
}

/// Keeps the options with a tradable price on `side` and locks that price.
///
/// Buys need an ask in `(0, max_ask)` with size behind it; sells need a
/// positive bid with size.
///
/// # Errors
///
/// Returns [`ValidationError::MissingLeg`] unless at least one call and one
/// put survive.
pub fn validate_attributes(
    options: &[TrackedOption],
    side: OrderSide,
    max_ask: Decimal,
) -> Result<Vec<Candidate>, ValidationError> {
    let candidates: Vec<Candidate> = options
        .iter()
        .filter(|o| o.contract.con_id > 0)
        .filter_map(|o| {
            let quote = &o.quote;
            let mut candidate = Candidate::new(o.clone());
            match side {
                OrderSide::Buy => {
                    let ask = quote
                        .ask
                        .filter(|ask| *ask > Decimal::ZERO && *ask < max_ask && quote.ask_size > 0)?;
                    candidate.locked_ask = Some(ask);
                }
                OrderSide::Sell => {
                    let bid = quote
                        .bid
                        .filter(|bid| *bid > Decimal::ZERO && quote.bid_size > 0)?;
                    candidate.locked_bid = Some(bid);
                }
            }
            Some(candidate)
        })
        .collect();

    let has_call = candidates.iter().any(|c| c.right() == OptionRight::Call);
    let has_put = candidates.iter().any(|c| c.right() == OptionRight::Put);
    if !(has_call && has_put) {
        return Err(ValidationError::MissingLeg);
    }
    Ok(candidates)
}

/// Refuses a second straddle on an underlying already traded this session.
///
/// # Errors
///
/// Returns [`ValidationError::PositionExists`] when a net position is open,
/// or the query error.
pub async fn check_for_position(db: &Database, symbol: &str, since: NaiveDateTime) -> Result<()> {
    let size = db.repos().trades.position_size(symbol, since).await?;
    if size != 0 {
        return Err(ValidationError::PositionExists {
            symbol: symbol.to_string(),
        }
        .into());
    }
    Ok(())
}

/// Black-Scholes value of one contract.
#[must_use]
pub fn model_price(contract: &OptionsContract, spot: f64, sigma: f64, tenor: f64, r: f64) -> f64 {
    let strike = contract.strike.to_f64().unwrap_or(f64::NAN);
    match contract.right {
        OptionRight::Call => pricing::price_call(spot, strike, tenor, sigma, r),
        OptionRight::Put => pricing::price_put(spot, strike, tenor, sigma, r),
    }
}

/// Prices every candidate with one tenor and sigma.
///
/// # Errors
///
/// Returns [`ValidationError::InvalidTenor`] once the options have expired.
pub fn price_options(
    candidates: &mut [Candidate],
    spot: f64,
    sigma: f64,
    expiration: NaiveDateTime,
    now: NaiveDateTime,
    r: f64,
) -> Result<(), ValidationError> {
    let tenor = pricing::tenor_years(expiration, now)?;
    for candidate in candidates.iter_mut() {
        candidate.bsm_price = model_price(candidate.contract(), spot, sigma, tenor, r);
    }
    Ok(())
}

/// Splits the candidates whose ask sits less than `max_premium` over the
/// model value into `(puts, calls)`.
///
/// # Errors
///
/// Returns [`ValidationError::NoValidAsks`] when either leg comes up empty.
pub fn validate_ask_prices(
    candidates: Vec<Candidate>,
    max_premium: f64,
) -> Result<(Vec<Candidate>, Vec<Candidate>), ValidationError> {
    let valid = candidates.into_iter().filter_map(|mut candidate| {
        let ask = candidate.locked_ask.and_then(|a| a.to_f64())?;
        let bsm = candidate.bsm_price;
        if !(bsm.is_finite() && bsm > 0.0) {
            return None;
        }
        let margin = (ask - bsm) / bsm;
        debug!(
            contract = candidate.contract().display_name(),
            ask,
            bsm,
            margin,
            "Ask against model"
        );
        (margin < max_premium).then(|| {
            candidate.bsm_margin = margin;
            candidate
        })
    });

    let (puts, calls): (Vec<_>, Vec<_>) = valid.partition(|c| c.right() == OptionRight::Put);
    if puts.is_empty() || calls.is_empty() {
        return Err(ValidationError::NoValidAsks);
    }
    Ok((puts, calls))
}

fn cheapest(candidates: Vec<Candidate>) -> Option<Candidate> {
    candidates
        .into_iter()
        .min_by(|a, b| a.bsm_margin.total_cmp(&b.bsm_margin))
}

/// The put and the call with the smallest premium over model, put first.
#[must_use]
pub fn optimize_pair(puts: Vec<Candidate>, calls: Vec<Candidate>) -> Option<(Candidate, Candidate)> {
    Some((cheapest(puts)?, cheapest(calls)?))
}

/// Runs every buy-side check and returns the `(put, call)` to buy.
///
/// # Errors
///
/// Returns a [`ValidationError`] (inside `anyhow`) when a check rejects the
/// trade, or a database error.
pub async fn validate_buy(
    ctx: &TradingContext,
    underlying: &TrackedUnderlying,
    time: NaiveDateTime,
) -> Result<(Candidate, Candidate)> {
    check_for_position(&ctx.db, &underlying.symbol, ctx.session_start).await?;

    let max_ask = Decimal::from_f64(ctx.strategy.max_ask).unwrap_or(Decimal::MAX);
    let mut candidates = validate_attributes(&underlying.options(), OrderSide::Buy, max_ask)?;

    let spot = validate_spot(&underlying.quote)?;
    let sigma = ctx
        .db
        .repos()
        .market_data
        .sigma(underlying.db_id, time, ctx.strategy.vol_lookback_minutes)
        .await?;
    price_options(
        &mut candidates,
        spot,
        sigma,
        underlying.options_expiration,
        time,
        ctx.strategy.risk_free_rate,
    )?;

    let (puts, calls) = validate_ask_prices(candidates, ctx.strategy.max_bsm_premium)?;
    let pair = optimize_pair(puts, calls).ok_or(ValidationError::NoValidAsks)?;
    Ok(pair)
}

/// Limit price for closing a long position.
///
/// The bid is used while the spread is tight, the model value otherwise,
/// and the model value again whenever the bid runs far above it. `None`
/// when neither is usable.
#[must_use]
pub fn sell_price(quote: &Quote, bsm_price: Option<f64>) -> Option<Decimal> {
    let bsm = bsm_price
        .filter(|p| p.is_finite() && *p > 0.0)
        .and_then(Decimal::from_f64);
    let bid = quote.bid.filter(|b| *b > Decimal::ZERO);
    let spread = quote.ask.zip(bid).map(|(ask, bid)| ask / bid);

    let mut price = match spread {
        Some(spread) if spread > Decimal::ZERO && spread < MAX_SELL_SPREAD => bid,
        _ => bsm,
    };
    if let (Some(bid), Some(model)) = (bid, bsm) {
        if bid / model > MAX_BID_OVER_MODEL {
            price = Some(model);
        }
    }
    price.map(|p| p.round_dp(2))
}
