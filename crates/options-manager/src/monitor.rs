//! Watches an open straddle until it reaches the profit target or its
//! holding period runs out, then liquidates it.

use std::time::Duration;

use anyhow::Result;
use chrono::{Duration as ChronoDuration, NaiveDateTime};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use straddle_ib::BrokerPosition;
use tracing::{debug, info, warn};

use crate::context::TradingContext;
use crate::executor::{self, PricingInputs};
use crate::positions::{remove_preexisting, validate_positions, Position};

const POLL: Duration = Duration::from_millis(100);

/// One straddle handed to a monitor task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitorTarget {
    pub symbol: String,
    pub pricing: PricingInputs,
    pub entry_time: NaiveDateTime,
    /// Start of the underlying's close buffer. The straddle is sold here
    /// even if the holding period has not run out.
    pub exit_by: NaiveDateTime,
}

/// What was paid for the positions, per share.
#[must_use]
pub fn cost_basis(positions: &[Position]) -> Decimal {
    positions
        .iter()
        .map(|p| p.avg_price * Decimal::from(p.quantity))
        .sum()
}

/// Return from selling everything at the bid, as a fraction of
/// `cost_basis`. `None` while any bid is missing or too thin to take the
/// whole position.
#[must_use]
pub fn calc_return(positions: &[Position], cost_basis: Decimal) -> Option<f64> {
    if cost_basis <= Decimal::ZERO {
        return None;
    }
    let mut value = Decimal::ZERO;
    for position in positions {
        let bid = position.quote.bid.filter(|b| *b > Decimal::ZERO)?;
        if position.quote.bid_size < position.quantity {
            return None;
        }
        value += bid * Decimal::from(position.quantity);
    }
    ((value - cost_basis) / cost_basis).to_f64()
}

async fn refresh_quotes(ctx: &TradingContext, positions: &mut [Position], opened: &mut Vec<i64>) {
    for position in positions.iter_mut() {
        let con_id = position.con_id();
        match ctx.broker.quote(con_id).await {
            Some(quote) => position.quote = quote,
            None => match ctx.broker.request_market_data(con_id).await {
                Ok(()) => {
                    if !opened.contains(&con_id) {
                        opened.push(con_id);
                    }
                }
                Err(e) => warn!(
                    contract = position.contract.display_name(),
                    error = %e,
                    "Failed to open data line"
                ),
            },
        }
    }
}

/// Holds the straddle the session just bought and sells it.
///
/// Positions are backed out of the broker's report using the snapshot taken
/// before the buy, then checked against the trade log. Data lines this task
/// had to open are cancelled on the way out.
///
/// # Errors
///
/// Returns an error if positions cannot be loaded or liquidation fails.
pub async fn monitor(
    ctx: TradingContext,
    target: MonitorTarget,
    preexisting: Vec<BrokerPosition>,
) -> Result<()> {
    let sell_time = (target.entry_time + ChronoDuration::minutes(ctx.strategy.holding_period_minutes))
        .min(target.exit_by);

    let current = ctx.broker.positions(&ctx.account_num).await?;
    let opened_by_trade = remove_preexisting(current, &preexisting);
    let logged = ctx
        .db
        .repos()
        .trades
        .positions(&target.symbol, ctx.session_start)
        .await?;
    let mut positions: Vec<Position> = validate_positions(&target.symbol, &opened_by_trade, &logged)?
        .into_iter()
        .filter(|p| p.quantity > 0)
        .collect();

    if positions.is_empty() {
        warn!(symbol = target.symbol, "No open positions to monitor");
        return Ok(());
    }

    let cost = cost_basis(&positions);
    info!(
        symbol = target.symbol,
        legs = positions.len(),
        cost_basis = %cost,
        %sell_time,
        "Monitoring straddle"
    );

    let mut opened = Vec::new();
    loop {
        refresh_quotes(&ctx, &mut positions, &mut opened).await;
        if let Some(ret) = calc_return(&positions, cost) {
            debug!(symbol = target.symbol, ret, "Straddle return");
            if ret >= ctx.strategy.take_profit {
                info!(symbol = target.symbol, ret, "Take profit reached");
                break;
            }
        }
        if ctx.now() >= sell_time {
            info!(symbol = target.symbol, %sell_time, "Holding period over");
            break;
        }
        ctx.sleep(POLL).await;
    }

    let result = executor::sell(&ctx, &mut positions, Some(target.pricing)).await;

    for con_id in opened {
        if let Err(e) = ctx.broker.cancel_market_data(con_id).await {
            warn!(con_id, error = %e, "Failed to cancel data line");
        }
    }

    match &result {
        Ok(()) => info!(symbol = target.symbol, "Straddle closed"),
        Err(e) => warn!(symbol = target.symbol, error = %e, "Straddle not fully closed"),
    }
    result
}
