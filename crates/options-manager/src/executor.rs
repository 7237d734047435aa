//! Order execution for opening and closing straddles.

use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::NaiveDateTime;
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use straddle_core::{pricing, OrderError, ValidationError};
use straddle_data::{PositionRecord, TradeRecord};
use straddle_ib::{
    BrokerPosition, LimitOrder, OptionRight, OptionsContract, OrderSide, OrderState,
    OrderStatus, TimeInForce,
};
use tracing::{debug, error, info, warn};

use crate::account::Account;
use crate::context::TradingContext;
use crate::positions::{remove_preexisting, Position};
use crate::underlying::TrackedUnderlying;
use crate::validate::{self, Candidate};

const ORDER_POLL: Duration = Duration::from_millis(10);
const LIQUIDATION_PAUSE: Duration = Duration::from_millis(500);
const QUOTE_POLL: Duration = Duration::from_millis(100);

/// What the model needs to value an option after entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PricingInputs {
    pub underlying_id: i64,
    pub underlying_con_id: i64,
    pub expiration: NaiveDateTime,
}

impl PricingInputs {
    #[must_use]
    pub fn of(underlying: &TrackedUnderlying) -> Self {
        Self {
            underlying_id: underlying.db_id,
            underlying_con_id: underlying.contract.con_id,
            expiration: underlying.options_expiration,
        }
    }
}

/// Straddles to buy: the lesser of the thinnest ask and what
/// `capital_fraction` of available funds pays for.
#[must_use]
pub fn order_quantity(
    put: &Candidate,
    call: &Candidate,
    available_funds: Decimal,
    capital_fraction: f64,
) -> i64 {
    let fraction = Decimal::from_f64(capital_fraction).unwrap_or_default();
    let max_deployable = available_funds * fraction;

    let straddle_cost: Decimal = [put, call]
        .iter()
        .map(|c| c.locked_ask.unwrap_or_default() * c.contract().multiplier)
        .sum();
    if straddle_cost <= Decimal::ZERO {
        return 0;
    }

    let min_ask_size = put.option.quote.ask_size.min(call.option.quote.ask_size).max(0);
    let affordable = (max_deployable / straddle_cost).floor().to_i64().unwrap_or(0);
    affordable.min(min_ask_size).max(0)
}

/// A sweep-to-fill limit order, regular hours only.
///
/// # Errors
///
/// Returns [`ValidationError::ZeroQuantity`] for a non-positive quantity.
pub fn build_order(
    side: OrderSide,
    quantity: i64,
    price: Decimal,
    tif: TimeInForce,
    account: &str,
) -> Result<LimitOrder, ValidationError> {
    if quantity <= 0 {
        return Err(ValidationError::ZeroQuantity);
    }
    Ok(LimitOrder {
        side,
        quantity,
        limit_price: price,
        tif,
        account: account.to_string(),
    })
}

/// Waits for an order to reach a final state. An inactive order ends the
/// wait if anything filled. Orders still working after the timeout are
/// cancelled.
async fn wait_for_order(ctx: &TradingContext, order_id: &str) -> Result<OrderState> {
    let timeout_secs = ctx.strategy.order_timeout_secs;
    let deadline = ctx.deadline_after(Duration::from_secs(timeout_secs));

    loop {
        let state = ctx.broker.order_state(order_id).await?;
        if state.status.is_done() {
            return Ok(state);
        }
        if state.status == OrderStatus::Inactive {
            if state.filled() > 0 {
                return Ok(state);
            }
            return Err(OrderError::Inactive {
                order_id: order_id.to_string(),
            }
            .into());
        }
        if ctx.now() >= deadline {
            let timed_out = OrderError::TimedOut {
                order_id: order_id.to_string(),
                timeout_secs,
            };
            warn!(order_id, error = %timed_out, "Cancelling order");
            ctx.broker.cancel_order(order_id).await?;
            return ctx.broker.order_state(order_id).await;
        }
        ctx.sleep(ORDER_POLL).await;
    }
}

async fn log_fill(ctx: &TradingContext, state: &OrderState) {
    let trade = TradeRecord {
        account: ctx.account_num.clone(),
        time: ctx.now(),
        con_id: state.contract.con_id,
        order_ref: state.order_id.clone(),
        quantity: state.filled() * state.order.side.sign(),
        avg_price: state.avg_fill_price().to_f64().unwrap_or_default(),
        commission: state.commission().to_f64().unwrap_or_default(),
    };
    match ctx.db.repos().trades.log_trade(&trade).await {
        Ok(true) => {}
        Ok(false) => warn!(
            contract = state.contract.display_name(),
            order_id = state.order_id,
            "Fill on an unrecorded option, trade not logged"
        ),
        Err(e) => error!(order_id = state.order_id, error = %e, "Failed to log trade"),
    }
}

/// Works an order until it fills or `max_order_attempts` attempts come back
/// empty, re-submitting the unfilled remainder each time. Every fill is
/// logged as a trade. Returns the quantity filled.
///
/// # Errors
///
/// Returns an error if the broker rejects a request outright.
pub async fn execute(ctx: &TradingContext, contract: &OptionsContract, order: LimitOrder) -> Result<i64> {
    let max_failures = ctx.strategy.max_order_attempts;
    let mut unfilled = order.quantity;
    let mut total_filled = 0;
    let mut failures = 0;

    while unfilled > 0 && failures < max_failures {
        let attempt = LimitOrder {
            quantity: unfilled,
            ..order.clone()
        };
        let order_id = ctx
            .broker
            .place_order(contract, &attempt)
            .await
            .with_context(|| format!("Failed to place order for {}", contract.display_name()))?;

        let state = match wait_for_order(ctx, &order_id).await {
            Ok(state) => state,
            Err(e) if e.downcast_ref::<OrderError>().is_some() => {
                warn!(order_id, error = %e, "Order failed");
                failures += 1;
                continue;
            }
            Err(e) => return Err(e),
        };

        let filled = state.filled();
        if filled > 0 {
            total_filled += filled;
            unfilled = state.remaining();
            log_fill(ctx, &state).await;
            info!(
                contract = contract.display_name(),
                side = %attempt.side,
                filled,
                avg_price = %state.avg_fill_price(),
                "Order filled"
            );
        } else {
            failures += 1;
            debug!(order_id, failures, "Order came back empty");
        }
    }

    Ok(total_filled)
}

/// Opens a long straddle on `underlying`: validates, buys the put, then buys
/// the call in whatever quantity the put filled, then evens the legs out.
/// Returns whether a balanced straddle is open.
///
/// # Errors
///
/// Returns a [`ValidationError`] (inside `anyhow`) when the trade is
/// rejected before any order, or a broker or database error.
pub async fn buy(
    ctx: &TradingContext,
    account: &Account,
    underlying: &TrackedUnderlying,
    time: NaiveDateTime,
    preexisting: &[BrokerPosition],
) -> Result<bool> {
    let (put, call) = validate::validate_buy(ctx, underlying, time).await?;
    let mut quantity = order_quantity(&put, &call, account.available_funds, ctx.strategy.capital_fraction);
    if quantity == 0 {
        return Err(ValidationError::ZeroQuantity.into());
    }

    info!(
        symbol = underlying.symbol,
        put = put.contract().display_name(),
        call = call.contract().display_name(),
        quantity,
        "Opening straddle"
    );

    let mut put_filled = 0;
    let mut call_filled = 0;
    for leg in [&put, &call] {
        if quantity == 0 {
            break;
        }
        let price = leg.locked_ask.ok_or(ValidationError::NoValidAsks)?;
        let order = build_order(OrderSide::Buy, quantity, price, TimeInForce::Day, &ctx.account_num)?;
        let filled = execute(ctx, leg.contract(), order).await?;
        match leg.right() {
            OptionRight::Put => put_filled += filled,
            OptionRight::Call => call_filled += filled,
        }
        quantity = filled;
    }

    let pair = [put, call];
    let balanced = audit(ctx, underlying, preexisting, &pair, call_filled, put_filled).await?;
    Ok(balanced && put_filled > 0 && call_filled > 0)
}

/// Makes sure both legs hold the same number of contracts, aborting the
/// trade when they cannot be evened out. Returns whether the legs balance.
///
/// # Errors
///
/// Returns an error if an order or the abort fails.
pub async fn audit(
    ctx: &TradingContext,
    underlying: &TrackedUnderlying,
    preexisting: &[BrokerPosition],
    pair: &[Candidate],
    calls: i64,
    puts: i64,
) -> Result<bool> {
    if calls == puts {
        return Ok(true);
    }

    let short_leg = if puts < calls { OptionRight::Put } else { OptionRight::Call };
    warn!(symbol = underlying.symbol, calls, puts, "Straddle legs unbalanced");

    let unbalanced = balance_position(ctx, pair, OrderSide::Buy, short_leg, (calls - puts).abs()).await?;
    if unbalanced > 0 {
        error!(symbol = underlying.symbol, unbalanced, "Failed to balance legs, aborting trade");
        abort_trade(ctx, preexisting, PricingInputs::of(underlying)).await?;
        return Ok(false);
    }
    Ok(true)
}

/// Evens out the legs with IOC orders: buys the short leg, and whenever a
/// round fills nothing, flips to selling the long leg instead. Gives up
/// after `max_balance_depth` rounds. Returns the quantity still unbalanced.
///
/// # Errors
///
/// Returns an error if the broker rejects an order.
pub async fn balance_position(
    ctx: &TradingContext,
    pair: &[Candidate],
    side: OrderSide,
    right: OptionRight,
    quantity: i64,
) -> Result<i64> {
    let mut side = side;
    let mut right = right;
    let mut quantity = quantity;

    for depth in 1..=ctx.strategy.max_balance_depth {
        if quantity == 0 {
            break;
        }
        let Some(leg) = pair.iter().find(|c| c.right() == right) else {
            warn!(%right, "No leg to balance with");
            return Ok(quantity);
        };

        let price = match side {
            OrderSide::Buy => leg.locked_ask,
            OrderSide::Sell => ctx
                .broker
                .quote(leg.contract().con_id)
                .await
                .and_then(|q| q.bid)
                .filter(|bid| *bid > Decimal::ZERO),
        };

        let filled = match price {
            Some(price) => {
                let order = build_order(side, quantity, price, TimeInForce::Ioc, &ctx.account_num)?;
                execute(ctx, leg.contract(), order).await?
            }
            None => 0,
        };
        debug!(depth, %side, %right, quantity, filled, "Balancing round");

        if filled > 0 {
            quantity -= filled;
        } else {
            right = right.opposite();
            side = side.opposite();
        }
    }

    Ok(quantity)
}

/// Sells everything the trade opened, as found by diffing the broker's
/// positions against the snapshot taken before the first order.
///
/// # Errors
///
/// Returns an error if positions cannot be fetched or an order fails.
pub async fn abort_trade(
    ctx: &TradingContext,
    preexisting: &[BrokerPosition],
    pricing: PricingInputs,
) -> Result<()> {
    let current = ctx.broker.positions(&ctx.account_num).await?;
    let mut positions: Vec<Position> = remove_preexisting(current, preexisting)
        .iter()
        .filter(|p| p.quantity > 0)
        .map(Position::from_broker)
        .collect();

    sell(ctx, &mut positions, Some(pricing)).await?;
    info!(count = positions.len(), "Aborted trade");
    Ok(())
}

/// Spot for valuing options: the underlying's last trade, else its market
/// price, else the last logged price.
async fn model_spot(ctx: &TradingContext, pricing: PricingInputs) -> Option<f64> {
    let live = ctx
        .broker
        .quote(pricing.underlying_con_id)
        .await
        .and_then(|q| q.last.filter(|l| *l > Decimal::ZERO).or_else(|| q.market_price()))
        .and_then(|p| p.to_f64());
    if live.is_some() {
        return live;
    }
    ctx.db
        .repos()
        .market_data
        .spot(pricing.underlying_id)
        .await
        .ok()
        .flatten()
}

async fn reprice(ctx: &TradingContext, positions: &mut [Position], pricing: Option<PricingInputs>) {
    let now = ctx.now();
    let model = match pricing {
        Some(inputs) => {
            let spot = model_spot(ctx, inputs).await;
            let sigma = ctx
                .db
                .repos()
                .market_data
                .sigma(inputs.underlying_id, now, ctx.strategy.vol_lookback_minutes)
                .await
                .ok();
            let tenor = pricing::tenor_years(inputs.expiration, now).ok();
            match (spot, sigma, tenor) {
                (Some(spot), Some(sigma), Some(tenor)) => Some((spot, sigma, tenor)),
                _ => None,
            }
        }
        None => None,
    };

    for position in positions.iter_mut() {
        match ctx.broker.quote(position.con_id()).await {
            Some(quote) => position.quote = quote,
            None => {
                if let Err(e) = ctx.broker.request_market_data(position.con_id()).await {
                    warn!(contract = position.contract.display_name(), error = %e, "Failed to reopen data line");
                }
            }
        }

        position.bsm_price = model.map(|(spot, sigma, tenor)| {
            validate::model_price(&position.contract, spot, sigma, tenor, ctx.strategy.risk_free_rate)
        });
        position.sell_price = validate::sell_price(&position.quote, position.bsm_price)
            .or_else(|| position.quote.bid.filter(|b| *b > Decimal::ZERO));
    }
}

/// Liquidates long positions with IOC orders, re-pricing every round, for at
/// most `max_liquidation_rounds` rounds. `quantity` on each position is
/// reduced by what sold.
///
/// # Errors
///
/// Returns an error if the broker rejects an order.
pub async fn sell(
    ctx: &TradingContext,
    positions: &mut [Position],
    pricing: Option<PricingInputs>,
) -> Result<()> {
    for round in 1..=ctx.strategy.max_liquidation_rounds {
        if positions.iter().all(|p| p.quantity <= 0) {
            return Ok(());
        }
        reprice(ctx, positions, pricing).await;

        for position in positions.iter_mut().filter(|p| p.quantity > 0) {
            let Some(price) = position.sell_price else {
                debug!(contract = position.contract.display_name(), round, "No sell price yet");
                continue;
            };
            let order = build_order(OrderSide::Sell, position.quantity, price, TimeInForce::Ioc, &ctx.account_num)?;
            let filled = execute(ctx, &position.contract, order).await?;
            position.quantity -= filled;
            if filled > 0 {
                info!(
                    contract = position.contract.display_name(),
                    filled,
                    price = %price,
                    remaining = position.quantity,
                    "Sold"
                );
            }
        }

        if positions.iter().any(|p| p.quantity > 0) {
            ctx.sleep(LIQUIDATION_PAUSE).await;
        }
    }

    let open: Vec<String> = positions
        .iter()
        .filter(|p| p.quantity > 0)
        .map(|p| p.contract.display_name())
        .collect();
    if open.is_empty() {
        Ok(())
    } else {
        bail!("Positions still open after {} rounds: {}", ctx.strategy.max_liquidation_rounds, open.join(", "))
    }
}

/// Liquidates a position the trade log still shows open.
///
/// # Errors
///
/// Returns an error if the contract cannot be qualified or the sale fails.
pub async fn close_position(ctx: &TradingContext, row: &PositionRecord) -> Result<()> {
    let mut position = Position::from_db(row)?;
    if position.quantity <= 0 {
        warn!(symbol = row.symbol, quantity = row.quantity, "Logged short position left for manual review");
        return Ok(());
    }

    position.contract = ctx
        .broker
        .qualify_options(std::slice::from_ref(&position.contract))
        .await?
        .into_iter()
        .find(|c| c.con_id == row.con_id)
        .with_context(|| format!("Failed to qualify {}", position.contract.display_name()))?;

    let con_id = position.con_id();
    let opened_line = ctx.broker.quote(con_id).await.is_none();
    if opened_line {
        ctx.broker.request_market_data(con_id).await?;
    }

    let deadline = ctx.deadline_after(Duration::from_secs(ctx.strategy.load_timeout_secs));
    while ctx.now() < deadline {
        if ctx.broker.quote(con_id).await.is_some_and(|q| q.market_price().is_some()) {
            break;
        }
        ctx.sleep(QUOTE_POLL).await;
    }

    warn!(contract = position.contract.display_name(), quantity = position.quantity, "Closing leftover position");
    let result = sell(ctx, std::slice::from_mut(&mut position), None).await;

    if opened_line {
        if let Err(e) = ctx.broker.cancel_market_data(con_id).await {
            warn!(con_id, error = %e, "Failed to cancel data line");
        }
    }
    result
}
