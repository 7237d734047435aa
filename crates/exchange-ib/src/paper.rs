//! Simulated broker.
//!
//! Matches limit orders against whatever quotes the caller sets, without
//! touching IB. Used for dry runs and to exercise the full pipeline in tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Mutex, MutexGuard, PoisonError};

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use straddle_core::calendar::market_now;
use tracing::{debug, info};

use crate::broker::Broker;
use crate::types::{
    AccountSummary, BrokerPosition, Fill, LimitOrder, OptionChainParams, OptionRight,
    OptionsContract, OrderSide, OrderState, OrderStatus, Quote, TimeInForce, UnderlyingContract,
};

/// Commission charged per contract.
pub const COMMISSION_PER_CONTRACT: Decimal = dec!(0.65);

/// Con ids handed out to generated option contracts start here.
const FIRST_OPTION_CON_ID: i64 = 1_000_000;

type OptionKey = (String, String, Decimal, OptionRight);

type TimeSource = Box<dyn Fn() -> NaiveDateTime + Send>;

struct PaperState {
    /// Stamps fills.
    now: TimeSource,
    connected: bool,
    cash: Decimal,
    underlyings: HashMap<String, UnderlyingContract>,
    chains: HashMap<i64, Vec<OptionChainParams>>,
    options: HashMap<OptionKey, OptionsContract>,
    contracts: HashMap<i64, OptionsContract>,
    quotes: HashMap<i64, Quote>,
    lines: HashSet<i64>,
    orders: HashMap<String, OrderState>,
    positions: HashMap<i64, BrokerPosition>,
    next_order_id: u64,
    next_con_id: i64,
}

/// In-memory [`Broker`].
pub struct PaperBroker {
    account: String,
    state: Mutex<PaperState>,
}

fn option_key(contract: &OptionsContract) -> OptionKey {
    (
        contract.symbol.to_uppercase(),
        contract.expiry.clone(),
        contract.strike.normalize(),
        contract.right,
    )
}

impl PaperBroker {
    #[must_use]
    pub fn new(account: &str, cash: Decimal) -> Self {
        Self {
            account: account.to_string(),
            state: Mutex::new(PaperState {
                now: Box::new(market_now),
                connected: true,
                cash,
                underlyings: HashMap::new(),
                chains: HashMap::new(),
                options: HashMap::new(),
                contracts: HashMap::new(),
                quotes: HashMap::new(),
                lines: HashSet::new(),
                orders: HashMap::new(),
                positions: HashMap::new(),
                next_order_id: 1,
                next_con_id: FIRST_OPTION_CON_ID,
            }),
        }
    }

    /// Stamps fills from `now` instead of the market clock, so fill times
    /// follow a simulated session.
    #[must_use]
    pub fn with_clock(mut self, now: impl Fn() -> NaiveDateTime + Send + 'static) -> Self {
        self.state.get_mut().unwrap_or_else(PoisonError::into_inner).now = Box::new(now);
        self
    }

    fn state(&self) -> MutexGuard<'_, PaperState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn set_connected(&self, connected: bool) {
        self.state().connected = connected;
    }

    /// Registers an underlying with its con id already set.
    pub fn add_underlying(&self, contract: UnderlyingContract, quote: Quote) {
        let mut state = self.state();
        state.quotes.insert(contract.con_id, quote);
        state.underlyings.insert(contract.symbol.to_uppercase(), contract);
    }

    /// Lists a chain slice and creates a call and a put for every
    /// expiration/strike pair. Returns the generated contracts.
    pub fn add_option_chain(&self, symbol: &str, params: OptionChainParams) -> Vec<OptionsContract> {
        let mut state = self.state();
        let multiplier = params.multiplier.parse::<Decimal>().unwrap_or(Decimal::ONE_HUNDRED);
        let mut created = Vec::new();

        for expiry in &params.expirations {
            for strike in &params.strikes {
                for right in [OptionRight::Call, OptionRight::Put] {
                    let mut contract = OptionsContract::new(symbol, expiry, *strike, right);
                    contract.exchange = params.exchange.clone();
                    contract.trading_class = Some(params.trading_class.clone());
                    contract.multiplier = multiplier;

                    let key = option_key(&contract);
                    if state.options.contains_key(&key) {
                        continue;
                    }
                    contract.con_id = state.next_con_id;
                    state.next_con_id += 1;

                    state.contracts.insert(contract.con_id, contract.clone());
                    state.options.insert(key, contract.clone());
                    created.push(contract);
                }
            }
        }

        state
            .chains
            .entry(params.underlying_con_id)
            .or_default()
            .push(params);
        created
    }

    #[must_use]
    pub fn option_con_id(
        &self,
        symbol: &str,
        expiry: &str,
        strike: Decimal,
        right: OptionRight,
    ) -> Option<i64> {
        let key = (symbol.to_uppercase(), expiry.to_string(), strike.normalize(), right);
        self.state().options.get(&key).map(|c| c.con_id)
    }

    /// Replaces the quote for a contract and lets resting orders trade against it.
    pub fn set_quote(&self, con_id: i64, quote: Quote) {
        let mut state = self.state();
        state.quotes.insert(con_id, quote);
        state.match_resting(con_id);
    }

    /// Edits the quote for a contract in place.
    pub fn update_quote(&self, con_id: i64, update: impl FnOnce(&mut Quote)) {
        let mut state = self.state();
        update(state.quotes.entry(con_id).or_default());
        state.match_resting(con_id);
    }

    /// Seeds a position the account held before the session.
    pub fn seed_position(&self, contract: OptionsContract, quantity: i64, avg_cost: Decimal) {
        let mut state = self.state();
        state.contracts.insert(contract.con_id, contract.clone());
        state.positions.insert(
            contract.con_id,
            BrokerPosition {
                account: self.account.clone(),
                contract,
                quantity,
                avg_cost,
            },
        );
    }

    #[must_use]
    pub fn cash(&self) -> Decimal {
        self.state().cash
    }

    #[must_use]
    pub fn open_lines(&self) -> usize {
        self.state().lines.len()
    }

    /// Every order placed so far, oldest first.
    #[must_use]
    pub fn orders(&self) -> Vec<OrderState> {
        let state = self.state();
        let mut orders: Vec<OrderState> = state.orders.values().cloned().collect();
        orders.sort_by_key(|o| o.order_id.parse::<u64>().unwrap_or(u64::MAX));
        orders
    }
}

impl PaperState {
    /// Fills as much of an order as the current quote allows.
    fn match_order(&mut self, order_id: &str) {
        let Some(order) = self.orders.get(order_id) else {
            return;
        };
        if order.status.is_done() || order.status == OrderStatus::Inactive {
            return;
        }

        let con_id = order.contract.con_id;
        let side = order.order.side;
        let limit = order.order.limit_price;
        let remaining = order.remaining();
        let tif = order.order.tif;

        let available = self.quotes.get(&con_id).and_then(|q| match side {
            OrderSide::Buy => q
                .ask
                .filter(|ask| *ask > Decimal::ZERO && limit >= *ask && q.ask_size > 0)
                .map(|ask| (ask, q.ask_size)),
            OrderSide::Sell => q
                .bid
                .filter(|bid| *bid > Decimal::ZERO && limit <= *bid && q.bid_size > 0)
                .map(|bid| (bid, q.bid_size)),
        });

        let mut fill_quantity = available.map_or(0, |(_, size)| size.min(remaining));
        if tif == TimeInForce::Fok && fill_quantity < remaining {
            fill_quantity = 0;
        }

        if let Some((price, _)) = available.filter(|_| fill_quantity > 0) {
            self.apply_fill(order_id, fill_quantity, price);
        }

        if let Some(order) = self.orders.get_mut(order_id) {
            order.status = if order.remaining() == 0 {
                OrderStatus::Filled
            } else if matches!(tif, TimeInForce::Ioc | TimeInForce::Fok) {
                OrderStatus::Cancelled
            } else {
                OrderStatus::Submitted
            };
        }
    }

    fn apply_fill(&mut self, order_id: &str, quantity: i64, price: Decimal) {
        let time = (self.now)();
        let Some(order) = self.orders.get_mut(order_id) else {
            return;
        };
        let commission = COMMISSION_PER_CONTRACT * Decimal::from(quantity);
        order.fills.push(Fill {
            quantity,
            price,
            commission,
            time,
        });

        let contract = order.contract.clone();
        let account = order.order.account.clone();
        let signed = quantity * order.order.side.sign();
        let cost = price * contract.multiplier;
        let notional = cost * Decimal::from(quantity);

        self.cash -= notional * Decimal::from(order.order.side.sign()) + commission;

        let position = self
            .positions
            .entry(contract.con_id)
            .or_insert_with(|| BrokerPosition {
                account,
                contract: contract.clone(),
                quantity: 0,
                avg_cost: Decimal::ZERO,
            });

        let new_quantity = position.quantity + signed;
        if position.quantity == 0 || position.quantity.signum() == signed.signum() {
            let held = Decimal::from(position.quantity.abs());
            let added = Decimal::from(quantity);
            position.avg_cost = (position.avg_cost * held + cost * added) / (held + added);
        } else if new_quantity != 0 && new_quantity.signum() != position.quantity.signum() {
            position.avg_cost = cost;
        }
        position.quantity = new_quantity;

        if new_quantity == 0 {
            self.positions.remove(&contract.con_id);
        }

        debug!(
            order_id,
            con_id = contract.con_id,
            quantity,
            price = %price,
            "Paper fill"
        );
    }

    fn match_resting(&mut self, con_id: i64) {
        let resting: Vec<String> = self
            .orders
            .values()
            .filter(|o| o.contract.con_id == con_id && o.status == OrderStatus::Submitted)
            .map(|o| o.order_id.clone())
            .collect();
        for order_id in resting {
            self.match_order(&order_id);
        }
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn is_connected(&self) -> bool {
        self.state().connected
    }

    async fn account_summary(&self, account: &str) -> Result<AccountSummary> {
        let state = self.state();
        let positions_value: Decimal = state
            .positions
            .values()
            .map(|p| p.avg_cost * Decimal::from(p.quantity))
            .sum();
        let net_liquidation = state.cash + positions_value;
        let cushion = if net_liquidation.is_zero() {
            Decimal::ZERO
        } else {
            state.cash / net_liquidation
        };

        Ok(AccountSummary {
            account_id: account.to_string(),
            net_liquidation,
            buying_power: state.cash,
            available_funds: state.cash,
            excess_liquidity: state.cash,
            total_cash_value: state.cash,
            maintenance_margin: Decimal::ZERO,
            cushion,
        })
    }

    async fn qualify_underlying(&self, contract: &UnderlyingContract) -> Result<UnderlyingContract> {
        self.state()
            .underlyings
            .get(&contract.symbol.to_uppercase())
            .filter(|known| known.sec_type == contract.sec_type)
            .cloned()
            .with_context(|| format!("Unknown contract {} {}", contract.sec_type, contract.symbol))
    }

    async fn option_chain_params(
        &self,
        underlying: &UnderlyingContract,
    ) -> Result<Vec<OptionChainParams>> {
        Ok(self
            .state()
            .chains
            .get(&underlying.con_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn qualify_options(&self, contracts: &[OptionsContract]) -> Result<Vec<OptionsContract>> {
        let state = self.state();
        Ok(contracts
            .iter()
            .filter_map(|c| state.options.get(&option_key(c)).cloned())
            .collect())
    }

    async fn request_market_data(&self, con_id: i64) -> Result<()> {
        let mut state = self.state();
        let known = state.contracts.contains_key(&con_id)
            || state.underlyings.values().any(|u| u.con_id == con_id);
        if !known {
            bail!("No security definition for con id {con_id}");
        }
        state.lines.insert(con_id);
        state.quotes.entry(con_id).or_default();
        Ok(())
    }

    async fn cancel_market_data(&self, con_id: i64) -> Result<()> {
        self.state().lines.remove(&con_id);
        Ok(())
    }

    async fn quote(&self, con_id: i64) -> Option<Quote> {
        let state = self.state();
        if !state.lines.contains(&con_id) {
            return None;
        }
        state.quotes.get(&con_id).cloned()
    }

    async fn positions(&self, account: &str) -> Result<Vec<BrokerPosition>> {
        let mut positions: Vec<BrokerPosition> = self
            .state()
            .positions
            .values()
            .filter(|p| account.is_empty() || p.account == account)
            .cloned()
            .collect();
        positions.sort_by_key(|p| p.contract.con_id);
        Ok(positions)
    }

    async fn place_order(&self, contract: &OptionsContract, order: &LimitOrder) -> Result<String> {
        if order.quantity <= 0 {
            bail!("Order quantity must be positive, got {}", order.quantity);
        }

        let mut state = self.state();
        let order_id = state.next_order_id.to_string();
        state.next_order_id += 1;

        let status = if state.contracts.contains_key(&contract.con_id) {
            OrderStatus::PreSubmitted
        } else {
            OrderStatus::Inactive
        };

        state.orders.insert(
            order_id.clone(),
            OrderState {
                order_id: order_id.clone(),
                contract: contract.clone(),
                order: order.clone(),
                status,
                fills: Vec::new(),
            },
        );
        state.match_order(&order_id);

        info!(
            order_id,
            contract = contract.display_name(),
            side = %order.side,
            quantity = order.quantity,
            limit = %order.limit_price,
            tif = %order.tif,
            "Paper order placed"
        );
        Ok(order_id)
    }

    async fn order_state(&self, order_id: &str) -> Result<OrderState> {
        self.state()
            .orders
            .get(order_id)
            .cloned()
            .with_context(|| format!("Unknown order {order_id}"))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let mut state = self.state();
        let order = state
            .orders
            .get_mut(order_id)
            .with_context(|| format!("Unknown order {order_id}"))?;
        if !order.status.is_done() {
            order.status = OrderStatus::Cancelled;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::SecType;

    const EXPIRY: &str = "20211126";

    fn broker() -> (PaperBroker, i64, i64) {
        let broker = PaperBroker::new("DU1", dec!(100000));
        broker.add_underlying(
            UnderlyingContract {
                con_id: 265_598,
                symbol: "AAPL".to_string(),
                sec_type: SecType::Stock,
                currency: "USD".to_string(),
                exchange: "SMART".to_string(),
                primary_exchange: Some("NASDAQ".to_string()),
            },
            Quote {
                last: Some(dec!(160.10)),
                ..Quote::default()
            },
        );
        broker.add_option_chain(
            "AAPL",
            OptionChainParams {
                exchange: "SMART".to_string(),
                underlying_con_id: 265_598,
                trading_class: "AAPL".to_string(),
                multiplier: "100".to_string(),
                expirations: vec![EXPIRY.to_string()],
                strikes: vec![dec!(155), dec!(160), dec!(165)],
            },
        );
        let call = broker.option_con_id("AAPL", EXPIRY, dec!(160), OptionRight::Call).unwrap();
        let put = broker.option_con_id("AAPL", EXPIRY, dec!(160), OptionRight::Put).unwrap();
        (broker, call, put)
    }

    fn quote(bid: Decimal, ask: Decimal, size: i64) -> Quote {
        Quote {
            bid: Some(bid),
            ask: Some(ask),
            bid_size: size,
            ask_size: size,
            ..Quote::default()
        }
    }

    fn order(side: OrderSide, quantity: i64, limit: Decimal, tif: TimeInForce) -> LimitOrder {
        LimitOrder {
            side,
            quantity,
            limit_price: limit,
            tif,
            account: "DU1".to_string(),
        }
    }

    async fn contract(broker: &PaperBroker, con_id: i64) -> OptionsContract {
        let lookup_key = broker.state().contracts.get(&con_id).cloned().unwrap();
        broker.qualify_options(&[lookup_key]).await.unwrap().remove(0)
    }

    #[tokio::test]
    async fn qualifies_known_options_only() {
        let (broker, call, _) = broker();
        let known = OptionsContract::new("aapl", EXPIRY, dec!(160.0), OptionRight::Call);
        let unknown = OptionsContract::new("AAPL", EXPIRY, dec!(170), OptionRight::Call);

        let qualified = broker.qualify_options(&[known, unknown]).await.unwrap();
        assert_eq!(qualified.len(), 1);
        assert_eq!(qualified[0].con_id, call);
        assert_eq!(qualified[0].trading_class.as_deref(), Some("AAPL"));
    }

    #[tokio::test]
    async fn quotes_require_an_open_line() {
        let (broker, call, _) = broker();
        broker.set_quote(call, quote(dec!(2.0), dec!(2.1), 10));

        assert!(broker.quote(call).await.is_none());
        broker.request_market_data(call).await.unwrap();
        assert_eq!(broker.quote(call).await.unwrap().ask, Some(dec!(2.1)));
        broker.cancel_market_data(call).await.unwrap();
        assert!(broker.quote(call).await.is_none());
        assert!(broker.request_market_data(42).await.is_err());
    }

    #[tokio::test]
    async fn ioc_buy_fills_up_to_ask_size_and_cancels_rest() {
        let (broker, call, _) = broker();
        broker.set_quote(call, quote(dec!(2.0), dec!(2.1), 3));
        let contract = contract(&broker, call).await;

        let id = broker
            .place_order(&contract, &order(OrderSide::Buy, 5, dec!(2.1), TimeInForce::Ioc))
            .await
            .unwrap();
        let state = broker.order_state(&id).await.unwrap();

        assert_eq!(state.status, OrderStatus::Cancelled);
        assert_eq!(state.filled(), 3);
        assert_eq!(state.commission(), dec!(1.95));

        let positions = broker.positions("DU1").await.unwrap();
        assert_eq!(positions.len(), 1);
        assert_eq!(positions[0].quantity, 3);
        assert_eq!(positions[0].avg_cost, dec!(210));
        assert_eq!(broker.cash(), dec!(100000) - dec!(630) - dec!(1.95));
    }

    #[tokio::test]
    async fn fills_are_stamped_by_the_injected_clock() {
        let (broker, call, _) = broker();
        let session_time = chrono::NaiveDate::from_ymd_opt(2021, 11, 24)
            .unwrap()
            .and_hms_opt(10, 15, 0)
            .unwrap();
        let broker = broker.with_clock(move || session_time);
        broker.set_quote(call, quote(dec!(2.0), dec!(2.1), 10));
        let contract = contract(&broker, call).await;

        let id = broker
            .place_order(&contract, &order(OrderSide::Buy, 2, dec!(2.1), TimeInForce::Ioc))
            .await
            .unwrap();
        let state = broker.order_state(&id).await.unwrap();
        assert_eq!(state.fills.len(), 1);
        assert_eq!(state.fills[0].time, session_time);
    }

    #[tokio::test]
    async fn day_order_rests_until_quote_crosses() {
        let (broker, _, put) = broker();
        broker.set_quote(put, quote(dec!(1.0), dec!(1.2), 10));
        let contract = contract(&broker, put).await;

        let id = broker
            .place_order(&contract, &order(OrderSide::Buy, 2, dec!(1.1), TimeInForce::Day))
            .await
            .unwrap();
        assert_eq!(broker.order_state(&id).await.unwrap().status, OrderStatus::Submitted);

        broker.update_quote(put, |q| q.ask = Some(dec!(1.1)));
        let state = broker.order_state(&id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Filled);
        assert_eq!(state.avg_fill_price(), dec!(1.1));
    }

    #[tokio::test]
    async fn selling_flattens_position() {
        let (broker, call, _) = broker();
        broker.set_quote(call, quote(dec!(2.0), dec!(2.1), 10));
        let contract = contract(&broker, call).await;

        broker
            .place_order(&contract, &order(OrderSide::Buy, 2, dec!(2.1), TimeInForce::Ioc))
            .await
            .unwrap();
        let id = broker
            .place_order(&contract, &order(OrderSide::Sell, 2, dec!(2.0), TimeInForce::Ioc))
            .await
            .unwrap();

        assert_eq!(broker.order_state(&id).await.unwrap().status, OrderStatus::Filled);
        assert!(broker.positions("DU1").await.unwrap().is_empty());
        // Round trip costs the spread plus commission on four contracts
        assert_eq!(broker.cash(), dec!(100000) - dec!(20) - dec!(2.60));
    }

    #[tokio::test]
    async fn unknown_contract_goes_inactive() {
        let (broker, _, _) = broker();
        let mut contract = OptionsContract::new("AAPL", EXPIRY, dec!(999), OptionRight::Call);
        contract.con_id = 7;

        let id = broker
            .place_order(&contract, &order(OrderSide::Buy, 1, dec!(1), TimeInForce::Day))
            .await
            .unwrap();
        let state = broker.order_state(&id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Inactive);
        assert_eq!(state.filled(), 0);
    }

    #[tokio::test]
    async fn cancel_stops_resting_order() {
        let (broker, call, _) = broker();
        broker.set_quote(call, quote(dec!(2.0), dec!(2.5), 10));
        let contract = contract(&broker, call).await;

        let id = broker
            .place_order(&contract, &order(OrderSide::Buy, 1, dec!(2.0), TimeInForce::Day))
            .await
            .unwrap();
        broker.cancel_order(&id).await.unwrap();
        broker.set_quote(call, quote(dec!(1.9), dec!(2.0), 10));

        let state = broker.order_state(&id).await.unwrap();
        assert_eq!(state.status, OrderStatus::Cancelled);
        assert_eq!(state.filled(), 0);
    }
}
