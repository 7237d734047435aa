//! IB Gateway/TWS adapter implementing [`Broker`] with `ibapi`.
//!
//! Market data and order subscriptions are drained by background tasks into
//! shared maps so the trader reads them the same way it reads the simulated
//! broker.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::StreamExt;
use ibapi::accounts::{AccountSummaryResult, AccountSummaryTags, PositionUpdate};
use ibapi::contracts::{Contract, SecurityType};
use ibapi::market_data::realtime::{TickType, TickTypes};
use ibapi::orders::{order_builder, Action, PlaceOrder};
use rust_decimal::prelude::{FromPrimitive, ToPrimitive};
use rust_decimal::Decimal;
use straddle_core::calendar::market_now;
use straddle_core::config::BrokerConfig;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::broker::Broker;
use crate::types::{
    AccountSummary, BrokerPosition, Fill, LimitOrder, OptionChainParams, OptionsContract, OrderSide,
    OrderState, OrderStatus, Quote, SecType, UnderlyingContract,
};

/// IB client configuration.
#[derive(Debug, Clone)]
pub struct IBConfig {
    /// Gateway/TWS host (use 127.0.0.1, not localhost, TWS may block IPv6).
    pub host: String,
    /// Gateway port (4001 = live, 4002 = paper).
    pub port: u16,
    /// Client ID (unique per connection).
    pub client_id: i32,
}

impl Default for IBConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 4002,
            client_id: 100,
        }
    }
}

impl From<&BrokerConfig> for IBConfig {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            client_id: config.client_id,
        }
    }
}

impl IBConfig {
    #[must_use]
    pub fn paper() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn live() -> Self {
        Self {
            port: 4001,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn connection_url(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

type Shared<T> = Arc<Mutex<T>>;

fn lock<T>(shared: &Mutex<T>) -> MutexGuard<'_, T> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

fn to_decimal(value: f64) -> Option<Decimal> {
    Decimal::from_f64(value).filter(|v| *v > Decimal::ZERO)
}

/// [`Broker`] backed by a live IB Gateway/TWS session.
pub struct IbBroker {
    config: IBConfig,
    client: Arc<ibapi::Client>,
    contracts: Shared<HashMap<i64, Contract>>,
    quotes: Shared<HashMap<i64, Quote>>,
    lines: Mutex<HashMap<i64, JoinHandle<()>>>,
    orders: Shared<HashMap<String, OrderState>>,
}

impl IbBroker {
    /// Connect to IB Gateway/TWS.
    ///
    /// # Errors
    ///
    /// Returns an error if the gateway refuses the connection.
    pub async fn connect(config: IBConfig) -> Result<Self> {
        let url = config.connection_url();
        info!(url = %url, client_id = config.client_id, "Connecting to IB Gateway");

        let client = ibapi::Client::connect(&url, config.client_id)
            .await
            .context("Failed to connect to IB Gateway")?;

        info!("Connected to IB Gateway");
        Ok(Self {
            config,
            client: Arc::new(client),
            contracts: Arc::default(),
            quotes: Arc::default(),
            lines: Mutex::default(),
            orders: Arc::default(),
        })
    }

    #[must_use]
    pub const fn config(&self) -> &IBConfig {
        &self.config
    }

    fn option_to_ib(contract: &OptionsContract) -> Contract {
        Contract {
            contract_id: i32::try_from(contract.con_id).unwrap_or_default(),
            symbol: contract.symbol.clone(),
            security_type: SecurityType::Option,
            last_trade_date_or_contract_month: contract.expiry.clone(),
            strike: contract.strike.to_f64().unwrap_or_default(),
            right: contract.right.to_string(),
            exchange: contract.exchange.clone(),
            trading_class: contract.trading_class.clone().unwrap_or_default(),
            multiplier: contract.multiplier.to_string(),
            currency: contract.currency.clone(),
            ..Contract::default()
        }
    }

    fn option_from_ib(contract: &Contract) -> Result<OptionsContract> {
        Ok(OptionsContract {
            con_id: i64::from(contract.contract_id),
            symbol: contract.symbol.clone(),
            expiry: contract.last_trade_date_or_contract_month.clone(),
            strike: Decimal::from_f64(contract.strike)
                .ok_or_else(|| anyhow!("Invalid strike {}", contract.strike))?,
            right: contract.right.parse()?,
            exchange: contract.exchange.clone(),
            trading_class: Some(contract.trading_class.clone()).filter(|c| !c.is_empty()),
            multiplier: contract.multiplier.parse().unwrap_or(Decimal::ONE_HUNDRED),
            currency: contract.currency.clone(),
        })
    }

    fn apply_tick(quote: &mut Quote, tick: TickTypes) {
        match tick {
            TickTypes::Price(price) => {
                let value = to_decimal(price.price);
                match price.tick_type {
                    TickType::Bid | TickType::DelayedBid => quote.bid = value,
                    TickType::Ask | TickType::DelayedAsk => quote.ask = value,
                    TickType::Last | TickType::DelayedLast => quote.last = value,
                    TickType::Close | TickType::DelayedClose => quote.close = value,
                    _ => {}
                }
            }
            TickTypes::Size(size) => match size.tick_type {
                TickType::BidSize => quote.bid_size = size.size as i64,
                TickType::AskSize => quote.ask_size = size.size as i64,
                _ => {}
            },
            TickTypes::PriceSize(price_size) => {
                let value = to_decimal(price_size.price);
                match price_size.price_tick_type {
                    TickType::Bid => quote.bid = value,
                    TickType::Ask => quote.ask = value,
                    TickType::Last => quote.last = value,
                    _ => {}
                }
            }
            TickTypes::OptionComputation(computation) => match computation.field {
                TickType::BidOption => quote.bid_iv = computation.implied_volatility,
                TickType::AskOption => quote.ask_iv = computation.implied_volatility,
                _ => {}
            },
            _ => {}
        }
    }

    fn status_from_ib(status: &str) -> OrderStatus {
        match status {
            "PendingSubmit" | "ApiPending" => OrderStatus::PendingSubmit,
            "PreSubmitted" => OrderStatus::PreSubmitted,
            "ApiCancelled" => OrderStatus::ApiCancelled,
            "Cancelled" | "PendingCancel" => OrderStatus::Cancelled,
            "Filled" => OrderStatus::Filled,
            "Inactive" => OrderStatus::Inactive,
            _ => OrderStatus::Submitted,
        }
    }
}

#[async_trait]
impl Broker for IbBroker {
    async fn is_connected(&self) -> bool {
        self.client.is_connected()
    }

    async fn account_summary(&self, account: &str) -> Result<AccountSummary> {
        let tags = &[
            AccountSummaryTags::NET_LIQUIDATION,
            AccountSummaryTags::BUYING_POWER,
            AccountSummaryTags::AVAILABLE_FUNDS,
            AccountSummaryTags::EXCESS_LIQUIDITY,
            AccountSummaryTags::TOTAL_CASH_VALUE,
            AccountSummaryTags::MAINT_MARGIN_REQ,
            AccountSummaryTags::CUSHION,
        ];

        let mut subscription = self
            .client
            .account_summary(&"All".into(), tags)
            .await
            .context("Failed to request account summary")?;

        let mut summary = AccountSummary {
            account_id: account.to_string(),
            ..AccountSummary::default()
        };

        while let Some(item) = subscription.next().await {
            match item? {
                AccountSummaryResult::Summary(row) => {
                    if !account.is_empty() && row.account != account {
                        continue;
                    }
                    let value = row.value.parse::<Decimal>().unwrap_or_default();
                    match row.tag.as_str() {
                        AccountSummaryTags::NET_LIQUIDATION => summary.net_liquidation = value,
                        AccountSummaryTags::BUYING_POWER => summary.buying_power = value,
                        AccountSummaryTags::AVAILABLE_FUNDS => summary.available_funds = value,
                        AccountSummaryTags::EXCESS_LIQUIDITY => summary.excess_liquidity = value,
                        AccountSummaryTags::TOTAL_CASH_VALUE => summary.total_cash_value = value,
                        AccountSummaryTags::MAINT_MARGIN_REQ => summary.maintenance_margin = value,
                        AccountSummaryTags::CUSHION => summary.cushion = value,
                        _ => {}
                    }
                }
                AccountSummaryResult::End => break,
            }
        }

        debug!(account, available_funds = %summary.available_funds, "Account summary retrieved");
        Ok(summary)
    }

    async fn qualify_underlying(&self, contract: &UnderlyingContract) -> Result<UnderlyingContract> {
        let query = Contract {
            contract_id: i32::try_from(contract.con_id).unwrap_or_default(),
            symbol: contract.symbol.clone(),
            security_type: match contract.sec_type {
                SecType::Stock => SecurityType::Stock,
                SecType::Index => SecurityType::Index,
            },
            exchange: contract.exchange.clone(),
            primary_exchange: contract.primary_exchange.clone().unwrap_or_default(),
            currency: contract.currency.clone(),
            ..Contract::default()
        };

        let details = self
            .client
            .contract_details(&query)
            .await
            .with_context(|| format!("Failed to qualify {}", contract.symbol))?;
        let [detail] = details.as_slice() else {
            bail!("{} matched {} contracts", contract.symbol, details.len());
        };

        let qualified = detail.contract.clone();
        lock(&self.contracts).insert(i64::from(qualified.contract_id), qualified.clone());

        Ok(UnderlyingContract {
            con_id: i64::from(qualified.contract_id),
            symbol: qualified.symbol.clone(),
            sec_type: contract.sec_type,
            currency: qualified.currency.clone(),
            exchange: qualified.exchange.clone(),
            primary_exchange: Some(qualified.primary_exchange.clone()).filter(|e| !e.is_empty()),
        })
    }

    async fn option_chain_params(
        &self,
        underlying: &UnderlyingContract,
    ) -> Result<Vec<OptionChainParams>> {
        let sec_type = match underlying.sec_type {
            SecType::Stock => SecurityType::Stock,
            SecType::Index => SecurityType::Index,
        };
        let mut subscription = self
            .client
            .option_chain(
                &underlying.symbol,
                "",
                sec_type,
                i32::try_from(underlying.con_id)?,
            )
            .await
            .context("Failed to request option chain parameters")?;

        let mut chains = Vec::new();
        while let Some(item) = subscription.next().await {
            let chain = item?;
            chains.push(OptionChainParams {
                exchange: chain.exchange,
                underlying_con_id: i64::from(chain.underlying_contract_id),
                trading_class: chain.trading_class,
                multiplier: chain.multiplier,
                expirations: chain.expirations,
                strikes: chain.strikes.into_iter().filter_map(Decimal::from_f64).collect(),
            });
        }
        Ok(chains)
    }

    async fn qualify_options(&self, contracts: &[OptionsContract]) -> Result<Vec<OptionsContract>> {
        let mut qualified = Vec::with_capacity(contracts.len());
        for contract in contracts {
            let details = match self.client.contract_details(&Self::option_to_ib(contract)).await {
                Ok(details) => details,
                Err(e) => {
                    debug!(contract = contract.display_name(), error = %e, "Option not qualified");
                    continue;
                }
            };
            let Some(detail) = details.first() else {
                continue;
            };
            match Self::option_from_ib(&detail.contract) {
                Ok(option) => {
                    lock(&self.contracts).insert(option.con_id, detail.contract.clone());
                    qualified.push(option);
                }
                Err(e) => warn!(error = %e, "Unreadable option definition"),
            }
        }
        Ok(qualified)
    }

    async fn request_market_data(&self, con_id: i64) -> Result<()> {
        if lock(&self.lines).contains_key(&con_id) {
            return Ok(());
        }
        let contract = lock(&self.contracts)
            .get(&con_id)
            .cloned()
            .with_context(|| format!("Con id {con_id} has not been qualified"))?;

        let mut subscription = self
            .client
            .market_data(&contract, &["106"], false, false)
            .await
            .with_context(|| format!("Failed to request market data for {con_id}"))?;

        lock(&self.quotes).insert(con_id, Quote::default());
        let quotes = Arc::clone(&self.quotes);
        let handle = tokio::spawn(async move {
            while let Some(tick) = subscription.next().await {
                match tick {
                    Ok(tick) => {
                        if let Some(quote) = lock(&quotes).get_mut(&con_id) {
                            Self::apply_tick(quote, tick);
                        }
                    }
                    Err(e) => {
                        warn!(con_id, error = %e, "Market data line failed");
                        break;
                    }
                }
            }
        });
        lock(&self.lines).insert(con_id, handle);
        Ok(())
    }

    async fn cancel_market_data(&self, con_id: i64) -> Result<()> {
        if let Some(handle) = lock(&self.lines).remove(&con_id) {
            handle.abort();
        }
        lock(&self.quotes).remove(&con_id);
        Ok(())
    }

    async fn quote(&self, con_id: i64) -> Option<Quote> {
        lock(&self.quotes).get(&con_id).cloned()
    }

    async fn positions(&self, account: &str) -> Result<Vec<BrokerPosition>> {
        let mut subscription = self
            .client
            .positions()
            .await
            .context("Failed to request positions")?;

        let mut positions = Vec::new();
        while let Some(update) = subscription.next().await {
            match update? {
                PositionUpdate::Position(position) => {
                    if !account.is_empty() && position.account != account {
                        continue;
                    }
                    if position.contract.security_type != SecurityType::Option {
                        continue;
                    }
                    let contract = Self::option_from_ib(&position.contract)?;
                    positions.push(BrokerPosition {
                        account: position.account,
                        contract,
                        quantity: position.position as i64,
                        avg_cost: Decimal::from_f64(position.average_cost).unwrap_or_default(),
                    });
                }
                PositionUpdate::PositionEnd => break,
            }
        }
        Ok(positions)
    }

    async fn place_order(&self, contract: &OptionsContract, order: &LimitOrder) -> Result<String> {
        let ib_contract = lock(&self.contracts)
            .get(&contract.con_id)
            .cloned()
            .unwrap_or_else(|| Self::option_to_ib(contract));

        let action = match order.side {
            OrderSide::Buy => Action::Buy,
            OrderSide::Sell => Action::Sell,
        };
        let mut ib_order = order_builder::limit_order(
            action,
            order.quantity as f64,
            order.limit_price.to_f64().unwrap_or_default(),
        );
        ib_order.tif = order.tif.to_string();
        ib_order.sweep_to_fill = true;
        ib_order.outside_rth = false;
        ib_order.account = order.account.clone();

        let order_id = self.client.next_order_id();
        let mut subscription = self
            .client
            .place_order(order_id, &ib_contract, &ib_order)
            .await
            .context("Failed to place order")?;

        let key = order_id.to_string();
        lock(&self.orders).insert(
            key.clone(),
            OrderState {
                order_id: key.clone(),
                contract: contract.clone(),
                order: order.clone(),
                status: OrderStatus::PendingSubmit,
                fills: Vec::new(),
            },
        );

        let orders = Arc::clone(&self.orders);
        let id = key.clone();
        tokio::spawn(async move {
            while let Some(event) = subscription.next().await {
                let Ok(event) = event else {
                    break;
                };
                let mut orders = lock(&orders);
                let Some(state) = orders.get_mut(&id) else {
                    break;
                };
                match event {
                    PlaceOrder::OrderStatus(status) => {
                        state.status = Self::status_from_ib(&status.status);
                    }
                    PlaceOrder::ExecutionData(data) => state.fills.push(Fill {
                        quantity: data.execution.shares as i64,
                        price: Decimal::from_f64(data.execution.price).unwrap_or_default(),
                        commission: Decimal::ZERO,
                        time: market_now(),
                    }),
                    PlaceOrder::CommissionReport(report) => {
                        if let Some(fill) = state.fills.iter_mut().rev().find(|f| f.commission.is_zero()) {
                            fill.commission = Decimal::from_f64(report.commission).unwrap_or_default();
                        }
                    }
                    _ => {}
                }
            }
        });

        info!(
            order_id = key,
            contract = contract.display_name(),
            side = %order.side,
            quantity = order.quantity,
            limit = %order.limit_price,
            "Order placed"
        );
        Ok(key)
    }

    async fn order_state(&self, order_id: &str) -> Result<OrderState> {
        lock(&self.orders)
            .get(order_id)
            .cloned()
            .with_context(|| format!("Unknown order {order_id}"))
    }

    async fn cancel_order(&self, order_id: &str) -> Result<()> {
        let id: i32 = order_id.parse().context("Order ids are numeric")?;
        self.client
            .cancel_order(id, "")
            .await
            .with_context(|| format!("Failed to cancel order {order_id}"))?;
        Ok(())
    }
}

