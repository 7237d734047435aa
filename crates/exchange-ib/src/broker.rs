//! The broker seam. Everything the trader needs from a brokerage, and nothing
//! more.

use anyhow::Result;
use async_trait::async_trait;

use crate::types::{
    AccountSummary, BrokerPosition, LimitOrder, OptionChainParams, OptionsContract, OrderState,
    Quote, UnderlyingContract,
};

/// Market data lines, contracts and orders are keyed by IB contract id.
/// A contract must be qualified before a line can be opened on it.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn is_connected(&self) -> bool;

    async fn account_summary(&self, account: &str) -> Result<AccountSummary>;

    /// Resolves a contract to the broker's definition, filling in its con id.
    async fn qualify_underlying(&self, contract: &UnderlyingContract) -> Result<UnderlyingContract>;

    async fn option_chain_params(
        &self,
        underlying: &UnderlyingContract,
    ) -> Result<Vec<OptionChainParams>>;

    /// Qualifies option contracts. Contracts the broker does not recognize
    /// are left out of the result.
    async fn qualify_options(&self, contracts: &[OptionsContract]) -> Result<Vec<OptionsContract>>;

    async fn request_market_data(&self, con_id: i64) -> Result<()>;

    async fn cancel_market_data(&self, con_id: i64) -> Result<()>;

    /// Latest quote on an open line. `None` when no line is open.
    async fn quote(&self, con_id: i64) -> Option<Quote>;

    async fn positions(&self, account: &str) -> Result<Vec<BrokerPosition>>;

    /// Submits an order and returns its id.
    async fn place_order(&self, contract: &OptionsContract, order: &LimitOrder) -> Result<String>;

    async fn order_state(&self, order_id: &str) -> Result<OrderState>;

    async fn cancel_order(&self, order_id: &str) -> Result<()>;
}
