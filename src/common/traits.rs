//! Trait definitions for external collaborators

use async_trait::async_trait;
use rust_decimal::Decimal;

use super::errors::Result;
use super::types::{AccessToken, Balance, BrokerHolding, OpenOrder, OrderAck, OrderRequest};
use crate::notify::Alert;

/// Order-entry and account API of a brokerage
///
/// Live and simulated brokers are interchangeable behind this trait and
/// are selected once at startup from configuration.
///
/// Submit and cancel report broker-side refusals through
/// [`OrderAck::is_success`], not through `Err`. `Err` is reserved for
/// transport, decoding and authentication failures.
#[async_trait]
pub trait BrokerGateway: Send + Sync {
    /// Obtain a bearer token for subsequent calls
    async fn authenticate(&self) -> Result<AccessToken>;

    /// Orderable cash, total evaluation amount and deposit
    async fn get_balance(&self, token: &AccessToken) -> Result<Balance>;

    /// Every position currently held in the account
    async fn get_holdings(&self, token: &AccessToken) -> Result<Vec<BrokerHolding>>;

    /// Orders accepted but not yet fully executed
    async fn get_open_orders(&self, token: &AccessToken) -> Result<Vec<OpenOrder>>;

    /// Submit a buy or sell order
    async fn submit_order(&self, order: &OrderRequest, token: &AccessToken) -> Result<OrderAck>;

    /// Withdraw `quantity` of a resting order
    async fn cancel_order(
        &self,
        symbol: &str,
        quantity: u64,
        order_id: &str,
        token: &AccessToken,
    ) -> Result<OrderAck>;

    /// Last traded price for a symbol
    async fn get_current_price(&self, symbol: &str, token: &AccessToken) -> Result<Decimal>;

    /// Release connections held by the gateway
    async fn close(&self) -> Result<()> {
        Ok(())
    }

    /// Short name used in logs
    fn name(&self) -> &'static str;
}

/// Destination for operator alerts
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn deliver(&self, alert: &Alert) -> Result<()>;
}
