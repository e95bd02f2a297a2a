//! Venue-agnostic trait for the exchange operations a worker needs.
//!
//! Implemented by the live Kraken client, the balance cache wrapping it, and
//! the in-memory mock used by tests. Dry runs still read prices and balances
//! from the live client and only skip order submission.

use async_trait::async_trait;

use super::types::{BalanceSnapshot, MarketOrder, OrderAck, PriceQuote};
use crate::error::Result;

#[async_trait]
pub trait ExchangeApi: Send + Sync {
    /// Last price and 24h open for a pair. Public, unsigned.
    async fn ticker(&self, pair: &str) -> Result<PriceQuote>;

    /// All account balances. Signed.
    async fn balances(&self) -> Result<BalanceSnapshot>;

    /// Submit a market order. Signed, and never blindly retried: a timeout
    /// surfaces as `OrderUnconfirmed`.
    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck>;
}
