//! Per-process balance cache in front of any `ExchangeApi`.
//!
//! Balance reads inside the TTL are served from memory. Placing an order
//! invalidates the cache and refetches, so the worker's next decision sees its
//! own fill. The cache is private to one process and is not coherent with other
//! workers' views.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::traits::ExchangeApi;
use super::types::{BalanceSnapshot, MarketOrder, OrderAck, PriceQuote};
use crate::error::Result;

struct CachedBalances {
    snapshot: BalanceSnapshot,
    fetched_at: Instant,
}

pub struct CachedExchange {
    inner: Arc<dyn ExchangeApi>,
    ttl: Duration,
    balances: RwLock<Option<CachedBalances>>,
}

impl CachedExchange {
    pub fn new(inner: Arc<dyn ExchangeApi>, ttl: Duration) -> Self {
        Self {
            inner,
            ttl,
            balances: RwLock::new(None),
        }
    }

    /// Bypass the cache and store the fresh snapshot.
    pub async fn refresh_balances(&self) -> Result<BalanceSnapshot> {
        let snapshot = self.inner.balances().await?;
        *self.balances.write().await = Some(CachedBalances {
            snapshot: snapshot.clone(),
            fetched_at: Instant::now(),
        });
        Ok(snapshot)
    }

    pub async fn invalidate(&self) {
        *self.balances.write().await = None;
    }
}

#[async_trait]
impl ExchangeApi for CachedExchange {
    async fn ticker(&self, pair: &str) -> Result<PriceQuote> {
        self.inner.ticker(pair).await
    }

    async fn balances(&self) -> Result<BalanceSnapshot> {
        if let Some(cached) = self.balances.read().await.as_ref() {
            if cached.fetched_at.elapsed() < self.ttl {
                debug!(age_ms = cached.fetched_at.elapsed().as_millis() as u64, "Balance cache hit");
                return Ok(cached.snapshot.clone());
            }
        }

        self.refresh_balances().await
    }

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck> {
        self.invalidate().await;
        let ack = self.inner.place_market_order(order).await?;

        // The order stands either way; a failed refresh only leaves the cache empty
        if let Err(e) = self.refresh_balances().await {
            warn!(error = %e, "Balance refresh after order failed");
        }

        Ok(ack)
    }
}
