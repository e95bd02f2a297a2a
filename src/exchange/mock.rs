//! In-memory exchange for exercising workers without a network.
//!
//! Market orders fill instantly at the current price, moving the quote balance
//! and the pair's base balance.

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::debug;

use super::traits::ExchangeApi;
use super::types::*;
use crate::error::{Result, RotatorError};

/// Which call an injected failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    Ticker,
    Balances,
    Order,
}

#[derive(Debug, Default)]
struct MockState {
    prices: HashMap<String, Decimal>,
    /// Pair -> balance key credited on buys
    base_keys: HashMap<String, String>,
    balances: BalanceSnapshot,
    orders: Vec<MarketOrder>,
    failures: HashMap<MockOp, VecDeque<RotatorError>>,
}

pub struct MockExchange {
    state: Arc<RwLock<MockState>>,
    quote_key: String,
    order_id_counter: AtomicU64,
    balance_calls: AtomicU64,
}

impl Default for MockExchange {
    fn default() -> Self {
        Self::new()
    }
}

impl MockExchange {
    /// Empty exchange quoting in ZUSD.
    pub fn new() -> Self {
        Self {
            state: Arc::new(RwLock::new(MockState::default())),
            quote_key: "ZUSD".to_string(),
            order_id_counter: AtomicU64::new(1),
            balance_calls: AtomicU64::new(0),
        }
    }

    /// Register a pair, its base balance key and its current price.
    pub async fn add_market(&self, pair: &str, base_key: &str, price: Decimal) {
        let mut state = self.state.write().await;
        state.base_keys.insert(pair.to_string(), base_key.to_string());
        state.prices.insert(pair.to_string(), price);
    }

    pub async fn set_price(&self, pair: &str, price: Decimal) {
        self.state.write().await.prices.insert(pair.to_string(), price);
    }

    pub async fn set_balance(&self, key: &str, amount: Decimal) {
        self.state.write().await.balances.set(key, amount);
    }

    /// Make the next call of `op` fail with `error`. Queued failures are consumed in order.
    pub async fn fail_next(&self, op: MockOp, error: RotatorError) {
        self.state
            .write()
            .await
            .failures
            .entry(op)
            .or_default()
            .push_back(error);
    }

    /// Orders that reached the exchange, in submission order.
    pub async fn orders(&self) -> Vec<MarketOrder> {
        self.state.read().await.orders.clone()
    }

    pub async fn balance(&self, key: &str) -> Decimal {
        self.state.read().await.balances.get(key)
    }

    pub fn balance_calls(&self) -> u64 {
        self.balance_calls.load(Ordering::SeqCst)
    }

    async fn take_failure(&self, op: MockOp) -> Result<()> {
        let mut state = self.state.write().await;
        match state.failures.get_mut(&op).and_then(|q| q.pop_front()) {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn ticker(&self, pair: &str) -> Result<PriceQuote> {
        self.take_failure(MockOp::Ticker).await?;

        let state = self.state.read().await;
        let price = state
            .prices
            .get(pair)
            .copied()
            .ok_or_else(|| RotatorError::ExchangeRejected(vec![format!("EQuery:Unknown asset pair {pair}")]))?;

        Ok(PriceQuote {
            pair: pair.to_string(),
            last: price,
            open_24h: price,
            fetched_at: Utc::now(),
        })
    }

    async fn balances(&self) -> Result<BalanceSnapshot> {
        self.balance_calls.fetch_add(1, Ordering::SeqCst);
        self.take_failure(MockOp::Balances).await?;
        Ok(self.state.read().await.balances.clone())
    }

    async fn place_market_order(&self, order: &MarketOrder) -> Result<OrderAck> {
        self.take_failure(MockOp::Order).await?;

        let mut state = self.state.write().await;
        let price = state
            .prices
            .get(&order.pair)
            .copied()
            .ok_or_else(|| RotatorError::ExchangeRejected(vec![format!("EQuery:Unknown asset pair {}", order.pair)]))?;
        let base_key = state
            .base_keys
            .get(&order.pair)
            .cloned()
            .ok_or_else(|| RotatorError::ExchangeRejected(vec![format!("EQuery:Unknown asset pair {}", order.pair)]))?;

        let notional = order.volume * price;
        let quote = state.balances.get(&self.quote_key);
        let base = state.balances.get(&base_key);

        match order.side {
            OrderSide::Buy => {
                if notional > quote {
                    return Err(RotatorError::ExchangeRejected(vec!["EOrder:Insufficient funds".into()]));
                }
                state.balances.set(self.quote_key.clone(), quote - notional);
                state.balances.set(base_key, base + order.volume);
            }
            OrderSide::Sell => {
                if order.volume > base {
                    return Err(RotatorError::ExchangeRejected(vec!["EOrder:Insufficient funds".into()]));
                }
                state.balances.set(self.quote_key.clone(), quote + notional);
                state.balances.set(base_key, base - order.volume);
            }
        }

        state.orders.push(order.clone());
        let id = self.order_id_counter.fetch_add(1, Ordering::SeqCst);

        debug!(pair = %order.pair, side = %order.side, volume = %order.volume, %price, "Mock order filled");

        Ok(OrderAck {
            txids: vec![format!("MOCK-{:06}", id)],
            description: format!("{} {} {} @ market", order.side, order.volume_str(), order.pair),
        })
    }
}
