//! Exchange integration for the swing workers.
//!
//! ## Kraken
//! REST connectivity for:
//! - Market data (public ticker)
//! - Account operations (balances, market orders), signed with the shared
//!   sequence counter
//!
//! ## Cache
//! Short-lived per-process balance cache with a forced refresh after orders.
//!
//! ## Mock
//! In-memory exchange with instant fills for tests.

pub mod cache;
mod client;
pub mod mock;
mod traits;
mod types;

pub use cache::CachedExchange;
pub use client::{sign_request, KrakenClient, RetryPolicy};
pub use mock::{MockExchange, MockOp};
pub use traits::ExchangeApi;
pub use types::*;
