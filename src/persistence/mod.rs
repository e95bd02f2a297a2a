//! File persistence for the per-asset workers.
//!
//! - Swing state: one JSON document per asset, replaced atomically each tick
//! - Trade events: append-only JSON lines per asset, for external analysis
//! - Daily snapshot: last reported portfolio value per asset

mod events;
mod snapshot;
mod state;

pub use events::{AllocationView, EventLog, EventType, TradeEvent};
pub use snapshot::{PortfolioSnapshot, SnapshotStore};
pub use state::{AssetTradingState, Mode, StateStore};
