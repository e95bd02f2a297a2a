//! Trading strategy implementation.
//!
//! Contains the core logic for:
//! - Capital admission across assets sharing one USD pool
//! - Swing signal evaluation (pure)
//! - The per-asset worker tick that acts on those signals
//! - The daily overview report
//! - The exit policy shared by scheduled runs

pub mod allocator;
pub mod exit;
pub mod report;
pub mod signals;
pub mod worker;

pub use allocator::{AssetAllocation, CapitalAllocator};
pub use exit::{settle_run, RunExit};
pub use report::{DailyReport, DailyReporter};
pub use signals::{ExitReason, Signal, Thresholds};
pub use worker::{TickAction, TickOutcome, TickReport, TradingWorker};
