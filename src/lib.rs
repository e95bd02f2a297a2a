//! # Swing Rotator
//!
//! Coordination substrate for several independent swing-trading workers that
//! share one Kraken account: one worker per asset, run periodically by a
//! scheduler, all drawing from a single USD pool and a single API key.
//!
//! ## Architecture
//!
//! - `config`: Configuration management and validation
//! - `coordination`: File-lock sequence counter and per-asset tick lock
//! - `exchange`: Kraken REST client, balance cache, mock exchange
//! - `strategy`: Capital allocator, swing signals, trading worker
//! - `persistence`: Per-asset state files and trade event logs
//! - `notify`: Telegram and log notification sinks
//! - `utils`: Shared utilities and decimal arithmetic

pub mod config;
pub mod coordination;
pub mod error;
pub mod exchange;
pub mod notify;
pub mod persistence;
pub mod strategy;
pub mod utils;

pub use config::Config;
pub use error::{Result, RotatorError};
