//! Per-asset swing state, persisted as one JSON document per asset.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{Result, RotatorError};

/// Where the worker is in the swing cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// No position; watching for a pullback
    #[default]
    Idle,
    /// Position open; watching for target or drawdown
    Hold,
    /// Just exited; waiting for a fresh pullback before re-arming
    Reset,
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mode::Idle => write!(f, "idle"),
            Mode::Hold => write!(f, "hold"),
            Mode::Reset => write!(f, "reset"),
        }
    }
}

/// Persisted state of one asset's worker.
///
/// `entry_price` is set exactly when `mode` is `Hold`. Older state files use
/// `last_swing_high`/`last_swing_low` and epoch-second timestamps; both load.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AssetTradingState {
    #[serde(default)]
    pub mode: Mode,
    #[serde(default)]
    pub entry_price: Option<Decimal>,
    #[serde(default, alias = "last_swing_high")]
    pub swing_high: Option<Decimal>,
    #[serde(default, alias = "last_swing_low")]
    pub swing_low: Option<Decimal>,
    #[serde(default)]
    pub buy_approach_sent: bool,
    #[serde(default)]
    pub sell_approach_sent: bool,
    #[serde(default, deserialize_with = "flexible_time::deserialize")]
    pub entry_time: Option<DateTime<Utc>>,
    #[serde(default, deserialize_with = "flexible_time::deserialize")]
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl AssetTradingState {
    pub fn is_consistent(&self) -> bool {
        self.entry_price.is_some() == (self.mode == Mode::Hold)
    }

    /// Repair a state that breaks the hold/entry-price pairing. Returns true if anything changed.
    pub fn normalize(&mut self) -> bool {
        if self.is_consistent() {
            return false;
        }

        if self.mode == Mode::Hold {
            // Nothing to measure gain against
            self.mode = Mode::Idle;
            self.sell_approach_sent = false;
        }
        self.entry_price = None;
        self.entry_time = None;
        true
    }
}

/// Accepts RFC 3339 strings, epoch seconds (integer or float) and null.
mod flexible_time {
    use chrono::{DateTime, Utc};
    use serde::{de, Deserialize, Deserializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Epoch(f64),
        Text(String),
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        match Option::<Raw>::deserialize(deserializer)? {
            None => Ok(None),
            Some(Raw::Epoch(secs)) if secs <= 0.0 => Ok(None),
            Some(Raw::Epoch(secs)) => Ok(DateTime::<Utc>::from_timestamp_millis(
                (secs * 1000.0).round() as i64,
            )),
            Some(Raw::Text(text)) => DateTime::parse_from_rfc3339(&text)
                .map(|t| Some(t.with_timezone(&Utc)))
                .map_err(de::Error::custom),
        }
    }
}

/// Loads and atomically saves one asset's state file.
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state, falling back to defaults when the file does not exist.
    ///
    /// An unreadable file is an error rather than a silent reset, since a lost
    /// `hold` would orphan an open position.
    pub fn load(&self) -> Result<AssetTradingState> {
        if !self.path.exists() {
            debug!(path = ?self.path, "No state file, starting idle");
            return Ok(AssetTradingState::default());
        }

        let contents = fs::read_to_string(&self.path)?;
        if contents.trim().is_empty() {
            warn!(path = ?self.path, "Empty state file, starting idle");
            return Ok(AssetTradingState::default());
        }

        let mut state: AssetTradingState =
            serde_json::from_str(&contents).map_err(|e| RotatorError::InvalidState {
                path: self.path.clone(),
                reason: e.to_string(),
            })?;

        if state.normalize() {
            warn!(path = ?self.path, mode = %state.mode, "State violated hold/entry pairing, repaired");
        }

        Ok(state)
    }

    /// Write to a sibling temp file, fsync, then rename over the real path.
    pub fn save(&self, state: &AssetTradingState) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(state)?;

        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = ?self.path, mode = %state.mode, "State saved");
        Ok(())
    }
}
