//! Daily portfolio value snapshot, one small JSON document per asset.
//!
//! The file keeps the `{"last_value": 1234.5}` shape older deployments
//! wrote, so an existing snapshot keeps its P/L baseline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Result, RotatorError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioSnapshot {
    /// Total value (trading slice plus core reference) in USD
    #[serde(with = "rust_decimal::serde::float")]
    pub last_value: Decimal,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub taken_at: Option<DateTime<Utc>>,
}

pub struct SnapshotStore {
    path: PathBuf,
}

impl SnapshotStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The previous snapshot, or `None` before the first report.
    pub fn load(&self) -> Result<Option<PortfolioSnapshot>> {
        if !self.path.exists() {
            return Ok(None);
        }

        let raw = fs::read_to_string(&self.path)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }

        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|e| RotatorError::InvalidState {
                path: self.path.clone(),
                reason: e.to_string(),
            })
    }

    /// Replace the snapshot atomically.
    pub fn save(&self, snapshot: &PortfolioSnapshot) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(snapshot)?;

        {
            let mut file = File::create(&tmp)?;
            file.write_all(json.as_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        debug!(path = ?self.path, value = %snapshot.last_value, "Snapshot saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn temp_store() -> SnapshotStore {
        SnapshotStore::new(
            std::env::temp_dir()
                .join(format!("rotator_snapshot_{}", uuid::Uuid::new_v4()))
                .join("snapshot_btc.json"),
        )
    }

    #[test]
    fn test_missing_file_has_no_baseline() {
        assert_eq!(temp_store().load().unwrap(), None);
    }

    #[test]
    fn test_reads_legacy_numeric_document() {
        let store = temp_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{\n  \"last_value\": 1523.37\n}").unwrap();

        let snapshot = store.load().unwrap().unwrap();
        assert_eq!(snapshot.last_value, dec!(1523.37));
        assert_eq!(snapshot.taken_at, None);
    }

    #[test]
    fn test_save_writes_number_and_replaces() {
        let store = temp_store();
        store
            .save(&PortfolioSnapshot { last_value: dec!(100), taken_at: None })
            .unwrap();
        store
            .save(&PortfolioSnapshot { last_value: dec!(110.25), taken_at: Some(Utc::now()) })
            .unwrap();

        let raw: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(store.path()).unwrap()).unwrap();
        assert_eq!(raw["last_value"].as_f64(), Some(110.25));
        assert_eq!(store.load().unwrap().unwrap().last_value, dec!(110.25));
        assert!(!store.path().with_extension("json.tmp").exists());
    }

    #[test]
    fn test_corrupt_snapshot_is_an_error() {
        let store = temp_store();
        fs::create_dir_all(store.path().parent().unwrap()).unwrap();
        fs::write(store.path(), "{not json").unwrap();

        assert!(matches!(store.load(), Err(RotatorError::InvalidState { .. })));
    }
}
