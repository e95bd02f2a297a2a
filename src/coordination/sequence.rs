//! Cross-process monotonic sequence values for signed exchange requests.
//!
//! Every process signing with the same API credentials must draw from the same
//! file. The exchange rejects any request whose sequence value is not strictly
//! greater than the last one it saw for those credentials.

use super::lock::FileLock;
use crate::error::Result;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Hands out strictly increasing integers backed by a locked shared file.
#[derive(Debug, Clone)]
pub struct SequenceCoordinator {
    path: PathBuf,
    lock_timeout: Duration,
}

impl SequenceCoordinator {
    pub fn new(path: impl Into<PathBuf>, lock_timeout: Duration) -> Self {
        Self {
            path: path.into(),
            lock_timeout,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Issue the next sequence value.
    ///
    /// Returns `max(now_ms, stored + 1)` and persists it before the lock is
    /// released. Fails with `CoordinatorUnavailable` when the lock is not
    /// obtained within the configured wait.
    pub fn next_sequence(&self) -> Result<u64> {
        let mut lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        let file = lock.file_mut();

        let stored = read_stored(file, &self.path)?.unwrap_or(0);
        let candidate = now_millis().max(stored.saturating_add(1));

        file.seek(SeekFrom::Start(0))?;
        file.set_len(0)?;
        write!(file, "{}", candidate)?;
        file.sync_data()?;

        debug!(sequence = candidate, stored, "Issued sequence value");
        Ok(candidate)
    }

    /// Last issued value, read under the same lock. `None` if nothing valid is stored.
    pub fn peek(&self) -> Result<Option<u64>> {
        let mut lock = FileLock::acquire(&self.path, self.lock_timeout)?;
        read_stored(lock.file_mut(), &self.path)
    }
}

/// Read the stored integer. Empty or malformed content counts as absent.
fn read_stored(file: &mut File, path: &Path) -> Result<Option<u64>> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0))?;
    file.read_to_string(&mut contents)?;

    let trimmed = contents.trim();
    if trimmed.is_empty() {
        return Ok(None);
    }

    match trimmed.parse::<u64>() {
        Ok(value) => Ok(Some(value)),
        Err(_) => {
            warn!(path = ?path, contents = trimmed, "Sequence file unparseable, treating as absent");
            Ok(None)
        }
    }
}

fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}
