//! Per-asset guard against overlapping ticks of the same worker.

use super::lock::FileLock;
use crate::error::Result;
use std::path::Path;
use tracing::info;

/// Held for the whole duration of one tick. Released on drop.
#[derive(Debug)]
pub struct TickLock {
    _lock: FileLock,
}

impl TickLock {
    /// Non-blocking. `None` means another tick of this asset is still running.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        match FileLock::try_acquire(path)? {
            Some(lock) => Ok(Some(Self { _lock: lock })),
            None => {
                info!(path = ?path, "Previous tick still running, skipping");
                Ok(None)
            }
        }
    }
}
