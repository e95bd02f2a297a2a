//! Exit policy for one scheduled run (a tick or a daily report).

use std::time::Duration;
use tracing::{error, warn};

use crate::error::{Result, RotatorError};
use crate::notify::{notify, Notifier};

/// How the process should end after a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    Clean,
    Failed,
}

/// Apply the exit policy to a run result.
///
/// Rate limiting is routine: sleep `cooldown` and end clean so the scheduler
/// does not count it as a failure. Any other error alerts the operator and
/// ends failed.
pub async fn settle_run<T>(
    asset: &str,
    result: Result<T>,
    notifier: &dyn Notifier,
    cooldown: Duration,
) -> RunExit {
    match result {
        Ok(_) => RunExit::Clean,
        Err(RotatorError::RateLimited(msg)) => {
            warn!(asset, %msg, cooldown_secs = cooldown.as_secs(), "Rate limited, cooling down before exit");
            tokio::time::sleep(cooldown).await;
            RunExit::Clean
        }
        Err(e) => {
            error!(asset, error = %e, "Run failed");
            notify(notifier, &format!("{} worker error: {}", asset.to_uppercase(), e)).await;
            RunExit::Failed
        }
    }
}
