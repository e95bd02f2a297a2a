//! Advisory `flock(2)` locks on shared files.
//!
//! The lock belongs to the open file description, so two handles opened by the
//! same process contend exactly like two separate processes do.

use crate::error::{Result, RotatorError};
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(5);

/// An exclusive lock held on an open file. Released on drop.
#[derive(Debug)]
pub struct FileLock {
    file: File,
    path: PathBuf,
}

impl FileLock {
    /// Block until the exclusive lock is held or `timeout` elapses.
    pub fn acquire(path: &Path, timeout: Duration) -> Result<Self> {
        let file = open_shared(path)?;
        let started = Instant::now();

        loop {
            match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
                Ok(()) => {
                    debug!(path = ?path, waited_ms = started.elapsed().as_millis() as u64, "File lock acquired");
                    return Ok(Self {
                        file,
                        path: path.to_path_buf(),
                    });
                }
                Err(e) if e == Errno::EWOULDBLOCK || e == Errno::EINTR => {
                    if started.elapsed() >= timeout {
                        return Err(RotatorError::CoordinatorUnavailable {
                            path: path.to_path_buf(),
                            waited_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
                Err(e) => return Err(RotatorError::Io(e.into())),
            }
        }
    }

    /// Take the lock only if nobody holds it right now.
    pub fn try_acquire(path: &Path) -> Result<Option<Self>> {
        let file = open_shared(path)?;

        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => Ok(Some(Self {
                file,
                path: path.to_path_buf(),
            })),
            Err(Errno::EWOULDBLOCK) => Ok(None),
            Err(e) => Err(RotatorError::Io(e.into())),
        }
    }

    /// The locked file. Reads and writes go through this handle.
    pub fn file_mut(&mut self) -> &mut File {
        &mut self.file
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        if let Err(e) = flock(self.file.as_raw_fd(), FlockArg::Unlock) {
            // Closing the descriptor releases it anyway
            warn!(path = ?self.path, error = %e, "Failed to release file lock");
        }
    }
}

/// Open for read/write without truncating, creating the file and its directory.
fn open_shared(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let file = OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)?;
    Ok(file)
}
