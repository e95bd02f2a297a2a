//! Cross-process coordination through advisory file locks.
//!
//! - `sequence`: the shared monotonic sequence counter for signed requests
//! - `tick_lock`: keeps two ticks of the same asset from overlapping

pub mod lock;
pub mod sequence;
pub mod tick_lock;

pub use lock::FileLock;
pub use sequence::SequenceCoordinator;
pub use tick_lock::TickLock;
