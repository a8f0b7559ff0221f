//! Durable named FIFO queues whose item TTLs only run down while the queue
//! is disconnected.
//!
//! A [`QueueManager`] owns every [`Queue`] of a process and the single
//! [`Storage`] engine persistent items are mirrored into. Callers operate on
//! a queue through the [`QueueHandle`] returned by
//! [`QueueManager::get_queue`]:
//!
//! ```no_run
//! use driftq::{Item, QueueManager, StorageConfig};
//!
//! # fn main() -> driftq::Result<()> {
//! let mut manager = QueueManager::open(&StorageConfig::new("jobs.log"))?;
//! let mut jobs = manager.get_queue("jobs")?;
//! let report = jobs.connect()?;
//! jobs.push(Item::persistent("a1", "payload", 30.0))?;
//! while let Some(item) = jobs.pop()? {
//!     println!("{} ({:.1}s left)", item.uuid, item.ttl);
//! }
//! jobs.disconnect();
//! # let _ = report;
//! # Ok(())
//! # }
//! ```

pub mod clock;
pub mod config;
pub mod error;
pub mod item;
pub mod manager;
mod mmap;
pub mod queue;
mod record;
pub mod storage;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{Durability, StorageBackend, StorageConfig};
pub use error::{Error, Result};
pub use item::{Item, ItemFlags};
pub use manager::{ManagerStats, QueueManager};
pub use queue::{ExpiryReport, Queue, QueueHandle};
pub use storage::{open_storage, CompactionStats, LogStorage, MemoryStorage, Storage};
