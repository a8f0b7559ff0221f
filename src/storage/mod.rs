//! Durable item storage.
//!
//! A store holds `(queue, uuid, data, ttl, flags)` records, unique by uuid,
//! read back per queue in insertion order. Queues mirror their persistent
//! items into exactly one store, owned by the queue manager.
//!
//! Two engines implement the contract:
//!
//! - [`LogStorage`]: append-only log file, `fsync`ed per mutation (default)
//! - [`MemoryStorage`]: process memory, for tests and embedding
//!
//! Use [`open_storage`] to build the engine named by a [`StorageConfig`].

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{StorageBackend, StorageConfig};
use crate::item::Item;
use crate::Result;

mod log_store;
mod memory;

pub use log_store::LogStorage;
pub use memory::MemoryStorage;

/// Outcome of a compaction pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CompactionStats {
    /// Records present before compaction (inserts, deletes, TTL updates).
    pub records_before: usize,
    /// Items still stored afterwards.
    pub live_items: usize,
    pub bytes_before: u64,
    pub bytes_after: u64,
}

impl CompactionStats {
    pub fn reclaimed_bytes(&self) -> u64 {
        self.bytes_before.saturating_sub(self.bytes_after)
    }
}

/// Storage contract shared by all engines.
///
/// Every mutation is durable (per the engine's durability setting) before it
/// returns. Batch calls are not atomic as a unit. Unknown ids passed to
/// [`delete_items`](Storage::delete_items) or
/// [`update_items_ttl`](Storage::update_items_ttl) are ignored.
///
/// # Errors
///
/// - `Error::Io` / `Error::Corrupt` / `Error::UnsupportedVersion`: medium faults
/// - `Error::StorageClosed`: any call other than `close` after `close`
pub trait Storage: Send {
    /// Distinct names of queues holding at least one item.
    fn list_queue_names(&self) -> Result<BTreeSet<String>>;

    /// Items of `queue` in insertion order.
    fn get_items(&self, queue: &str) -> Result<Vec<Item>>;

    /// Every stored item grouped by queue, each group in insertion order.
    ///
    /// Used to load all queues at startup. The default asks for each queue in
    /// turn; engines that have to read the whole store per call override it.
    fn get_all_items(&self) -> Result<BTreeMap<String, Vec<Item>>> {
        let mut all = BTreeMap::new();
        for name in self.list_queue_names()? {
            let items = self.get_items(&name)?;
            all.insert(name, items);
        }
        Ok(all)
    }

    /// Inserts one item.
    ///
    /// Fails with `Error::DuplicateItem` if the uuid is already stored; the
    /// store is unchanged after any failure.
    fn push(&mut self, queue: &str, item: &Item) -> Result<()>;

    fn delete_items(&mut self, uuids: &[&str]) -> Result<()>;

    fn update_items_ttl(&mut self, updates: &[(&str, f64)]) -> Result<()>;

    /// Reclaims space held by deleted or overwritten records.
    fn compact(&mut self) -> Result<CompactionStats>;

    /// Releases the backing medium. Closing twice is a no-op.
    fn close(&mut self) -> Result<()>;

    fn is_closed(&self) -> bool;
}

/// Opens the storage engine selected by `config`.
pub fn open_storage(config: &StorageConfig) -> Result<Box<dyn Storage>> {
    match config.backend {
        StorageBackend::Log => {
            log::info!(
                "opening log storage at {} (durability {:?})",
                config.path.display(),
                config.durability
            );
            Ok(Box::new(LogStorage::open_with_config(config)?))
        }
        StorageBackend::Memory => {
            log::info!("opening memory storage");
            Ok(Box::new(MemoryStorage::new()))
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use tempfile::tempdir;

    #[test]
    fn factory_selects_backend() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.log");

        let mut storage = open_storage(&StorageConfig::new(&path)).expect("open log");
        storage.push("q", &Item::persistent("a", "x", 1.0)).expect("push");
        storage.close().expect("close");
        assert!(path.exists());

        let memory = open_storage(&StorageConfig::memory()).expect("open memory");
        assert!(memory.list_queue_names().expect("names").is_empty());
    }
}
