//! Owner of every queue in a process and of the one storage they share.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::StorageConfig;
use crate::queue::{Queue, QueueHandle};
use crate::storage::{open_storage, Storage};
use crate::{Error, Result};

/// Point-in-time counters over the queues held in memory.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ManagerStats {
    pub queues: usize,
    pub connected: usize,
    pub items: usize,
}

/// Maps queue names to queues and mediates their access to storage.
///
/// On construction every queue found in storage is loaded and left
/// disconnected. A name never maps to more than one [`Queue`].
pub struct QueueManager {
    storage: Box<dyn Storage>,
    queues: HashMap<String, Queue>,
    clock: Arc<dyn Clock>,
    closed: bool,
}

impl QueueManager {
    /// Creates a manager over `storage` using the system clock.
    pub fn new(storage: Box<dyn Storage>) -> Result<Self> {
        Self::with_clock(storage, Arc::new(SystemClock))
    }

    pub fn with_clock(storage: Box<dyn Storage>, clock: Arc<dyn Clock>) -> Result<Self> {
        let mut manager = Self {
            storage,
            queues: HashMap::new(),
            clock,
            closed: false,
        };
        let loaded = manager.load_from_storage()?;
        info!("queue manager started with {loaded} stored queues");
        Ok(manager)
    }

    /// Opens the storage engine named by `config` and builds a manager on it.
    pub fn open(config: &StorageConfig) -> Result<Self> {
        Self::new(open_storage(config)?)
    }

    /// Materializes every queue that has items in storage.
    ///
    /// Queues already in memory are left as they are. Returns the number of
    /// names storage reported.
    pub fn load_from_storage(&mut self) -> Result<usize> {
        if self.closed {
            return Err(Error::ManagerClosed);
        }
        let stored = self.storage.get_all_items()?;
        let found = stored.len();
        let now_ns = self.clock.now();
        for (name, items) in stored {
            if let Entry::Vacant(entry) = self.queues.entry(name) {
                let queue = Queue::from_stored(entry.key(), items, now_ns);
                entry.insert(queue);
            }
        }
        Ok(found)
    }

    /// Returns the queue called `name`, loading its backlog on first use.
    ///
    /// # Errors
    ///
    /// `Error::ManagerClosed` after [`close`](Self::close); storage errors
    /// while loading a new queue.
    pub fn get_queue(&mut self, name: &str) -> Result<QueueHandle<'_>> {
        if self.closed {
            return Err(Error::ManagerClosed);
        }
        let storage = &mut *self.storage;
        let clock = &*self.clock;
        let queue = match self.queues.entry(name.to_string()) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => entry.insert(Queue::load(name, &*storage, clock.now())?),
        };
        Ok(QueueHandle {
            queue,
            storage,
            clock,
        })
    }

    /// Read-only view of a queue already in memory.
    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    pub fn contains_queue(&self, name: &str) -> bool {
        self.queues.contains_key(name)
    }

    /// Names of the queues in memory, sorted.
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.queues.keys().cloned().collect();
        names.sort_unstable();
        names
    }

    /// Drops every empty queue from memory and returns their names, sorted.
    ///
    /// Storage is not touched; a later `get_queue` builds a fresh queue.
    pub fn cleanup(&mut self) -> Vec<String> {
        let mut empty: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, queue)| queue.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        empty.sort_unstable();
        for name in &empty {
            self.queues.remove(name);
        }
        if !empty.is_empty() {
            debug!("cleanup dropped {} empty queues", empty.len());
        }
        empty
    }

    pub fn stats(&self) -> ManagerStats {
        self.queues
            .values()
            .fold(ManagerStats::default(), |mut stats, queue| {
                stats.queues += 1;
                stats.items += queue.len();
                if queue.is_connected() {
                    stats.connected += 1;
                }
                stats
            })
    }

    pub fn storage(&self) -> &dyn Storage {
        &*self.storage
    }

    /// Drops all queues and closes storage. Closing twice is a no-op.
    ///
    /// The manager is unusable afterwards even if closing storage failed.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.queues.clear();
        self.storage.close()?;
        info!("queue manager closed");
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for QueueManager {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("closing queue manager on drop failed: {err}");
        }
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &self.queue_names())
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
