//! Named FIFO queue with disconnect-driven TTL accounting.
//!
//! A queue starts out disconnected: whatever time passed before the process
//! started is not charged. TTLs are only decremented when the queue
//! reconnects, by the wall-clock time spent disconnected.
//!
//! ```text
//!            disconnect()               connect()
//! CONNECTED ─────────────▶ DISCONNECTED ──────────▶ CONNECTED
//!                          (stamp now)    (ttl -= now - stamp,
//!                                          evict ttl < 0)
//! ```
//!
//! Persistent items are mirrored into the manager's [`Storage`]; storage is
//! always written before the in-memory sequence changes, so a failed write
//! leaves the queue exactly as it was.

use std::collections::VecDeque;

use log::{debug, trace, warn};

use crate::clock::{elapsed_secs, Clock};
use crate::item::Item;
use crate::storage::Storage;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LinkState {
    Connected,
    Disconnected { since_ns: u64 },
}

/// Outcome of a reconnect.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ExpiryReport {
    /// Seconds charged against every item's TTL.
    pub elapsed_secs: f64,
    /// Items that survived.
    pub kept: usize,
    /// Items evicted because their TTL went negative.
    pub expired: usize,
}

/// In-memory state of one named queue.
///
/// Queues are owned by a [`QueueManager`](crate::QueueManager) and operated
/// through a [`QueueHandle`].
#[derive(Debug)]
pub struct Queue {
    name: String,
    items: VecDeque<Item>,
    link: LinkState,
}

impl Queue {
    /// Builds a queue from its stored backlog and marks it disconnected at `now_ns`.
    pub(crate) fn load(name: &str, storage: &dyn Storage, now_ns: u64) -> Result<Self> {
        Ok(Self::from_stored(name, storage.get_items(name)?, now_ns))
    }

    /// Same as [`load`](Self::load) for a backlog that was already read.
    pub(crate) fn from_stored(name: &str, items: Vec<Item>, now_ns: u64) -> Self {
        debug!("loaded queue {name} with {} stored items", items.len());
        Self {
            name: name.to_string(),
            items: items.into(),
            link: LinkState::Disconnected { since_ns: now_ns },
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.link == LinkState::Connected
    }

    /// Timestamp of the last disconnect, if currently disconnected.
    pub fn disconnected_since(&self) -> Option<u64> {
        match self.link {
            LinkState::Connected => None,
            LinkState::Disconnected { since_ns } => Some(since_ns),
        }
    }

    /// Front item. TTLs are not checked here; expired items are only removed
    /// by [`connect`](QueueHandle::connect).
    pub fn peek(&self) -> Option<&Item> {
        self.items.front()
    }

    /// Items front to back.
    pub fn iter(&self) -> impl Iterator<Item = &Item> {
        self.items.iter()
    }

    pub(crate) fn push(&mut self, storage: &mut dyn Storage, item: Item) -> Result<()> {
        if item.is_persistent() {
            storage.push(&self.name, &item)?;
        }
        trace!("queue {}: pushed {}", self.name, item.uuid);
        self.items.push_back(item);
        Ok(())
    }

    pub(crate) fn pop(&mut self, storage: &mut dyn Storage) -> Result<Option<Item>> {
        let persistent_front = match self.items.front() {
            Some(item) if item.is_persistent() => Some(item.uuid.as_str()),
            Some(_) => None,
            None => return Ok(None),
        };
        if let Some(uuid) = persistent_front {
            storage.delete_items(&[uuid])?;
        }
        let item = self.items.pop_front();
        if let Some(item) = &item {
            trace!("queue {}: popped {}", self.name, item.uuid);
        }
        Ok(item)
    }

    pub(crate) fn connect(&mut self, storage: &mut dyn Storage, now_ns: u64) -> Result<ExpiryReport> {
        let since_ns = match self.link {
            LinkState::Connected => {
                debug!("queue {}: connect while connected ignored", self.name);
                return Ok(ExpiryReport {
                    kept: self.items.len(),
                    ..ExpiryReport::default()
                });
            }
            LinkState::Disconnected { since_ns } => since_ns,
        };
        if now_ns < since_ns {
            warn!(
                "queue {}: clock moved back {} ns since disconnect, charging nothing",
                self.name,
                since_ns - now_ns
            );
        }
        let elapsed = elapsed_secs(since_ns, now_ns);

        let mut survivors = Vec::with_capacity(self.items.len());
        let mut ttl_updates = Vec::new();
        let mut doomed = Vec::new();
        for (index, item) in self.items.iter().enumerate() {
            let ttl = item.ttl - elapsed;
            if ttl >= 0.0 {
                survivors.push((index, ttl));
                if item.is_persistent() {
                    ttl_updates.push((item.uuid.as_str(), ttl));
                }
            } else if item.is_persistent() {
                doomed.push(item.uuid.as_str());
            }
        }

        storage.update_items_ttl(&ttl_updates)?;
        storage.delete_items(&doomed)?;

        let report = ExpiryReport {
            elapsed_secs: elapsed,
            kept: survivors.len(),
            expired: self.items.len() - survivors.len(),
        };

        let mut survivors = survivors.into_iter().peekable();
        let old = std::mem::take(&mut self.items);
        for (index, mut item) in old.into_iter().enumerate() {
            if let Some(&(keep, ttl)) = survivors.peek() {
                if keep == index {
                    item.ttl = ttl;
                    self.items.push_back(item);
                    survivors.next();
                }
            }
        }
        self.link = LinkState::Connected;

        debug!(
            "queue {} connected after {:.3}s: kept {}, expired {}",
            self.name, report.elapsed_secs, report.kept, report.expired
        );
        Ok(report)
    }

    pub(crate) fn disconnect(&mut self, now_ns: u64) {
        self.link = LinkState::Disconnected { since_ns: now_ns };
        debug!("queue {} disconnected", self.name);
    }
}

/// Mutable access to one queue together with the storage and clock it needs.
///
/// Obtained from [`QueueManager::get_queue`](crate::QueueManager::get_queue);
/// it borrows the manager, so only one queue is operated on at a time.
pub struct QueueHandle<'m> {
    pub(crate) queue: &'m mut Queue,
    pub(crate) storage: &'m mut dyn Storage,
    pub(crate) clock: &'m dyn Clock,
}

impl<'m> QueueHandle<'m> {
    pub fn name(&self) -> &str {
        self.queue.name()
    }

    /// Appends `item`. Persistent items are stored before they are queued.
    ///
    /// # Errors
    ///
    /// Storage errors (including `Error::DuplicateItem`) leave the queue unchanged.
    pub fn push(&mut self, item: Item) -> Result<()> {
        self.queue.push(self.storage, item)
    }

    pub fn peek(&self) -> Option<&Item> {
        self.queue.peek()
    }

    /// Removes and returns the front item; `None` when empty.
    ///
    /// A persistent item's row is deleted first; if that fails the item stays.
    pub fn pop(&mut self) -> Result<Option<Item>> {
        self.queue.pop(self.storage)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_connected(&self) -> bool {
        self.queue.is_connected()
    }

    /// Charges the time spent disconnected against every TTL and evicts items
    /// whose TTL fell below zero (zero survives).
    ///
    /// Calling it while already connected is a no-op. If storage fails, the
    /// queue keeps its items, TTLs and disconnect stamp, so a retry charges
    /// the same interval again from the same starting point.
    pub fn connect(&mut self) -> Result<ExpiryReport> {
        self.queue.connect(self.storage, self.clock.now())
    }

    /// Stamps the disconnect time. TTLs are not touched until the next connect.
    pub fn disconnect(&mut self) {
        self.queue.disconnect(self.clock.now());
    }

    /// Read-only view of the queue.
    pub fn queue(&self) -> &Queue {
        self.queue
    }
}
