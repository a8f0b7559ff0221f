//! In-memory storage engine.
//!
//! Items are kept in process memory and are lost when the engine is dropped.

use std::collections::BTreeSet;

use super::{CompactionStats, Storage};
use crate::item::Item;
use crate::record::validate_insert;
use crate::{Error, Result};

#[derive(Debug)]
struct Row {
    seq: u64,
    queue: String,
    item: Item,
}

/// Storage engine backed by a vector of rows in insertion order.
#[derive(Debug, Default)]
pub struct MemoryStorage {
    rows: Vec<Row>,
    next_seq: u64,
    closed: bool,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::StorageClosed);
        }
        Ok(())
    }
}

impl Storage for MemoryStorage {
    fn list_queue_names(&self) -> Result<BTreeSet<String>> {
        self.ensure_open()?;
        Ok(self.rows.iter().map(|row| row.queue.clone()).collect())
    }

    fn get_items(&self, queue: &str) -> Result<Vec<Item>> {
        self.ensure_open()?;
        Ok(self
            .rows
            .iter()
            .filter(|row| row.queue == queue)
            .map(|row| row.item.clone())
            .collect())
    }

    fn push(&mut self, queue: &str, item: &Item) -> Result<()> {
        self.ensure_open()?;
        validate_insert(queue, item)?;
        if self.rows.iter().any(|row| row.item.uuid == item.uuid) {
            return Err(Error::DuplicateItem(item.uuid.clone()));
        }
        self.rows.push(Row {
            seq: self.next_seq,
            queue: queue.to_string(),
            item: item.clone(),
        });
        self.next_seq += 1;
        Ok(())
    }

    fn delete_items(&mut self, uuids: &[&str]) -> Result<()> {
        self.ensure_open()?;
        self.rows
            .retain(|row| !uuids.contains(&row.item.uuid.as_str()));
        Ok(())
    }

    fn update_items_ttl(&mut self, updates: &[(&str, f64)]) -> Result<()> {
        self.ensure_open()?;
        for &(uuid, ttl) in updates {
            if let Some(row) = self.rows.iter_mut().find(|row| row.item.uuid == uuid) {
                row.item.ttl = ttl;
            }
        }
        Ok(())
    }

    fn compact(&mut self) -> Result<CompactionStats> {
        self.ensure_open()?;
        debug_assert!(self.rows.windows(2).all(|pair| pair[0].seq < pair[1].seq));
        Ok(CompactionStats {
            records_before: self.rows.len(),
            live_items: self.rows.len(),
            bytes_before: 0,
            bytes_after: 0,
        })
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        self.rows.clear();
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed
    }
}
