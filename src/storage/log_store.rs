//! Append-only log storage engine.
//!
//! The store is one file: a 64-byte format header followed by framed records,
//! each a 24-byte header (length, CRC32, kind, sequence) and a body.
//! Mutations append `Insert`, `Delete` and `SetTtl` records; reads map the
//! file and replay it, so the live item set is always taken from disk.
//!
//! ```text
//! {path}                 ← header + records
//! {path}.compact.tmp     ← compaction output, renamed over {path}
//! ```

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, info, trace, warn};

use super::{CompactionStats, Storage};
use crate::config::{Durability, StorageConfig};
use crate::item::Item;
use crate::mmap::MmapFile;
use crate::record::{self, validate_insert, Record, RecordRef, StoreHeader, STORE_HEADER_SIZE};
use crate::{Error, Result};

/// A live item and the sequence number it was inserted with.
struct LiveRow {
    seq: u64,
    queue: String,
    item: Item,
}

/// File-backed storage engine.
///
/// Only the set of live uuids is held in memory; item content is read from
/// the file on every call.
pub struct LogStorage {
    path: PathBuf,
    file: Option<File>,
    /// End of the last committed record.
    end: u64,
    next_seq: u64,
    live: HashSet<String>,
    durability: Durability,
}

impl LogStorage {
    /// Opens (or creates) a store at `path` with default settings.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_config(&StorageConfig::new(path.as_ref()))
    }

    /// Opens (or creates) the store described by `config`.
    ///
    /// Creates the format header when the file is missing or empty, truncates
    /// a torn last record left by a crash, and compacts when
    /// `config.compact_on_open` is set. A damaged record followed by more data
    /// is not a torn tail; the file is left as is and the open fails.
    ///
    /// # Errors
    ///
    /// - `Error::Io`: the file cannot be created, read or written
    /// - `Error::Corrupt`: the file is not a store, a record before the last one
    ///   fails its checksum, or an intact record is malformed
    /// - `Error::UnsupportedVersion`: the store was written by a newer format
    pub fn open_with_config(config: &StorageConfig) -> Result<Self> {
        let path = config.path.clone();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let needs_format = match fs::metadata(&path) {
            Ok(meta) => meta.len() == 0,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => true,
            Err(err) => return Err(err.into()),
        };
        if needs_format {
            write_file_synced(&temp_path(&path), &StoreHeader::current().to_bytes())?;
            fs::rename(temp_path(&path), &path)?;
            sync_parent_dir(&path)?;
            info!("created store {}", path.display());
        }

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let map = MmapFile::open(&path, u64::MAX)?;
        StoreHeader::from_bytes(map.as_slice())?;
        let scan = record::scan(map.as_slice())?;
        let file_len = map.len() as u64;
        drop(map);

        let end = scan.valid_end as u64;
        if let Some(reason) = scan.torn {
            warn!(
                "store {}: {reason} at offset {end}, truncating {} trailing bytes",
                path.display(),
                file_len - end
            );
            file.set_len(end)?;
            file.sync_all()?;
        }

        let (rows, next_seq) = replay(scan.records);
        let live = rows.into_iter().map(|row| row.item.uuid).collect::<HashSet<_>>();
        info!(
            "opened store {}: {} items, {} bytes",
            path.display(),
            live.len(),
            end
        );

        let mut storage = Self {
            path,
            file: Some(file),
            end,
            next_seq,
            live,
            durability: config.durability,
        };
        if config.compact_on_open {
            storage.compact()?;
        }
        Ok(storage)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Bytes of committed data, header included.
    pub fn size_bytes(&self) -> u64 {
        self.end
    }

    fn ensure_open(&self) -> Result<()> {
        if self.file.is_none() {
            return Err(Error::StorageClosed);
        }
        Ok(())
    }

    /// Reads and replays the committed part of the file.
    fn read_rows(&self) -> Result<(Vec<LiveRow>, usize)> {
        self.ensure_open()?;
        let map = MmapFile::open(&self.path, self.end)?;
        if (map.len() as u64) < self.end {
            return Err(Error::Corrupt("store shorter than committed length"));
        }
        let scan = record::scan(map.as_slice())?;
        if let Some(reason) = scan.torn {
            return Err(Error::Corrupt(reason));
        }
        let records = scan.records.len();
        Ok((replay(scan.records).0, records))
    }

    /// Appends `records` as one write. On failure the file is cut back to the
    /// previous end so no partial record is left behind.
    fn append(&mut self, records: &[RecordRef<'_>]) -> Result<()> {
        let mut buf = Vec::new();
        for record in records {
            record.encode_into(&mut buf)?;
        }
        if buf.is_empty() {
            return Ok(());
        }

        let durability = self.durability;
        let end = self.end;
        let file = self.file.as_mut().ok_or(Error::StorageClosed)?;
        if let Err(err) = write_at(file, end, &buf, durability) {
            if let Err(trunc_err) = file.set_len(end) {
                warn!(
                    "store {}: failed to roll back partial append: {trunc_err}",
                    self.path.display()
                );
            }
            return Err(err.into());
        }
        self.end += buf.len() as u64;
        Ok(())
    }
}

impl Storage for LogStorage {
    fn list_queue_names(&self) -> Result<BTreeSet<String>> {
        let (rows, _) = self.read_rows()?;
        Ok(rows.into_iter().map(|row| row.queue).collect())
    }

    fn get_items(&self, queue: &str) -> Result<Vec<Item>> {
        let (rows, _) = self.read_rows()?;
        Ok(rows
            .into_iter()
            .filter(|row| row.queue == queue)
            .map(|row| row.item)
            .collect())
    }

    /// One replay of the log for all queues.
    fn get_all_items(&self) -> Result<BTreeMap<String, Vec<Item>>> {
        let (rows, _) = self.read_rows()?;
        let mut all: BTreeMap<String, Vec<Item>> = BTreeMap::new();
        for row in rows {
            all.entry(row.queue).or_default().push(row.item);
        }
        Ok(all)
    }

    fn push(&mut self, queue: &str, item: &Item) -> Result<()> {
        self.ensure_open()?;
        validate_insert(queue, item)?;
        if self.live.contains(&item.uuid) {
            return Err(Error::DuplicateItem(item.uuid.clone()));
        }
        let seq = self.next_seq;
        self.append(&[RecordRef::Insert { seq, queue, item }])?;
        self.next_seq = seq.saturating_add(1);
        self.live.insert(item.uuid.clone());
        trace!("stored {} in {queue} (seq {seq})", item.uuid);
        Ok(())
    }

    fn delete_items(&mut self, uuids: &[&str]) -> Result<()> {
        self.ensure_open()?;
        let mut seen = HashSet::new();
        let records: Vec<_> = uuids
            .iter()
            .filter(|uuid| self.live.contains(**uuid) && seen.insert(**uuid))
            .map(|&uuid| RecordRef::Delete { uuid })
            .collect();
        self.append(&records)?;
        for record in &records {
            if let RecordRef::Delete { uuid } = record {
                self.live.remove(*uuid);
            }
        }
        trace!("deleted {} of {} requested items", records.len(), uuids.len());
        Ok(())
    }

    fn update_items_ttl(&mut self, updates: &[(&str, f64)]) -> Result<()> {
        self.ensure_open()?;
        let records: Vec<_> = updates
            .iter()
            .filter(|(uuid, _)| self.live.contains(*uuid))
            .map(|&(uuid, ttl)| RecordRef::SetTtl { uuid, ttl })
            .collect();
        self.append(&records)?;
        trace!("updated ttl of {} of {} requested items", records.len(), updates.len());
        Ok(())
    }

    fn compact(&mut self) -> Result<CompactionStats> {
        let (rows, records_before) = self.read_rows()?;
        let bytes_before = self.end;
        if records_before == rows.len() {
            debug!("store {}: nothing to compact", self.path.display());
            return Ok(CompactionStats {
                records_before,
                live_items: rows.len(),
                bytes_before,
                bytes_after: bytes_before,
            });
        }

        let mut buf = StoreHeader::current().to_bytes().to_vec();
        for row in &rows {
            RecordRef::Insert {
                seq: row.seq,
                queue: &row.queue,
                item: &row.item,
            }
            .encode_into(&mut buf)?;
        }
        let tmp = temp_path(&self.path);
        write_file_synced(&tmp, &buf)?;

        self.file = None;
        let renamed = fs::rename(&tmp, &self.path);
        self.file = Some(OpenOptions::new().read(true).write(true).open(&self.path)?);
        if let Err(err) = renamed {
            let _ = fs::remove_file(&tmp);
            return Err(err.into());
        }
        sync_parent_dir(&self.path)?;
        self.end = buf.len() as u64;

        let stats = CompactionStats {
            records_before,
            live_items: rows.len(),
            bytes_before,
            bytes_after: self.end,
        };
        info!(
            "compacted store {}: {} records -> {} items, reclaimed {} bytes",
            self.path.display(),
            stats.records_before,
            stats.live_items,
            stats.reclaimed_bytes()
        );
        Ok(stats)
    }

    fn close(&mut self) -> Result<()> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
            debug!("closed store {}", self.path.display());
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.file.is_none()
    }
}

/// Folds records into the live set, ordered by insertion sequence.
/// Also returns the next unused sequence number.
fn replay(records: Vec<Record>) -> (Vec<LiveRow>, u64) {
    let mut live: HashMap<String, LiveRow> = HashMap::new();
    let mut next_seq = 0u64;
    for record in records {
        match record {
            Record::Insert { seq, queue, item } => {
                next_seq = next_seq.max(seq.saturating_add(1));
                live.insert(item.uuid.clone(), LiveRow { seq, queue, item });
            }
            Record::Delete { uuid } => {
                live.remove(&uuid);
            }
            Record::SetTtl { uuid, ttl } => {
                if let Some(row) = live.get_mut(&uuid) {
                    row.item.ttl = ttl;
                }
            }
        }
    }
    let mut rows: Vec<_> = live.into_values().collect();
    rows.sort_unstable_by_key(|row| row.seq);
    (rows, next_seq)
}

fn write_at(file: &mut File, offset: u64, buf: &[u8], durability: Durability) -> std::io::Result<()> {
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(buf)?;
    if durability == Durability::Full {
        file.sync_data()?;
    }
    Ok(())
}

fn write_file_synced(path: &Path, data: &[u8]) -> Result<()> {
    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .open(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_else(|| OsString::from("store"));
    name.push(".compact.tmp");
    path.with_file_name(name)
}

#[cfg(unix)]
fn sync_parent_dir(path: &Path) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    File::open(parent)?.sync_all()?;
    Ok(())
}

#[cfg(not(unix))]
fn sync_parent_dir(_path: &Path) -> Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::record::RECORD_HEADER_SIZE;
    use crate::storage::contract;
    use tempfile::{tempdir, TempDir};

    fn fresh() -> (TempDir, LogStorage) {
        let dir = tempdir().expect("tempdir");
        let storage = LogStorage::open(dir.path().join("store.log")).expect("open");
        (dir, storage)
    }

    #[test]
    fn insertion_order_per_queue() {
        let (_dir, mut storage) = fresh();
        contract::insertion_order_per_queue(&mut storage);
    }

    #[test]
    fn delete_and_update_ignore_unknown_ids() {
        let (_dir, mut storage) = fresh();
        contract::delete_and_update_ignore_unknown_ids(&mut storage);
    }

    #[test]
    fn emptied_queue_disappears() {
        let (_dir, mut storage) = fresh();
        contract::emptied_queue_disappears(&mut storage);
    }

    #[test]
    fn all_items_grouped_by_queue() {
        let (_dir, mut storage) = fresh();
        contract::all_items_grouped_by_queue(&mut storage);
    }

    #[test]
    fn duplicate_uuid_is_rejected() {
        let (_dir, mut storage) = fresh();
        contract::duplicate_uuid_is_rejected(&mut storage);
    }

    #[test]
    fn use_after_close_fails() {
        let (_dir, mut storage) = fresh();
        contract::use_after_close_fails(&mut storage);
    }

    #[test]
    fn creates_header_once() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("nested").join("store.log");

        let mut storage = LogStorage::open(&path).expect("create");
        assert_eq!(storage.size_bytes(), STORE_HEADER_SIZE as u64);
        storage.close().expect("close");

        let storage = LogStorage::open(&path).expect("reopen");
        assert_eq!(storage.size_bytes(), STORE_HEADER_SIZE as u64);
        assert_eq!(fs::metadata(&path).expect("meta").len(), STORE_HEADER_SIZE as u64);
    }

    #[test]
    fn empty_file_is_initialized() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.log");
        fs::write(&path, b"").expect("touch");

        let storage = LogStorage::open(&path).expect("open");
        assert!(storage.list_queue_names().expect("names").is_empty());
    }

    #[test]
    fn foreign_file_is_rejected() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.log");
        fs::write(&path, vec![0xAB; 128]).expect("write");

        assert!(matches!(LogStorage::open(&path), Err(Error::Corrupt(_))));
    }

    #[test]
    fn torn_tail_is_truncated_on_open() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.log");

        let mut storage = LogStorage::open(&path).expect("open");
        storage.push("jobs", &Item::persistent("a", "1", 5.0)).expect("push");
        storage.push("jobs", &Item::persistent("b", "2", 5.0)).expect("push");
        let committed = storage.size_bytes();
        storage.close().expect("close");

        // Half of a record header, as left by a crash mid-append.
        let mut file = OpenOptions::new().append(true).open(&path).expect("open raw");
        file.write_all(&[0x11; RECORD_HEADER_SIZE / 2]).expect("garbage");
        drop(file);

        let storage = LogStorage::open(&path).expect("reopen");
        assert_eq!(storage.size_bytes(), committed);
        assert_eq!(fs::metadata(&path).expect("meta").len(), committed);
        let uuids: Vec<_> = storage
            .get_items("jobs")
            .expect("items")
            .into_iter()
            .map(|item| item.uuid)
            .collect();
        assert_eq!(uuids, ["a", "b"]);
    }

    #[test]
    fn damaged_record_before_intact_ones_is_reported() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.log");

        let mut storage = LogStorage::open(&path).expect("open");
        for uuid in ["a", "b", "c"] {
            storage.push("jobs", &Item::persistent(uuid, "payload", 5.0)).expect("push");
        }
        storage.close().expect("close");

        // Flip a payload byte of the first record.
        let mut bytes = fs::read(&path).expect("read");
        let first_body = STORE_HEADER_SIZE + RECORD_HEADER_SIZE;
        let first_len = u32::from_le_bytes(
            bytes[STORE_HEADER_SIZE..STORE_HEADER_SIZE + 4]
                .try_into()
                .expect("len"),
        ) as usize;
        bytes[first_body + first_len - 1] ^= 0xFF;
        fs::write(&path, &bytes).expect("write");

        assert!(matches!(LogStorage::open(&path), Err(Error::Corrupt(_))));
        assert_eq!(fs::metadata(&path).expect("meta").len(), bytes.len() as u64);
    }

    #[test]
    fn compaction_reclaims_space_and_keeps_order() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.log");
        let config = StorageConfig::new(&path).with_compact_on_open(false);

        let mut storage = LogStorage::open_with_config(&config).expect("open");
        for i in 0..10 {
            storage
                .push("jobs", &Item::persistent(format!("id-{i}"), vec![b'x'; 100], 10.0))
                .expect("push");
        }
        let doomed: Vec<String> = (0..10).filter(|i| i % 2 == 0).map(|i| format!("id-{i}")).collect();
        let doomed: Vec<&str> = doomed.iter().map(String::as_str).collect();
        storage.delete_items(&doomed).expect("delete");
        storage.update_items_ttl(&[("id-3", 1.5)]).expect("update");

        let stats = storage.compact().expect("compact");
        assert_eq!(stats.records_before, 16);
        assert_eq!(stats.live_items, 5);
        assert!(stats.bytes_after < stats.bytes_before);
        assert_eq!(storage.size_bytes(), stats.bytes_after);
        assert!(!temp_path(&path).exists());

        // Appends after compaction land after the rewritten records.
        storage.push("jobs", &Item::persistent("late", "z", 1.0)).expect("push");
        storage.close().expect("close");

        let storage = LogStorage::open_with_config(&config).expect("reopen");
        let items = storage.get_items("jobs").expect("items");
        let uuids: Vec<_> = items.iter().map(|item| item.uuid.as_str()).collect();
        assert_eq!(uuids, ["id-1", "id-3", "id-5", "id-7", "id-9", "late"]);
        assert_eq!(items[1].ttl, 1.5);
    }

    #[test]
    fn open_compacts_by_default() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.log");

        let mut storage = LogStorage::open(&path).expect("open");
        storage.push("jobs", &Item::persistent("a", vec![0u8; 512], 5.0)).expect("push");
        storage.delete_items(&["a"]).expect("delete");
        storage.close().expect("close");
        assert!(fs::metadata(&path).expect("meta").len() > STORE_HEADER_SIZE as u64);

        let storage = LogStorage::open(&path).expect("reopen");
        assert_eq!(storage.size_bytes(), STORE_HEADER_SIZE as u64);
        assert_eq!(fs::metadata(&path).expect("meta").len(), STORE_HEADER_SIZE as u64);
    }

    #[test]
    fn unknown_ids_do_not_grow_the_log() {
        let (_dir, mut storage) = fresh();
        let before = storage.size_bytes();
        storage.delete_items(&["ghost"]).expect("delete");
        storage.update_items_ttl(&[("ghost", 1.0)]).expect("update");
        assert_eq!(storage.size_bytes(), before);
    }

    #[test]
    fn sequence_continues_after_reopen() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("store.log");

        let mut storage = LogStorage::open(&path).expect("open");
        storage.push("jobs", &Item::persistent("a", "1", 5.0)).expect("push");
        storage.push("jobs", &Item::persistent("b", "2", 5.0)).expect("push");
        storage.close().expect("close");

        let mut storage = LogStorage::open(&path).expect("reopen");
        storage.push("jobs", &Item::persistent("c", "3", 5.0)).expect("push");
        let uuids: Vec<_> = storage
            .get_items("jobs")
            .expect("items")
            .into_iter()
            .map(|item| item.uuid)
            .collect();
        assert_eq!(uuids, ["a", "b", "c"]);
    }
}
