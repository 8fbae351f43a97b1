//! Record Store: the source of truth for location records.
//!
//! Records live in a `DashMap`. Every mutation is appended to the record log
//! and flushed before the in-memory map changes and before the call returns,
//! so index fan-out always happens after the commit. Deleted records stay as
//! tombstones, which keeps identities from ever being reused.

mod error;
mod journal;
mod locks;

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::Mutex;

pub use error::{StoreError, StoreResult};
pub use journal::{LOG_FILE, LogOp, SNAPSHOT_FILE};
pub use locks::IdentityLocks;

use crate::types::{LocationId, LocationRecord, RecordStatus, ValidatedLocation};
use journal::{LogFile, Snapshot};

/// Fields the store needs to create a record.
#[derive(Debug, Clone)]
pub struct NewRecord {
    pub location: ValidatedLocation,
    pub embedding: Option<Vec<f32>>,
    pub embedding_failure: Option<String>,
}

#[derive(Debug)]
pub struct RecordStore {
    records: DashMap<LocationId, LocationRecord>,
    next_id: AtomicU64,
    /// Serialises commits. `None` keeps the store in memory only.
    log: Mutex<Option<LogFile>>,
    dir: Option<PathBuf>,
}

impl RecordStore {
    /// A store without durability, for tests and throwaway engines.
    pub fn in_memory() -> Self {
        Self {
            records: DashMap::new(),
            next_id: AtomicU64::new(1),
            log: Mutex::new(None),
            dir: None,
        }
    }

    /// Opens the store in `dir`, loading the snapshot and replaying the log.
    pub fn open(dir: impl AsRef<Path>) -> StoreResult<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)?;

        let records = DashMap::new();
        let mut next_id = 1u64;

        if let Some(snapshot) = journal::read_snapshot(dir)? {
            next_id = next_id.max(snapshot.next_id);
            for record in snapshot.records {
                records.insert(record.id, record);
            }
        }

        let ops = journal::read_log(dir)?;
        let replayed = ops.len();
        for op in ops {
            match op {
                LogOp::Put { record } => {
                    records.insert(record.id, record);
                }
                LogOp::Delete { id, revision, at } => {
                    if let Some(mut record) = records.get_mut(&id) {
                        record.status = RecordStatus::Deleted;
                        record.revision = revision;
                        record.updated_at = at;
                    }
                }
            }
        }

        let max_seen = records.iter().map(|r| r.key().get()).max().unwrap_or(0);
        next_id = next_id.max(max_seen + 1);

        tracing::info!(
            "record store: opened {} records ({replayed} log entries replayed) from {}",
            records.len(),
            dir.display()
        );

        Ok(Self {
            records,
            next_id: AtomicU64::new(next_id),
            log: Mutex::new(Some(LogFile::open(dir)?)),
            dir: Some(dir.to_path_buf()),
        })
    }

    pub fn data_dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    /// Creates a record and assigns its identity.
    pub fn put(&self, new: NewRecord) -> StoreResult<LocationRecord> {
        let mut log = self.log.lock();
        let id = LocationId::new(self.next_id.load(Ordering::SeqCst))
            .ok_or_else(|| StoreError::Snapshot("identity counter is zero".to_string()))?;

        let now = Utc::now();
        let record = LocationRecord {
            id,
            coordinate: new.location.coordinate,
            tags: new.location.tags,
            description: new.location.description,
            embedding: new.embedding,
            embedding_failure: new.embedding_failure,
            status: RecordStatus::Active,
            revision: 1,
            created_at: now,
            updated_at: now,
        };

        if let Some(file) = log.as_mut() {
            file.append(&LogOp::Put {
                record: record.clone(),
            })?;
        }
        // Only advance once committed so a failed append doesn't burn an id
        self.next_id.fetch_add(1, Ordering::SeqCst);
        self.records.insert(id, record.clone());
        tracing::debug!("record store: created {id}");
        Ok(record)
    }

    /// Active record by identity.
    pub fn get(&self, id: LocationId) -> StoreResult<LocationRecord> {
        self.records
            .get(&id)
            .filter(|r| r.is_active())
            .map(|r| r.clone())
            .ok_or(StoreError::NotFound(id))
    }

    /// Applies `mutate` to the active record `id` and commits the result.
    ///
    /// Identity, status and timestamps are maintained by the store; the
    /// revision is bumped.
    pub fn update<F>(&self, id: LocationId, mutate: F) -> StoreResult<LocationRecord>
    where
        F: FnOnce(&mut LocationRecord),
    {
        let mut log = self.log.lock();
        let current = self.get(id)?;

        let mut next = current.clone();
        mutate(&mut next);
        next.id = current.id;
        next.status = RecordStatus::Active;
        next.created_at = current.created_at;
        next.revision = current.revision + 1;
        next.updated_at = Utc::now();

        if let Some(file) = log.as_mut() {
            file.append(&LogOp::Put {
                record: next.clone(),
            })?;
        }
        self.records.insert(id, next.clone());
        tracing::debug!("record store: updated {id} to revision {}", next.revision);
        Ok(next)
    }

    /// Marks `id` deleted. Returns the tombstoned record.
    pub fn delete(&self, id: LocationId) -> StoreResult<LocationRecord> {
        let mut log = self.log.lock();
        let mut record = self.get(id)?;
        record.status = RecordStatus::Deleted;
        record.revision += 1;
        record.updated_at = Utc::now();

        if let Some(file) = log.as_mut() {
            file.append(&LogOp::Delete {
                id,
                revision: record.revision,
                at: record.updated_at,
            })?;
        }
        self.records.insert(id, record.clone());
        tracing::debug!("record store: deleted {id}");
        Ok(record)
    }

    /// Lazily yields records matching `predicate`, in identity order.
    ///
    /// Identities are captured up front; each record is read when reached, so
    /// changes made while scanning are visible. Call [`Scan::restart`] to run
    /// the scan again.
    pub fn scan<P>(&self, predicate: P) -> Scan<'_, P>
    where
        P: Fn(&LocationRecord) -> bool,
    {
        let mut ids: Vec<LocationId> = self.records.iter().map(|r| *r.key()).collect();
        ids.sort_unstable();
        Scan {
            store: self,
            ids,
            position: 0,
            predicate,
        }
    }

    /// Active records, newest first.
    pub fn list(&self, offset: usize, limit: usize) -> Vec<LocationRecord> {
        let mut active: Vec<LocationRecord> = self
            .records
            .iter()
            .filter(|r| r.is_active())
            .map(|r| r.clone())
            .collect();
        active.sort_by(|a, b| b.id.cmp(&a.id));
        active.into_iter().skip(offset).take(limit).collect()
    }

    pub fn active_count(&self) -> usize {
        self.records.iter().filter(|r| r.is_active()).count()
    }

    /// Records including tombstones.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Log entries written since the last compaction in this process.
    pub fn pending_log_entries(&self) -> usize {
        self.log.lock().as_ref().map_or(0, LogFile::appended)
    }

    /// Rewrites the snapshot from memory and empties the log.
    pub fn compact(&self) -> StoreResult<()> {
        let mut log = self.log.lock();
        let Some(file) = log.as_mut() else {
            return Ok(());
        };

        let mut records: Vec<LocationRecord> =
            self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by_key(|r| r.id);
        let snapshot = Snapshot {
            next_id: self.next_id.load(Ordering::SeqCst),
            records,
        };
        file.compact(&snapshot)?;
        tracing::info!(
            "record store: compacted {} records into {SNAPSHOT_FILE}",
            snapshot.records.len()
        );
        Ok(())
    }
}

/// Restartable, lazy iterator returned by [`RecordStore::scan`].
pub struct Scan<'a, P> {
    store: &'a RecordStore,
    ids: Vec<LocationId>,
    position: usize,
    predicate: P,
}

impl<P> Scan<'_, P> {
    /// Rewinds to the first identity captured when the scan was created.
    pub fn restart(&mut self) {
        self.position = 0;
    }

    /// Identities the scan will visit in total.
    pub fn len_hint(&self) -> usize {
        self.ids.len()
    }
}

impl<P> Iterator for Scan<'_, P>
where
    P: Fn(&LocationRecord) -> bool,
{
    type Item = LocationRecord;

    fn next(&mut self) -> Option<Self::Item> {
        while self.position < self.ids.len() {
            let id = self.ids[self.position];
            self.position += 1;
            if let Some(record) = self.store.records.get(&id) {
                if (self.predicate)(record.value()) {
                    return Some(record.clone());
                }
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::NewLocation;
    use std::io::Write;
    use tempfile::TempDir;

    fn new_record(lat: f64, description: &str) -> NewRecord {
        NewRecord {
            location: NewLocation::new(lat, 127.0)
                .with_description(description)
                .with_tags(["tag"])
                .validate()
                .unwrap(),
            embedding: None,
            embedding_failure: None,
        }
    }

    #[test]
    fn test_crud_in_memory() {
        let store = RecordStore::in_memory();
        let created = store.put(new_record(37.0, "first")).unwrap();
        assert_eq!(created.id.get(), 1);
        assert_eq!(created.revision, 1);

        let updated = store
            .update(created.id, |r| r.description = "changed".to_string())
            .unwrap();
        assert_eq!(updated.revision, 2);
        assert_eq!(store.get(created.id).unwrap().description, "changed");

        store.delete(created.id).unwrap();
        assert!(matches!(store.get(created.id), Err(StoreError::NotFound(_))));
        assert!(matches!(
            store.delete(created.id),
            Err(StoreError::NotFound(_))
        ));
        assert!(matches!(
            store.update(created.id, |_| {}),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_ids_never_reused() {
        let store = RecordStore::in_memory();
        let a = store.put(new_record(1.0, "a")).unwrap();
        store.delete(a.id).unwrap();
        let b = store.put(new_record(2.0, "b")).unwrap();
        assert!(b.id > a.id);
        assert_eq!(store.active_count(), 1);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn test_scan_is_lazy_and_restartable() {
        let store = RecordStore::in_memory();
        for i in 0..5 {
            store.put(new_record(i as f64, "x")).unwrap();
        }
        store.delete(LocationId::new(2).unwrap()).unwrap();

        let mut scan = store.scan(|r| r.is_active());
        let first: Vec<u64> = scan.by_ref().map(|r| r.id.get()).collect();
        assert_eq!(first, vec![1, 3, 4, 5]);
        assert!(scan.next().is_none());

        scan.restart();
        assert_eq!(scan.count(), 4);
    }

    #[test]
    fn test_list_newest_first() {
        let store = RecordStore::in_memory();
        for i in 0..4 {
            store.put(new_record(i as f64, "x")).unwrap();
        }
        let page: Vec<u64> = store.list(1, 2).iter().map(|r| r.id.get()).collect();
        assert_eq!(page, vec![3, 2]);
    }

    #[test]
    fn test_reopen_replays_log() {
        let dir = TempDir::new().unwrap();
        {
            let store = RecordStore::open(dir.path()).unwrap();
            let a = store.put(new_record(10.0, "a")).unwrap();
            store.put(new_record(20.0, "b")).unwrap();
            store
                .update(a.id, |r| r.tags = vec!["new".to_string()])
                .unwrap();
            store.delete(LocationId::new(2).unwrap()).unwrap();
        }

        let store = RecordStore::open(dir.path()).unwrap();
        assert_eq!(store.active_count(), 1);
        let a = store.get(LocationId::new(1).unwrap()).unwrap();
        assert_eq!(a.tags, vec!["new"]);
        assert_eq!(a.revision, 2);

        let c = store.put(new_record(30.0, "c")).unwrap();
        assert_eq!(c.id.get(), 3);
    }

    #[test]
    fn test_compact_then_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let store = RecordStore::open(dir.path()).unwrap();
            for i in 0..3 {
                store.put(new_record(i as f64, "x")).unwrap();
            }
            store.delete(LocationId::new(3).unwrap()).unwrap();
            store.compact().unwrap();
            assert_eq!(store.pending_log_entries(), 0);
            store.put(new_record(50.0, "after")).unwrap();
        }
        assert!(dir.path().join(SNAPSHOT_FILE).exists());

        let store = RecordStore::open(dir.path()).unwrap();
        assert_eq!(store.active_count(), 3);
        assert_eq!(store.len(), 4);
        assert_eq!(store.put(new_record(1.0, "y")).unwrap().id.get(), 5);
    }

    #[test]
    fn test_torn_final_line_is_dropped() {
        let dir = TempDir::new().unwrap();
        {
            let store = RecordStore::open(dir.path()).unwrap();
            store.put(new_record(1.0, "kept")).unwrap();
        }
        {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(dir.path().join(LOG_FILE))
                .unwrap();
            file.write_all(br#"{"op":"put","record":{"id":2"#).unwrap();
        }

        let store = RecordStore::open(dir.path()).unwrap();
        assert_eq!(store.active_count(), 1);
        store.put(new_record(2.0, "next")).unwrap();
        drop(store);

        // The torn bytes were cut, so the log stays readable
        let store = RecordStore::open(dir.path()).unwrap();
        assert_eq!(store.active_count(), 2);
    }

    #[test]
    fn test_corruption_in_the_middle_is_an_error() {
        let dir = TempDir::new().unwrap();
        std::fs::create_dir_all(dir.path()).unwrap();
        let store = RecordStore::open(dir.path()).unwrap();
        store.put(new_record(1.0, "a")).unwrap();
        drop(store);

        let path = dir.path().join(LOG_FILE);
        let content = std::fs::read_to_string(&path).unwrap();
        std::fs::write(&path, format!("garbage\n{content}")).unwrap();

        assert!(matches!(
            RecordStore::open(dir.path()),
            Err(StoreError::CorruptedLog { line: 1, .. })
        ));
    }
}
