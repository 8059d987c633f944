//! Offline collector
//!
//! One collector per cache instance. In batched mode mutations are noted in
//! an in-memory collection keyed by item id (duplicates collapse) and a
//! periodic drain reads the live cache state and appends one record per
//! pending key. In synchronous mode every mutation is written immediately.
//! Compaction folds all segments into a streamlined snapshot behind a
//! rename protocol that is recoverable at any crash point.
//!
//! Lock order: rewrite, then file, then collection. The engine lock is only
//! ever taken between file acquisitions by the drain, never the other way
//! around.

use crate::cache::Cache;
use duracache_common::{DumpInterval, Error, Result};
use duracache_log::codec::ChangeRecord;
use duracache_log::dir::{
    self, has_prefix, OLD_REWRITE_PREFIX, REWRITE_PREFIX, TMP_REWRITE_PREFIX,
};
use duracache_log::reader;
use duracache_log::segment::{now_millis, SegmentWriter};
use parking_lot::{Mutex, RwLock};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, error, info, warn};

// Which keys have pending mutations; live state is read at drain time so
// the latest value always wins.
struct CollectionEntry {
    is_set: bool,
}

/// Captures one instance's mutations and maintains its on-disk log.
pub struct Collector {
    instance_id: String,
    dir: PathBuf,
    mode: DumpInterval,
    write_limit_mib: Option<u64>,
    collection: Mutex<HashMap<String, CollectionEntry>>,
    writer: Mutex<Option<SegmentWriter>>,
    rewrite_lock: Mutex<()>,
}

impl Collector {
    /// Open a collector over `dir`, creating a fresh active segment.
    pub fn open(
        instance_id: impl Into<String>,
        dir: PathBuf,
        mode: DumpInterval,
        write_limit_mib: Option<u64>,
    ) -> Result<Self> {
        let writer = SegmentWriter::open(&dir)?;
        Ok(Self {
            instance_id: instance_id.into(),
            dir,
            mode,
            write_limit_mib,
            collection: Mutex::new(HashMap::new()),
            writer: Mutex::new(Some(writer)),
            rewrite_lock: Mutex::new(()),
        })
    }

    /// Note a pending set for `item_id` (batched mode).
    pub fn note_set(&self, item_id: &str) {
        self.collection
            .lock()
            .insert(item_id.to_string(), CollectionEntry { is_set: true });
    }

    /// Route a removal: written immediately in synchronous mode, noted
    /// otherwise. Invoked from the cache's eviction callbacks, the only
    /// source of removal notifications.
    pub fn note_remove<V: Serialize>(&self, item_id: &str) {
        if self.mode.is_sync() {
            // Errors are logged by write_entity; the callback cannot propagate.
            let _ = self.write_entity(&ChangeRecord::<V>::remove(item_id));
            return;
        }
        self.collection
            .lock()
            .insert(item_id.to_string(), CollectionEntry { is_set: false });
    }

    /// Append one record to the active segment, rotating first when the
    /// segment exceeds the write limit.
    pub fn write_entity<V: Serialize>(&self, record: &ChangeRecord<V>) -> Result<()> {
        let mut guard = self.writer.lock();
        let writer = guard.as_mut().ok_or(Error::Shutdown)?;
        if writer.over_limit(self.write_limit_mib) {
            writer.rotate()?;
        }
        writer.append(record).inspect_err(|e| {
            error!(
                instance = %self.instance_id,
                error = %e,
                "failed to write cache record"
            );
        })
    }

    /// Drain every pending key to disk, reading the live state from `cache`.
    ///
    /// A failed write keeps its entry in the collection for the next drain
    /// (unless a newer note for the same key already replaced it).
    pub fn drain_to_disk<V: Serialize>(&self, cache: &RwLock<Cache<V>>) -> Result<()> {
        let drained = std::mem::take(&mut *self.collection.lock());
        if drained.is_empty() {
            return Ok(());
        }
        let total = drained.len();

        let mut first_err: Option<Error> = None;
        for (item_id, entry) in drained {
            let live = if entry.is_set {
                cache.read().snapshot_item(&item_id)
            } else {
                None
            };
            let result = match live {
                Some((value, group_ids, expiry_time)) => self.write_entity(
                    &ChangeRecord::set(item_id.as_str(), &*value, group_ids, expiry_time),
                ),
                None => self.write_entity(&ChangeRecord::<V>::remove(item_id.as_str())),
            };
            if let Err(e) = result {
                self.collection.lock().entry(item_id).or_insert(entry);
                if first_err.is_none() {
                    first_err = Some(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => {
                debug!(instance = %self.instance_id, records = total, "drained collection");
                Ok(())
            }
        }
    }

    /// Fold every segment of this instance into a streamlined snapshot.
    ///
    /// At most one compaction runs per instance; concurrent calls serialize
    /// on the rewrite lock. Any failure before the rename step deletes the
    /// temporary output and leaves the directory untouched.
    pub fn compact<V: Serialize + DeserializeOwned>(&self) -> Result<()> {
        let _rewrite = self.rewrite_lock.lock();

        // Swap in a fresh active segment so concurrent mutations have a
        // destination while the enumerated files are compacted.
        let mut consumed = {
            let mut guard = self.writer.lock();
            let writer = guard.as_mut().ok_or(Error::Shutdown)?;
            let files = dir::list_segment_files(&self.dir)?;
            let non_snapshot = files
                .iter()
                .filter(|p| !has_prefix(p, REWRITE_PREFIX))
                .count();
            if non_snapshot <= 1 && writer.size() == 0 {
                debug!(instance = %self.instance_id, "nothing to compact");
                return Ok(());
            }
            writer.rotate()?;
            files
        };

        info!(
            instance = %self.instance_id,
            segments = consumed.len(),
            "compacting segments"
        );

        dir::sort_for_replay(&mut consumed);
        let state = reader::replay::<V>(&consumed).inspect_err(|e| {
            error!(instance = %self.instance_id, error = %e, "compaction replay failed");
        })?;

        let mut temp_paths: Vec<PathBuf> = Vec::new();
        if let Err(e) = self.write_snapshot(&state, &mut temp_paths) {
            error!(instance = %self.instance_id, error = %e, "compaction aborted");
            self.discard_temp_files(&temp_paths);
            return Err(e);
        }

        if let Err(e) = self.install_snapshot(&mut consumed, &temp_paths) {
            error!(instance = %self.instance_id, error = %e, "snapshot install failed");
            self.discard_temp_files(&temp_paths);
            return Err(e);
        }

        for path in &consumed {
            if let Err(e) = fs::remove_file(path) {
                error!(
                    instance = %self.instance_id,
                    file = %path.display(),
                    error = %e,
                    "failed to remove compacted segment"
                );
            }
        }

        info!(
            instance = %self.instance_id,
            records = state.len(),
            snapshots = temp_paths.len(),
            "compaction complete"
        );
        Ok(())
    }

    // Stream the minimal state into tmpRewrite files, honoring the write
    // limit. Always produces at least one file, even when the state is
    // empty.
    fn write_snapshot<V: Serialize>(
        &self,
        state: &HashMap<String, ChangeRecord<V>>,
        temp_paths: &mut Vec<PathBuf>,
    ) -> Result<()> {
        let first = self.dir.join(TMP_REWRITE_PREFIX);
        let mut writer = SegmentWriter::open_path(&self.dir, &first)?;
        temp_paths.push(first);

        for record in state.values() {
            if writer.over_limit(self.write_limit_mib) {
                writer.close()?;
                let next = self
                    .dir
                    .join(format!("{TMP_REWRITE_PREFIX}{}", now_millis()));
                writer = SegmentWriter::open_path(&self.dir, &next)?;
                temp_paths.push(next);
            }
            writer.append(record)?;
        }
        writer.close()?;
        Ok(())
    }

    // Commit point: demote existing snapshots to oldRewrite, then promote
    // the temp files to 0Rewrite names whose zero-padded index preserves
    // replay order. Updates `consumed` with the demoted names so cleanup
    // deletes them.
    fn install_snapshot(&self, consumed: &mut [PathBuf], temp_paths: &[PathBuf]) -> Result<()> {
        for (i, path) in consumed.iter_mut().enumerate() {
            if has_prefix(path, REWRITE_PREFIX) {
                let demoted = self.dir.join(format!("{OLD_REWRITE_PREFIX}{i}"));
                fs::rename(path.as_path(), &demoted)?;
                *path = demoted;
            }
        }

        let width = temp_paths.len().to_string().len();
        for (i, tmp) in temp_paths.iter().enumerate() {
            let target = self
                .dir
                .join(format!("{REWRITE_PREFIX}{i:0width$}_{}", now_millis()));
            fs::rename(tmp, &target)?;
        }
        Ok(())
    }

    fn discard_temp_files(&self, temp_paths: &[PathBuf]) {
        for path in temp_paths {
            if let Err(e) = fs::remove_file(path) {
                warn!(
                    file = %path.display(),
                    error = %e,
                    "failed to remove temporary rewrite file"
                );
            }
        }
    }

    /// Close the active segment, deleting it when empty. Further writes
    /// fail with [`Error::Shutdown`].
    pub fn close_active(&self) -> Result<()> {
        let taken = self.writer.lock().take();
        let Some(writer) = taken else {
            return Ok(());
        };
        let (path, len) = writer.close()?;
        if len == 0 {
            fs::remove_file(&path)?;
            debug!(instance = %self.instance_id, "removed empty active segment");
        }
        Ok(())
    }

    /// The instance directory this collector owns.
    pub fn dir(&self) -> &std::path::Path {
        &self.dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{Cache, InstanceConfig};
    use tempfile::tempdir;

    fn open_sync(dir: &std::path::Path) -> Collector {
        Collector::open("test", dir.to_path_buf(), DumpInterval::Sync, None).unwrap()
    }

    fn decoded_state(dir: &std::path::Path) -> HashMap<String, ChangeRecord<String>> {
        let paths = dir::clean_segment_dir(dir).unwrap();
        reader::replay::<String>(&paths).unwrap()
    }

    #[test]
    fn test_sync_write_and_replay() {
        let tmp = tempdir().unwrap();
        let coll = open_sync(tmp.path());
        coll.write_entity(&ChangeRecord::set("a", "1".to_string(), vec![], None))
            .unwrap();
        coll.write_entity(&ChangeRecord::set("b", "2".to_string(), vec![], None))
            .unwrap();
        coll.note_remove::<String>("a");
        coll.close_active().unwrap();

        let state = decoded_state(tmp.path());
        assert_eq!(state.len(), 1);
        assert_eq!(state["b"].value.as_deref(), Some("2"));
    }

    #[test]
    fn test_collection_collapses_duplicates() {
        let tmp = tempdir().unwrap();
        let coll = Collector::open(
            "test",
            tmp.path().to_path_buf(),
            DumpInterval::Every(std::time::Duration::from_secs(60)),
            None,
        )
        .unwrap();

        let cache: RwLock<Cache<String>> = RwLock::new(Cache::new(InstanceConfig::unbounded()));
        cache.write().set("k", "v1".to_string(), &[]);
        coll.note_set("k");
        cache.write().set("k", "v2".to_string(), &[]);
        coll.note_set("k");
        coll.note_remove::<String>("gone");

        coll.drain_to_disk(&cache).unwrap();
        assert!(coll.collection.lock().is_empty());
        coll.close_active().unwrap();

        let state = decoded_state(tmp.path());
        assert_eq!(state.len(), 1);
        // Drain reads live state: the latest value wins
        assert_eq!(state["k"].value.as_deref(), Some("v2"));
    }

    #[test]
    fn test_drain_writes_remove_for_vanished_item() {
        let tmp = tempdir().unwrap();
        let coll = Collector::open(
            "test",
            tmp.path().to_path_buf(),
            DumpInterval::Every(std::time::Duration::from_secs(60)),
            None,
        )
        .unwrap();

        let cache: RwLock<Cache<String>> = RwLock::new(Cache::new(InstanceConfig::unbounded()));
        coll.write_entity(&ChangeRecord::set("k", "v".to_string(), vec![], None))
            .unwrap();
        // Noted as a set, but the item no longer exists in the cache
        coll.note_set("k");
        coll.drain_to_disk(&cache).unwrap();
        coll.close_active().unwrap();

        assert!(decoded_state(tmp.path()).is_empty());
    }

    #[test]
    fn test_compaction_collapses_history() {
        let tmp = tempdir().unwrap();
        let coll = open_sync(tmp.path());
        for i in 0..1000 {
            coll.write_entity(&ChangeRecord::set("k", format!("v{i}"), vec![], None))
                .unwrap();
        }
        coll.note_remove::<String>("k");

        coll.compact::<String>().unwrap();
        coll.close_active().unwrap();

        let files = dir::list_segment_files(tmp.path()).unwrap();
        assert_eq!(files.len(), 1, "only the snapshot should remain: {files:?}");
        assert!(has_prefix(&files[0], REWRITE_PREFIX));
        assert!(decoded_state(tmp.path()).is_empty());
    }

    #[test]
    fn test_compaction_preserves_minimal_state() {
        let tmp = tempdir().unwrap();
        let coll = open_sync(tmp.path());
        coll.write_entity(&ChangeRecord::set(
            "keep",
            "v".to_string(),
            vec!["g".into()],
            None,
        ))
        .unwrap();
        coll.write_entity(&ChangeRecord::set("drop", "x".to_string(), vec![], None))
            .unwrap();
        coll.note_remove::<String>("drop");

        let before = decoded_state(tmp.path());
        coll.compact::<String>().unwrap();
        let after = decoded_state(tmp.path());

        assert_eq!(before.len(), after.len());
        assert_eq!(after["keep"].value.as_deref(), Some("v"));
        assert_eq!(after["keep"].group_ids, vec!["g".to_string()]);
    }

    #[test]
    fn test_compaction_skips_when_nothing_to_do() {
        let tmp = tempdir().unwrap();
        let coll = open_sync(tmp.path());
        coll.compact::<String>().unwrap();

        // Only the untouched active segment remains
        let files = dir::list_segment_files(tmp.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(!has_prefix(&files[0], REWRITE_PREFIX));
    }

    #[test]
    fn test_repeated_compaction_replaces_snapshot() {
        let tmp = tempdir().unwrap();
        let coll = open_sync(tmp.path());
        coll.write_entity(&ChangeRecord::set("a", "1".to_string(), vec![], None))
            .unwrap();
        coll.compact::<String>().unwrap();
        coll.write_entity(&ChangeRecord::set("b", "2".to_string(), vec![], None))
            .unwrap();
        coll.compact::<String>().unwrap();

        let files = dir::list_segment_files(tmp.path()).unwrap();
        let snapshots: Vec<_> = files
            .iter()
            .filter(|p| has_prefix(p, REWRITE_PREFIX))
            .collect();
        assert_eq!(snapshots.len(), 1, "old snapshot must be superseded");
        assert!(
            !files.iter().any(|p| has_prefix(p, OLD_REWRITE_PREFIX)),
            "oldRewrite must be deleted after a successful compaction"
        );

        let state = decoded_state(tmp.path());
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_rotation_on_write_limit() {
        let tmp = tempdir().unwrap();
        let coll = Collector::open("test", tmp.path().to_path_buf(), DumpInterval::Sync, Some(0))
            .unwrap();
        // With a zero limit every append over an empty file forces rotation
        for i in 0..3 {
            coll.write_entity(&ChangeRecord::set(format!("k{i}"), "v".to_string(), vec![], None))
                .unwrap();
        }
        coll.close_active().unwrap();

        let files = dir::list_segment_files(tmp.path()).unwrap();
        assert!(files.len() >= 3, "expected rotated segments, got {files:?}");
        let state = decoded_state(tmp.path());
        assert_eq!(state.len(), 3);
    }

    #[test]
    fn test_writes_fail_after_close() {
        let tmp = tempdir().unwrap();
        let coll = open_sync(tmp.path());
        coll.close_active().unwrap();
        let err = coll
            .write_entity(&ChangeRecord::set("k", "v".to_string(), vec![], None))
            .unwrap_err();
        assert!(matches!(err, Error::Shutdown));
    }
}
