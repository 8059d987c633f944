//! Segment replay
//!
//! Folds the records of one or more segment files into the minimal
//! key-to-record state: sets overwrite, removals delete. End of stream
//! terminates one file's replay normally; any other decode failure aborts
//! with an error naming the offending file.

use crate::codec::{read_record, ChangeRecord};
use duracache_common::Result;
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Fold one segment file into `state`.
pub fn read_segment<V: DeserializeOwned>(
    path: &Path,
    state: &mut HashMap<String, ChangeRecord<V>>,
) -> Result<()> {
    let mut reader = BufReader::new(File::open(path)?);
    let mut records = 0usize;
    while let Some(record) = read_record::<_, V>(&mut reader, path)? {
        if record.is_set {
            state.insert(record.item_id.clone(), record);
        } else {
            state.remove(&record.item_id);
        }
        records += 1;
    }
    debug!(file = %path.display(), records, "replayed segment");
    Ok(())
}

/// Replay `paths` in order and return the minimal surviving state.
pub fn replay<V: DeserializeOwned>(
    paths: &[PathBuf],
) -> Result<HashMap<String, ChangeRecord<V>>> {
    let mut state = HashMap::new();
    for path in paths {
        read_segment(path, &mut state)?;
    }
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::segment::SegmentWriter;
    use tempfile::tempdir;

    #[test]
    fn test_sets_overwrite_and_removes_delete() {
        let dir = tempdir().unwrap();
        let mut seg = SegmentWriter::open(dir.path()).unwrap();
        seg.append(&ChangeRecord::set("a", 1u64, vec![], None)).unwrap();
        seg.append(&ChangeRecord::set("a", 2u64, vec![], None)).unwrap();
        seg.append(&ChangeRecord::set("b", 3u64, vec![], None)).unwrap();
        seg.append(&ChangeRecord::<u64>::remove("b")).unwrap();
        let (path, _) = seg.close().unwrap();

        let state = replay::<u64>(&[path]).unwrap();
        assert_eq!(state.len(), 1);
        assert_eq!(state["a"].value, Some(2));
    }

    #[test]
    fn test_removal_payload_is_ignored() {
        // A removal record whose payload carries stale fields must still be
        // a pure removal.
        let dir = tempdir().unwrap();
        let mut seg = SegmentWriter::open(dir.path()).unwrap();
        seg.append(&ChangeRecord::set("a", 1u64, vec!["g".into()], None))
            .unwrap();
        let mut removal = ChangeRecord::set("a", 9u64, vec!["g".into()], None);
        removal.is_set = false;
        seg.append(&removal).unwrap();
        let (path, _) = seg.close().unwrap();

        let state = replay::<u64>(&[path]).unwrap();
        assert!(state.is_empty());
    }

    #[test]
    fn test_later_files_override_earlier() {
        let dir = tempdir().unwrap();
        let mut first = SegmentWriter::open(dir.path()).unwrap();
        first.append(&ChangeRecord::set("k", 1u64, vec![], None)).unwrap();
        let (p1, _) = first.close().unwrap();

        let mut second = SegmentWriter::open(dir.path()).unwrap();
        second.append(&ChangeRecord::set("k", 2u64, vec![], None)).unwrap();
        let (p2, _) = second.close().unwrap();

        let state = replay::<u64>(&[p1, p2]).unwrap();
        assert_eq!(state["k"].value, Some(2));
    }

    #[test]
    fn test_corrupt_file_aborts_replay() {
        let dir = tempdir().unwrap();
        let mut seg = SegmentWriter::open(dir.path()).unwrap();
        seg.append(&ChangeRecord::set("a", 1u64, vec![], None)).unwrap();
        let (path, len) = seg.close().unwrap();

        // Truncate mid-record
        let file = std::fs::OpenOptions::new().write(true).open(&path).unwrap();
        file.set_len(len - 2).unwrap();

        let err = replay::<u64>(&[path.clone()]).unwrap_err();
        assert!(err.to_string().contains(path.to_str().unwrap()));
    }
}
