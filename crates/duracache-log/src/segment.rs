//! Log segment writer
//!
//! Holds the open append-only segment file of one cache instance. Every
//! append flushes the buffer so a crash loses at most the in-flight record.
//! Rotation closes the current file and opens a fresh one named by the
//! current millisecond timestamp; callers serialize rotations through the
//! collector's file lock.

use crate::codec::{write_record, ChangeRecord};
use duracache_common::Result;
use serde::Serialize;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::debug;

/// Append-only writer over one segment file.
pub struct SegmentWriter {
    dir: PathBuf,
    path: PathBuf,
    writer: BufWriter<File>,
    len: u64,
}

impl SegmentWriter {
    /// Open a fresh active segment in `dir`, named by the current
    /// millisecond timestamp. The name is bumped past any existing file so
    /// two rotations within one millisecond still get distinct segments.
    pub fn open(dir: &Path) -> Result<Self> {
        let mut stamp = now_millis();
        let mut path = dir.join(stamp.to_string());
        while path.exists() {
            stamp += 1;
            path = dir.join(stamp.to_string());
        }
        Self::open_path(dir, &path)
    }

    /// Open (create-or-append) a segment at an explicit path. Used by
    /// compaction for `tmpRewrite*` output files.
    pub fn open_path(dir: &Path, path: &Path) -> Result<Self> {
        let file = OpenOptions::new().append(true).create(true).open(path)?;
        let len = file.metadata()?.len();
        debug!(segment = %path.display(), len, "opened segment");
        Ok(Self {
            dir: dir.to_path_buf(),
            path: path.to_path_buf(),
            writer: BufWriter::new(file),
            len,
        })
    }

    /// Encode one record and flush it to disk.
    pub fn append<V: Serialize>(&mut self, record: &ChangeRecord<V>) -> Result<()> {
        write_record(&mut self.writer, record, &self.path)?;
        self.writer.flush()?;
        self.len = self.writer.get_ref().metadata()?.len();
        Ok(())
    }

    /// Current segment size in bytes.
    pub fn size(&self) -> u64 {
        self.len
    }

    /// Path of the segment currently being written.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Whether `size()` exceeds `limit_mib` mebibytes. `None` disables
    /// rotation.
    pub fn over_limit(&self, limit_mib: Option<u64>) -> bool {
        match limit_mib {
            Some(limit) => self.len > limit * 1024 * 1024,
            None => false,
        }
    }

    /// Close the current file and open a fresh timestamp-named segment.
    pub fn rotate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let next = Self::open(&self.dir)?;
        let old = std::mem::replace(self, next);
        debug!(from = %old.path.display(), to = %self.path.display(), "rotated segment");
        Ok(())
    }

    /// Flush and close, returning the segment path and its final size.
    pub fn close(mut self) -> Result<(PathBuf, u64)> {
        self.writer.flush()?;
        Ok((self.path, self.len))
    }
}

/// Milliseconds since the Unix epoch; the segment file namespace.
pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::read_record;
    use std::io::BufReader;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_size() {
        let dir = tempdir().unwrap();
        let mut seg = SegmentWriter::open(dir.path()).unwrap();
        assert_eq!(seg.size(), 0);

        seg.append(&ChangeRecord::set("a", 1u64, vec![], None)).unwrap();
        let after_one = seg.size();
        assert!(after_one > 0);

        seg.append(&ChangeRecord::set("b", 2u64, vec![], None)).unwrap();
        assert!(seg.size() > after_one);
    }

    #[test]
    fn test_records_survive_close() {
        let dir = tempdir().unwrap();
        let mut seg = SegmentWriter::open(dir.path()).unwrap();
        seg.append(&ChangeRecord::set("k", "v".to_string(), vec!["g".into()], None))
            .unwrap();
        let (path, len) = seg.close().unwrap();
        assert!(len > 0);

        let mut reader = BufReader::new(File::open(&path).unwrap());
        let rec: ChangeRecord<String> = read_record(&mut reader, &path).unwrap().unwrap();
        assert_eq!(rec.item_id, "k");
        assert!(read_record::<_, String>(&mut reader, &path).unwrap().is_none());
    }

    #[test]
    fn test_rotate_opens_distinct_file() {
        let dir = tempdir().unwrap();
        let mut seg = SegmentWriter::open(dir.path()).unwrap();
        seg.append(&ChangeRecord::set("a", 1u64, vec![], None)).unwrap();
        let first = seg.path().to_path_buf();

        seg.rotate().unwrap();
        assert_ne!(seg.path(), first.as_path());
        assert_eq!(seg.size(), 0);

        seg.append(&ChangeRecord::set("b", 2u64, vec![], None)).unwrap();
        assert!(first.exists());
        assert_eq!(
            std::fs::read_dir(dir.path()).unwrap().count(),
            2,
            "old and new segments both present"
        );
    }

    #[test]
    fn test_over_limit() {
        let dir = tempdir().unwrap();
        let mut seg = SegmentWriter::open(dir.path()).unwrap();
        assert!(!seg.over_limit(Some(1)));
        assert!(!seg.over_limit(None));

        // A zero limit makes any non-empty segment oversized
        seg.append(&ChangeRecord::set("a", 1u64, vec![], None)).unwrap();
        assert!(seg.over_limit(Some(0)));
        assert!(!seg.over_limit(None));
    }
}
