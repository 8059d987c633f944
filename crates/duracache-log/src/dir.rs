//! Segment directory layout
//!
//! Enumerates and repairs the segment files of one cache instance before
//! replay or compaction consumes them. An interrupted compaction leaves
//! recognizable residue; the cleanup rules here guarantee that replay sees
//! either the pre-compaction or the post-compaction file set, never a mix.

use duracache_common::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Finalized compaction output; the leading `0` keeps it first in replay order.
pub const REWRITE_PREFIX: &str = "0Rewrite";
/// In-progress compaction output; always deleted on recovery.
pub const TMP_REWRITE_PREFIX: &str = "tmpRewrite";
/// Previous snapshot, kept until the new one is fully installed.
pub const OLD_REWRITE_PREFIX: &str = "oldRewrite";

/// List every file (not directory) directly inside `dir`.
pub fn list_segment_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            paths.push(entry.path());
        }
    }
    Ok(paths)
}

/// Whether the file name of `path` starts with `prefix`.
pub fn has_prefix(path: &Path, prefix: &str) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with(prefix))
}

/// Classify and repair the raw file list of one instance directory, deleting
/// interrupted-compaction residue, and return the survivors in replay order.
///
/// Rules:
/// - any `oldRewrite*` present means the last compaction crashed between
///   installing the new snapshot and deleting its inputs; the `oldRewrite*`
///   files are authoritative and every `0Rewrite*` file is deleted,
/// - every `tmpRewrite*` file is deleted unconditionally,
/// - survivors are ordered snapshot first (`0Rewrite*`, or `oldRewrite*`
///   when the rule above applied), then timestamped segments
///   chronologically.
pub fn clean_segment_dir(dir: &Path) -> Result<Vec<PathBuf>> {
    let raw = list_segment_files(dir)?;
    let has_old = raw.iter().any(|p| has_prefix(p, OLD_REWRITE_PREFIX));

    let mut kept = Vec::with_capacity(raw.len());
    for path in raw {
        if has_prefix(&path, TMP_REWRITE_PREFIX) {
            warn!(file = %path.display(), "removing interrupted compaction residue");
            fs::remove_file(&path)?;
            continue;
        }
        if has_old && has_prefix(&path, REWRITE_PREFIX) {
            warn!(file = %path.display(), "removing superseded snapshot, oldRewrite present");
            fs::remove_file(&path)?;
            continue;
        }
        kept.push(path);
    }

    sort_for_replay(&mut kept);
    debug!(dir = %dir.display(), segments = kept.len(), "cleaned segment directory");
    Ok(kept)
}

/// Order paths for replay: snapshots first, then timestamped segments
/// chronologically.
pub fn sort_for_replay(paths: &mut [PathBuf]) {
    paths.sort_by_key(|p| replay_rank(p));
}

/// Sort key giving snapshots precedence over timestamped segments, then
/// lexicographic file-name order within each class.
fn replay_rank(path: &Path) -> (u8, String) {
    let name = path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or_default()
        .to_string();
    let class = if name.starts_with(REWRITE_PREFIX) {
        0
    } else if name.starts_with(OLD_REWRITE_PREFIX) {
        1
    } else {
        2
    };
    (class, name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn touch(dir: &Path, name: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, b"x").unwrap();
        path
    }

    #[test]
    fn test_tmp_files_always_deleted() {
        let dir = tempdir().unwrap();
        touch(dir.path(), "tmpRewrite");
        touch(dir.path(), "tmpRewrite1700000000000");
        let seg = touch(dir.path(), "1700000000001");

        let kept = clean_segment_dir(dir.path()).unwrap();
        assert_eq!(kept, vec![seg.clone()]);
        assert!(!dir.path().join("tmpRewrite").exists());
        assert!(!dir.path().join("tmpRewrite1700000000000").exists());
        assert!(seg.exists());
    }

    #[test]
    fn test_old_rewrite_supersedes_zero_rewrite() {
        let dir = tempdir().unwrap();
        let zero = touch(dir.path(), "0Rewrite0_1700000000000");
        let old = touch(dir.path(), "oldRewrite0");
        let seg = touch(dir.path(), "1700000000005");

        let kept = clean_segment_dir(dir.path()).unwrap();
        assert_eq!(kept, vec![old.clone(), seg.clone()]);
        assert!(!zero.exists());
        assert!(old.exists());
    }

    #[test]
    fn test_snapshot_ordered_before_segments() {
        let dir = tempdir().unwrap();
        let seg_old = touch(dir.path(), "1700000000001");
        let seg_new = touch(dir.path(), "1700000000002");
        let snap0 = touch(dir.path(), "0Rewrite0_1700000000003");
        let snap1 = touch(dir.path(), "0Rewrite1_1700000000003");

        let kept = clean_segment_dir(dir.path()).unwrap();
        assert_eq!(kept, vec![snap0, snap1, seg_old, seg_new]);
    }

    #[test]
    fn test_empty_directory() {
        let dir = tempdir().unwrap();
        assert!(clean_segment_dir(dir.path()).unwrap().is_empty());
    }

    #[test]
    fn test_directories_are_ignored() {
        let dir = tempdir().unwrap();
        fs::create_dir(dir.path().join("nested")).unwrap();
        let seg = touch(dir.path(), "1700000000001");
        assert_eq!(list_segment_files(dir.path()).unwrap(), vec![seg]);
    }
}
