//! Duracache Log - durable mutation log
//!
//! One log per cache instance: an append-only sequence of change records
//! spread over size-rotated segment files, periodically compacted into a
//! streamlined snapshot and replayed on startup.
//!
//! File naming inside one instance directory:
//! - active/rotated segments are named by millisecond timestamps,
//! - `0Rewrite*` is the finalized output of the last successful compaction
//!   (the leading `0` keeps it first during replay),
//! - `tmpRewrite*` is in-progress compaction output, deleted on recovery,
//! - `oldRewrite*` is the previous snapshot, kept until the new one is
//!   fully installed and preferred over `0Rewrite*` when both survive a
//!   crash.

pub mod codec;
pub mod dir;
pub mod reader;
pub mod segment;

pub use codec::{read_record, write_record, ChangeRecord};
pub use dir::{clean_segment_dir, list_segment_files, sort_for_replay};
pub use segment::SegmentWriter;
