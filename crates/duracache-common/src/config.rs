//! Configuration types for duracache
//!
//! This module defines the persistence and per-instance configuration
//! structures shared across components.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// How mutations reach the on-disk log.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DumpInterval {
    /// Persistence is disabled; no collector is installed.
    Disabled,
    /// Every mutation is written synchronously, no batching.
    Sync,
    /// Mutations are batched in memory and drained on this period.
    Every(Duration),
}

impl Default for DumpInterval {
    fn default() -> Self {
        Self::Disabled
    }
}

impl DumpInterval {
    /// Whether mutations bypass the in-memory collection entirely
    #[must_use]
    pub fn is_sync(&self) -> bool {
        matches!(self, Self::Sync)
    }

    /// The drain period, if batched
    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Every(d) => Some(*d),
            _ => None,
        }
    }
}

/// When segments are folded into a streamlined snapshot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RewriteInterval {
    /// Never compact.
    Disabled,
    /// Compact once at the end of startup replay, then never again.
    OnStartup,
    /// Compact once at shutdown only.
    OnShutdown,
    /// Compact on this period, plus once more at shutdown.
    Every(Duration),
}

impl Default for RewriteInterval {
    fn default() -> Self {
        Self::Disabled
    }
}

impl RewriteInterval {
    /// The compaction period, if periodic
    #[must_use]
    pub fn period(&self) -> Option<Duration> {
        match self {
            Self::Every(d) => Some(*d),
            _ => None,
        }
    }

    /// Whether a final compaction runs during shutdown
    #[must_use]
    pub fn compact_on_shutdown(&self) -> bool {
        matches!(self, Self::OnShutdown | Self::Every(_))
    }
}

/// Persistence configuration for one cache bundle.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct PersistConfig {
    /// Root directory; one subdirectory per instance, named by instance id
    pub root_path: PathBuf,
    /// How mutations reach the log
    pub dump_interval: DumpInterval,
    /// When segments are compacted
    pub rewrite_interval: RewriteInterval,
    /// Segment size limit in MiB before rotation; `None` disables rotation
    pub write_limit_mib: Option<u64>,
}

impl Default for PersistConfig {
    fn default() -> Self {
        Self {
            root_path: PathBuf::from("/var/lib/duracache"),
            dump_interval: DumpInterval::Disabled,
            rewrite_interval: RewriteInterval::Disabled,
            write_limit_mib: Some(64),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dump_interval_helpers() {
        assert!(DumpInterval::Sync.is_sync());
        assert!(!DumpInterval::Disabled.is_sync());
        assert_eq!(
            DumpInterval::Every(Duration::from_secs(5)).period(),
            Some(Duration::from_secs(5))
        );
        assert_eq!(DumpInterval::Sync.period(), None);
    }

    #[test]
    fn test_rewrite_interval_shutdown_rule() {
        assert!(RewriteInterval::OnShutdown.compact_on_shutdown());
        assert!(RewriteInterval::Every(Duration::from_secs(1)).compact_on_shutdown());
        assert!(!RewriteInterval::OnStartup.compact_on_shutdown());
        assert!(!RewriteInterval::Disabled.compact_on_shutdown());
    }

    #[test]
    fn test_persist_config_roundtrip() {
        let cfg = PersistConfig {
            root_path: PathBuf::from("/tmp/cache"),
            dump_interval: DumpInterval::Every(Duration::from_millis(100)),
            rewrite_interval: RewriteInterval::OnStartup,
            write_limit_mib: None,
        };
        let json = serde_json::to_string(&cfg).unwrap();
        let back: PersistConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(back.dump_interval, cfg.dump_interval);
        assert_eq!(back.rewrite_interval, cfg.rewrite_interval);
        assert_eq!(back.write_limit_mib, None);
    }
}
