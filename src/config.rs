// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::{tree::DEFAULT_CAPACITY, Database};
use std::path::{Path, PathBuf};

/// Automatic compaction policy
///
/// Compaction is considered after every commit: the tree qualifies once it
/// has accumulated at least `min_writes` write events since its last
/// compaction *and* the dirt factor (the fraction of the file a compaction
/// could reclaim) reaches `min_dirt_factor`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum AutoCompact {
    /// Never compact automatically
    Disabled,

    /// Compact once both thresholds are met
    Enabled {
        /// Minimum write events since the last compaction
        min_writes: u64,

        /// Minimum dirt factor, in `[0.0, 1.0]`
        min_dirt_factor: f32,
    },
}

impl Default for AutoCompact {
    fn default() -> Self {
        Self::Enabled {
            min_writes: 100,
            min_dirt_factor: 0.25,
        }
    }
}

/// Database configuration builder
#[derive(Clone, Debug)]
pub struct Config {
    /// Data directory; holds exactly one database
    #[doc(hidden)]
    pub path: PathBuf,

    pub(crate) auto_compact: AutoCompact,

    pub(crate) auto_file_sync: bool,

    pub(crate) tree_capacity: usize,

    pub(crate) cache_capacity: usize,
}

impl Config {
    /// Initializes a new config for the database inside `path`.
    ///
    /// The directory is created on open if it does not exist.
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().into(),
            auto_compact: AutoCompact::default(),
            auto_file_sync: false,
            tree_capacity: DEFAULT_CAPACITY,
            cache_capacity: 16_384,
        }
    }

    /// Sets the automatic compaction policy.
    ///
    /// Defaults to enabled with 100 minimum writes and a minimum dirt
    /// factor of 0.25.
    ///
    /// # Panics
    ///
    /// Panics if the dirt factor is outside `[0.0, 1.0]`.
    #[must_use]
    pub fn auto_compact(mut self, policy: AutoCompact) -> Self {
        if let AutoCompact::Enabled {
            min_dirt_factor, ..
        } = policy
        {
            assert!(
                (0.0..=1.0).contains(&min_dirt_factor),
                "dirt factor needs to be in [0.0, 1.0]",
            );
        }

        self.auto_compact = policy;
        self
    }

    /// Sets whether every commit is followed by a datasync before it is
    /// acknowledged.
    ///
    /// Defaults to `false`: committed writes then survive process crashes,
    /// but may be lost on power loss because they sit in OS buffers.
    #[must_use]
    pub fn auto_file_sync(mut self, enabled: bool) -> Self {
        self.auto_file_sync = enabled;
        self
    }

    /// Sets the B-tree branching factor (entries per node).
    ///
    /// Defaults to 32. This is a per-open tuning knob, not a file format
    /// property; the same file can be reopened with a different capacity.
    ///
    /// # Panics
    ///
    /// Panics if the capacity is less than 2.
    #[must_use]
    pub fn tree_capacity(mut self, capacity: usize) -> Self {
        assert!(capacity >= 2, "tree capacity needs to be at least 2");

        self.tree_capacity = capacity;
        self
    }

    /// Sets the node cache capacity, in nodes.
    ///
    /// Defaults to 16384.
    #[must_use]
    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.cache_capacity = capacity;
        self
    }

    /// Opens the database.
    ///
    /// # Errors
    ///
    /// Returns error if an IO error occurred, or if the database file is
    /// already open inside this process.
    pub fn open(self) -> crate::Result<Database> {
        Database::open(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    #[should_panic(expected = "dirt factor")]
    fn config_rejects_bad_dirt_factor() {
        let _ = Config::new("whatever").auto_compact(AutoCompact::Enabled {
            min_writes: 10,
            min_dirt_factor: 1.5,
        });
    }

    #[test]
    #[should_panic(expected = "capacity")]
    fn config_rejects_tiny_capacity() {
        let _ = Config::new("whatever").tree_capacity(1);
    }
}
