// Copyright (c) 2024-present, fjall-rs
// This source code is licensed under both the Apache 2.0 and MIT License
// (found in the LICENSE-* files in the repository)

use crate::node::Node;
use quick_cache::sync::Cache as QuickCache;
use std::sync::Arc;

/// Location of a node: store ID and file offset
///
/// Keyed per store so the nodes of a compaction target never alias the
/// nodes of the live file.
type CacheKey = (u64, u64);

/// Concurrent node cache
///
/// Nodes are immutable once appended, so cached entries never need to be
/// invalidated; they simply age out.
pub struct Cache {
    data: QuickCache<CacheKey, Arc<Node>>,
}

impl Cache {
    /// Creates a new cache holding up to `capacity` nodes.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: QuickCache::new(capacity),
        }
    }

    pub(crate) fn insert(&self, store_id: u64, loc: u64, node: Arc<Node>) {
        self.data.insert((store_id, loc), node);
    }

    pub(crate) fn get(&self, store_id: u64, loc: u64) -> Option<Arc<Node>> {
        self.data.get(&(store_id, loc))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn cache_hit_and_miss() {
        let cache = Cache::with_capacity(100);

        cache.insert(0, 1_024, Arc::new(Node::Tombstone));

        assert!(cache.get(0, 1_024).is_some());
        assert!(cache.get(0, 2_048).is_none());

        // Same offset, different store
        assert!(cache.get(1, 1_024).is_none());
    }
}
