//! Bounded most-recently-used cache of resolved tree lookups.
//!
//! Descending the tree for every offset or line query is O(log n); typing
//! and line-by-line reads hit the same node over and over, so the buffer
//! keeps the last resolution(s) around. Entries are only trustworthy until
//! the next structural change: `validate` drops everything at or past an
//! edit point, and the buffer evicts an entry eagerly when its node is
//! freed (arena slots are recycled, so a stale index could otherwise come
//! back to life as a different node).

use crate::tree::{NodeIdx, RbTree};

#[derive(Debug, Clone, Copy)]
pub(crate) struct CacheEntry {
    pub node: NodeIdx,
    /// Document offset at which the node's piece begins.
    pub node_start_offset: usize,
    /// 1-based line number on which the node's piece begins; only present
    /// for entries recorded by line lookups.
    pub node_start_line_number: Option<usize>,
}

#[derive(Debug)]
pub(crate) struct SearchCache {
    limit: usize,
    entries: Vec<CacheEntry>,
}

impl SearchCache {
    pub fn new(limit: usize) -> Self {
        SearchCache {
            limit,
            entries: Vec::new(),
        }
    }

    /// Entry whose piece spans `offset` (end inclusive, so an append at
    /// the piece's end still hits).
    pub fn get(&self, offset: usize, tree: &RbTree) -> Option<CacheEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| {
                e.node_start_offset <= offset
                    && e.node_start_offset + tree[e.node].piece.length >= offset
            })
            .copied()
    }

    /// Entry whose piece contains the requested 1-based line.
    pub fn get2(&self, line_number: usize, tree: &RbTree) -> Option<CacheEntry> {
        self.entries
            .iter()
            .rev()
            .find(|e| match e.node_start_line_number {
                Some(start) => {
                    start < line_number
                        && start + tree[e.node].piece.line_feed_cnt >= line_number
                }
                None => false,
            })
            .copied()
    }

    pub fn set(&mut self, entry: CacheEntry) {
        if self.entries.len() >= self.limit {
            self.entries.remove(0);
        }
        self.entries.push(entry);
    }

    /// Drop entries that an edit at `offset` may have shifted. Entries
    /// strictly before the edit keep their start offsets and survive.
    pub fn validate(&mut self, offset: usize) {
        self.entries.retain(|e| e.node_start_offset < offset);
    }

    /// Drop any entry referencing `node`; called when the node is freed.
    pub fn evict(&mut self, node: NodeIdx) {
        self.entries.retain(|e| e.node != node);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferCursor;
    use crate::tree::{Piece, SENTINEL};

    fn tree_with_one_piece(len: usize, lf: usize) -> (RbTree, NodeIdx) {
        let mut tree = RbTree::new();
        let piece = Piece::new(
            1,
            BufferCursor::new(0, 0),
            BufferCursor::new(lf, 0),
            lf,
            len,
        );
        let node = tree.insert_right(SENTINEL, piece);
        (tree, node)
    }

    #[test]
    fn test_get_by_offset_span() {
        let (tree, node) = tree_with_one_piece(10, 0);
        let mut cache = SearchCache::new(1);
        cache.set(CacheEntry {
            node,
            node_start_offset: 5,
            node_start_line_number: None,
        });
        assert!(cache.get(4, &tree).is_none());
        assert!(cache.get(5, &tree).is_some());
        // end inclusive
        assert!(cache.get(15, &tree).is_some());
        assert!(cache.get(16, &tree).is_none());
    }

    #[test]
    fn test_get2_requires_line_entry() {
        let (tree, node) = tree_with_one_piece(10, 3);
        let mut cache = SearchCache::new(2);
        cache.set(CacheEntry {
            node,
            node_start_offset: 0,
            node_start_line_number: None,
        });
        assert!(cache.get2(2, &tree).is_none());
        cache.set(CacheEntry {
            node,
            node_start_offset: 0,
            node_start_line_number: Some(1),
        });
        assert!(cache.get2(2, &tree).is_some());
        assert!(cache.get2(4, &tree).is_some());
        assert!(cache.get2(5, &tree).is_none());
        // entry line itself is not covered: start < line required
        assert!(cache.get2(1, &tree).is_none());
    }

    #[test]
    fn test_limit_evicts_oldest() {
        let (tree, node) = tree_with_one_piece(10, 0);
        let mut cache = SearchCache::new(1);
        cache.set(CacheEntry {
            node,
            node_start_offset: 0,
            node_start_line_number: None,
        });
        cache.set(CacheEntry {
            node,
            node_start_offset: 20,
            node_start_line_number: None,
        });
        assert!(cache.get(0, &tree).is_none());
        assert!(cache.get(20, &tree).is_some());
    }

    #[test]
    fn test_validate_drops_entries_at_or_past_edit() {
        let (tree, node) = tree_with_one_piece(10, 0);
        let mut cache = SearchCache::new(4);
        cache.set(CacheEntry {
            node,
            node_start_offset: 3,
            node_start_line_number: None,
        });
        cache.validate(3);
        assert!(cache.get(3, &tree).is_none());

        cache.set(CacheEntry {
            node,
            node_start_offset: 3,
            node_start_line_number: None,
        });
        cache.validate(4);
        assert!(cache.get(3, &tree).is_some());
    }

    #[test]
    fn test_evict_by_node() {
        let (tree, node) = tree_with_one_piece(10, 0);
        let mut cache = SearchCache::new(4);
        cache.set(CacheEntry {
            node,
            node_start_offset: 0,
            node_start_line_number: None,
        });
        cache.evict(node);
        assert!(cache.get(0, &tree).is_none());
    }
}
