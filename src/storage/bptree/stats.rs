use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};

/// Snapshot of column statistics at a point in time.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct BptreeStatsSnapshot {
    /// Number of full leaves split by an insert
    pub leaf_splits: u64,
    /// Number of inner nodes split after gaining a child
    pub inner_splits: u64,
    /// Number of times the root was replaced by a new parent
    pub root_grows: u64,
    /// Number of times a single-child root was replaced by its child
    pub root_collapses: u64,
    /// Number of emptied nodes removed by an erase
    pub node_removals: u64,
    /// Number of compact inner nodes rewritten with an offsets array
    pub compact_conversions: u64,
}

/// Structural edit counters for one column.
#[derive(Default, Debug)]
pub struct BptreeStats {
    leaf_splits: AtomicU64,
    inner_splits: AtomicU64,
    root_grows: AtomicU64,
    root_collapses: AtomicU64,
    node_removals: AtomicU64,
    compact_conversions: AtomicU64,
}

impl BptreeStats {
    /// Captures every counter.
    pub fn snapshot(&self) -> BptreeStatsSnapshot {
        BptreeStatsSnapshot {
            leaf_splits: self.leaf_splits.load(AtomicOrdering::Relaxed),
            inner_splits: self.inner_splits.load(AtomicOrdering::Relaxed),
            root_grows: self.root_grows.load(AtomicOrdering::Relaxed),
            root_collapses: self.root_collapses.load(AtomicOrdering::Relaxed),
            node_removals: self.node_removals.load(AtomicOrdering::Relaxed),
            compact_conversions: self.compact_conversions.load(AtomicOrdering::Relaxed),
        }
    }

    pub(crate) fn inc_leaf_splits(&self) {
        self.leaf_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_inner_splits(&self) {
        self.inner_splits.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_grows(&self) {
        self.root_grows.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_root_collapses(&self) {
        self.root_collapses.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_node_removals(&self) {
        self.node_removals.fetch_add(1, AtomicOrdering::Relaxed);
    }

    pub(crate) fn inc_compact_conversions(&self) {
        self.compact_conversions.fetch_add(1, AtomicOrdering::Relaxed);
    }
}
