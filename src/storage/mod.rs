//! Node storage built on the slab allocator.
//!
//! Arrays are the only on-disk structure. Everything else, from blob leaves
//! to B+-trees, is a tree of arrays linked through has-refs nodes.

/// B+-trees with array leaves.
///
/// Bottom-up construction plus positional reads and edits over integer leaves.
pub mod bptree;

/// Writing modified trees into a new committed image.
pub mod commit;

/// Packed, Flex and Delta integer encodings.
pub mod compress;

/// Specialized leaves: blobs, strings, nullable integers, backlinks, timestamps.
pub mod leaf;

/// The array node and its header.
pub mod node;

pub use commit::{commit, write_deep, CommitOptions, CommitReport, ImageWriter};
pub use node::{Array, Condition, NodeType, ParentSlot, QueryState};
