//! Array nodes: header layout, element access and search.

/// Array handle, copy-on-write and plain element layout.
pub mod array;
/// Search conditions and match collection.
pub mod find;
/// The 8-byte node header.
pub mod header;

pub use array::{bit_width, width_bounds, Array, NodeType, ParentSlot};
pub use find::{Condition, QueryState};
pub use header::{Encoding, NodeHeader, HEADER_SIZE};
