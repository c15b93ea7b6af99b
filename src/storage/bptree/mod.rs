#![forbid(unsafe_code)]

//! B+-trees of array leaves.

/// Bottom-up construction of balanced trees.
pub mod build;
mod column;
mod stats;

pub use build::build;
pub use column::{IntegerColumn, LeafVisitor};
pub use stats::{BptreeStats, BptreeStatsSnapshot};
