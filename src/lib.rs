//! Strata: slab-allocated, copy-on-write array storage.
//!
//! Every structure is a tree of array nodes addressed by [`types::Ref`].
//! Refs below the baseline point into an immutable committed image, refs
//! above it into slabs owned by [`primitives::slab::SlabAlloc`]. Mutations
//! copy committed nodes on write, and [`storage::commit`] appends the
//! modified nodes to a new image.

#![warn(missing_docs)]

pub mod logging;
pub mod options;
pub mod primitives;
pub mod storage;
pub mod types;

pub use options::StorageOptions;
pub use types::{Ref, Result, StrataError};
