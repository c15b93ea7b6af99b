#![forbid(unsafe_code)]
//! Typed leaf arrays built on plain nodes.
//!
//! Every leaf owns one top node and reaches its children through ref
//! slots, so a relocated child always rewrites its slot in the parent.

/// Raw byte payloads, chunked once they outgrow one node.
pub mod blob;

/// Short strings and binaries packed behind an offsets array.
pub mod small_blobs;

/// Large binaries, one blob node per element.
pub mod big_blobs;

/// Fixed-size values with a per-group null bitmap.
pub mod fixed_bytes;

/// Nullable integers using an in-band sentinel.
pub mod int_null;

/// Reverse links from target objects to their origins.
pub mod backlink;

/// Paired seconds and nanoseconds.
pub mod timestamp;

pub use backlink::{ArrayBacklink, BacklinkEntry, CascadeState};
pub use big_blobs::ArrayBigBlobs;
pub use blob::ArrayBlob;
pub use fixed_bytes::{ArrayFixedBytes, ArrayObjectId, ArrayUuid};
pub use int_null::ArrayIntNull;
pub use small_blobs::{ArraySmallBlobs, ArrayStringLong};
pub use timestamp::{eval_nullable, ArrayTimestamp, Timestamp};
