//! Low-level primitives for building the storage engine.
//!
//! Includes byte utilities, bit-stream access, positioned file I/O and the
//! slab allocator that maps refs to memory.

/// Byte-level utilities and encoding/decoding.
///
/// Little-endian helpers and the LEB128 varint codec.
pub mod bytes;

/// Bit-stream reads and writes over byte buffers.
pub mod bits;

/// I/O abstractions and utilities.
///
/// Interfaces for reading/writing committed images.
pub mod io;

/// Ref translation, slab allocation and free-space tracking.
pub mod slab;
