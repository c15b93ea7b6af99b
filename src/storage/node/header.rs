#![forbid(unsafe_code)]
//! The 8-byte node header.
//!
//! | byte | bits | field |
//! |------|------|-------|
//! | 0 | `0x80` | inner B+-tree node |
//! | 0 | `0x40` | has refs |
//! | 0 | `0x20` | context flag |
//! | 0 | `0x18` | width type |
//! | 0 | `0x07` | width class, or encoding id for extended nodes |
//! | 1..4 | | size, 24-bit big-endian |
//! | 4..7 | | capacity in bytes including the header, 24-bit big-endian |
//! | 7 | | reserved |

use core::ops::Range;

use crate::primitives::bytes::fixed::{self, U24_MAX};
use crate::types::{Result, StrataError};

/// Bytes occupied by the header.
pub const HEADER_SIZE: usize = 8;
/// Largest element count a header can record.
pub const MAX_ARRAY_SIZE: usize = U24_MAX;
/// Largest allocation a header can record.
pub const MAX_ARRAY_BYTES: usize = U24_MAX & !7;

const FLAGS: usize = 0;
const SIZE: Range<usize> = 1..4;
const CAPACITY: Range<usize> = 4..7;

const IS_INNER: u8 = 0x80;
const HAS_REFS: u8 = 0x40;
const CONTEXT: u8 = 0x20;
const WTYPE_SHIFT: u8 = 3;
const WTYPE_MASK: u8 = 0x18;
const CLASS_MASK: u8 = 0x07;

/// Element layout recorded in the header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Encoding {
    /// Fields of `width` bits.
    Bits,
    /// Elements of `width` bytes.
    Multiply,
    /// Raw bytes; size counts bytes.
    Ignore,
    /// Uniform-width signed fields behind a sub-header.
    Packed,
    /// Sorted distinct values plus per-element indices.
    Flex,
    /// Minimum value plus unsigned per-element offsets.
    Delta,
}

impl Encoding {
    /// Returns true for the compressed integer encodings.
    pub const fn is_compressed(self) -> bool {
        matches!(self, Encoding::Packed | Encoding::Flex | Encoding::Delta)
    }

    fn wtype(self) -> u8 {
        match self {
            Encoding::Bits => 0,
            Encoding::Multiply => 1,
            Encoding::Ignore => 2,
            Encoding::Packed | Encoding::Flex | Encoding::Delta => 3,
        }
    }

    fn extended_id(self) -> u8 {
        match self {
            Encoding::Packed => 1,
            Encoding::Flex => 2,
            Encoding::Delta => 3,
            _ => 0,
        }
    }

    fn from_extended_id(id: u8) -> Result<Self> {
        match id {
            1 => Ok(Encoding::Packed),
            2 => Ok(Encoding::Flex),
            3 => Ok(Encoding::Delta),
            _ => Err(StrataError::Corruption("unknown node encoding")),
        }
    }
}

/// Encodes a width of 0, 1, 2, 4, 8, 16, 32 or 64 as its 3-bit class.
pub fn width_class(width: u8) -> Result<u8> {
    match width {
        0 => Ok(0),
        1 | 2 | 4 | 8 | 16 | 32 | 64 => Ok(width.trailing_zeros() as u8 + 1),
        _ => Err(StrataError::Invalid("width is not a supported power of two")),
    }
}

/// Decodes a width class.
pub const fn width_from_class(class: u8) -> u8 {
    ((1u16 << class) >> 1) as u8
}

/// Payload bytes for `size` elements, before alignment.
pub fn calc_byte_len(encoding: Encoding, size: usize, width: u8) -> usize {
    match encoding {
        Encoding::Multiply => size * usize::from(width),
        Encoding::Ignore => size,
        _ => (size * usize::from(width)).div_ceil(8),
    }
}

/// Rounds `n` up to a multiple of 8.
pub const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Header plus payload, rounded up to 8 bytes.
pub fn calc_aligned_byte_size(encoding: Encoding, size: usize, width: u8) -> usize {
    HEADER_SIZE + align8(calc_byte_len(encoding, size, width))
}

/// Decoded node header.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct NodeHeader {
    /// Node is an inner B+-tree node.
    pub is_inner_bptree_node: bool,
    /// Elements are refs to child nodes (odd values are tagged integers).
    pub has_refs: bool,
    /// Node-specific flag.
    pub context_flag: bool,
    /// Element layout.
    pub encoding: Encoding,
    /// Element width for plain encodings; zero for compressed ones.
    pub width: u8,
    /// Element count.
    pub size: usize,
    /// Allocation size in bytes, header included.
    pub capacity: usize,
}

impl NodeHeader {
    /// Header for a plain node of `width`-bit fields.
    pub fn plain(width: u8, size: usize) -> Self {
        Self {
            is_inner_bptree_node: false,
            has_refs: false,
            context_flag: false,
            encoding: Encoding::Bits,
            width,
            size,
            capacity: 0,
        }
    }

    /// Decodes the header at the start of `src`.
    pub fn decode(src: &[u8]) -> Result<Self> {
        if src.len() < HEADER_SIZE {
            return Err(StrataError::Corruption("node header truncated"));
        }
        let flags = src[FLAGS];
        let class = flags & CLASS_MASK;
        let (encoding, width) = match (flags & WTYPE_MASK) >> WTYPE_SHIFT {
            0 => (Encoding::Bits, width_from_class(class)),
            1 => (Encoding::Multiply, width_from_class(class)),
            2 => (Encoding::Ignore, width_from_class(class)),
            _ => (Encoding::from_extended_id(class)?, 0),
        };
        let header = Self {
            is_inner_bptree_node: flags & IS_INNER != 0,
            has_refs: flags & HAS_REFS != 0,
            context_flag: flags & CONTEXT != 0,
            encoding,
            width,
            size: fixed::get_u24_be(&src[SIZE])?,
            capacity: fixed::get_u24_be(&src[CAPACITY])?,
        };
        if header.capacity < HEADER_SIZE || header.capacity % 8 != 0 {
            return Err(StrataError::Corruption("node capacity is not a valid size"));
        }
        if !encoding.is_compressed()
            && calc_aligned_byte_size(encoding, header.size, width) > header.capacity
        {
            return Err(StrataError::Corruption("node size exceeds its capacity"));
        }
        Ok(header)
    }

    /// Encodes the header into the first 8 bytes of `dst`.
    pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
        if dst.len() < HEADER_SIZE {
            return Err(StrataError::Invalid("node header buffer too small"));
        }
        let class = if self.encoding.is_compressed() {
            self.encoding.extended_id()
        } else {
            width_class(self.width)?
        };
        let mut flags = (self.encoding.wtype() << WTYPE_SHIFT) | class;
        if self.is_inner_bptree_node {
            flags |= IS_INNER;
        }
        if self.has_refs {
            flags |= HAS_REFS;
        }
        if self.context_flag {
            flags |= CONTEXT;
        }
        dst[FLAGS] = flags;
        fixed::put_u24_be(&mut dst[SIZE], self.size)?;
        fixed::put_u24_be(&mut dst[CAPACITY], self.capacity)?;
        dst[7] = 0;
        Ok(())
    }

    /// Aligned byte size of a plain node with this header.
    pub fn plain_byte_size(&self) -> usize {
        calc_aligned_byte_size(self.encoding, self.size, self.width)
    }
}
