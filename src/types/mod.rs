#![forbid(unsafe_code)]
//! Identifiers, references and the crate-wide error type.

use std::fmt;

/// Logical offset of a node in the flat address space.
///
/// Offsets below the allocator baseline point into the committed image,
/// offsets at or above it point into mutable slabs. `Ref(0)` is null.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Ref(pub u64);

impl Ref {
    /// The null reference.
    pub const NULL: Ref = Ref(0);

    /// Returns true for the null reference.
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Reinterprets a stored array element as a reference.
    pub const fn from_value(value: i64) -> Self {
        Ref(value as u64)
    }

    /// Returns the reference as it is stored inside a has-refs array.
    pub const fn to_value(self) -> i64 {
        self.0 as i64
    }

    /// Refs are 8-byte aligned; tagged integers stored next to them are odd.
    pub const fn is_valid_child(value: i64) -> bool {
        value != 0 && value & 1 == 0
    }

    /// Byte offset of this reference.
    pub const fn offset(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Physical location of a node: the committed image or one of the slabs.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum Addr {
    /// Byte offset into the committed image.
    Committed(usize),
    /// Slab index and byte offset inside that slab.
    Slab {
        /// Index into the slab table.
        index: usize,
        /// Offset from the slab start.
        offset: usize,
    },
}

/// A translated reference: the logical ref paired with its physical address.
///
/// Produced by allocation and translation and never persisted.
#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct MemRef {
    /// Physical location.
    pub addr: Addr,
    /// Logical reference.
    pub ref_: Ref,
}

impl MemRef {
    /// Pairs an address with its reference.
    pub const fn new(addr: Addr, ref_: Ref) -> Self {
        Self { addr, ref_ }
    }
}

/// Key of an object within a table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ObjKey(pub i64);

/// Key of a column within a table.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct ColKey(pub i64);

/// Key of a table within a group.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct TableKey(pub u32);

/// A link to an object in a specific table.
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug)]
pub struct ObjLink {
    /// Table holding the object.
    pub table: TableKey,
    /// Object key within that table.
    pub key: ObjKey,
}

impl fmt::Display for ObjKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<i64> for ObjKey {
    fn from(value: i64) -> Self {
        ObjKey(value)
    }
}

/// Errors raised by the storage substrate.
#[derive(thiserror::Error, Debug)]
pub enum StrataError {
    /// Underlying file I/O failed.
    #[error("IO: {0}")]
    Io(#[from] std::io::Error),
    /// The allocator could not satisfy a request.
    #[error("out of memory: could not allocate {requested} bytes")]
    OutOfMemory {
        /// Size of the failed request in bytes.
        requested: usize,
    },
    /// A structural invariant does not hold for stored data.
    #[error("corruption: {0}")]
    Corruption(&'static str),
    /// The caller passed an argument that violates an operation's contract.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// The operation is rejected for this node shape.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    /// A null was written to a slot that cannot hold one.
    #[error("value is not nullable")]
    NotNullable,
    /// Configuration could not be parsed or applied.
    #[error("config: {0}")]
    Config(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrataError>;

pub mod file {
    //! Layout of the 24-byte file header that precedes the committed image.

    use core::ops::Range;

    use super::{Ref, Result, StrataError};

    /// Bytes occupied by the file header.
    pub const FILE_HEADER_LEN: usize = 24;
    /// Mnemonic stored at bytes 16..20.
    pub const MNEMONIC: [u8; 4] = *b"T-DB";
    /// Current file format version.
    pub const CURRENT_FORMAT_VERSION: u8 = 2;
    /// Version whose string null flags are stored inverted.
    pub const LEGACY_FORMAT_VERSION: u8 = 1;

    /// Byte offsets for fixed header fields.
    pub mod offsets {
        use core::ops::Range;

        /// First top-ref slot.
        pub const TOP_REF_0: Range<usize> = 0..8;
        /// Second top-ref slot.
        pub const TOP_REF_1: Range<usize> = 8..16;
        /// Mnemonic.
        pub const MNEMONIC: Range<usize> = 16..20;
        /// Version paired with slot 0.
        pub const VERSION_0: usize = 20;
        /// Version paired with slot 1.
        pub const VERSION_1: usize = 21;
        /// Unused.
        pub const RESERVED: usize = 22;
        /// Bit 0 selects the current slot.
        pub const FLAGS: usize = 23;
    }

    const fn slot_range(slot: usize) -> Range<usize> {
        if slot == 0 {
            offsets::TOP_REF_0
        } else {
            offsets::TOP_REF_1
        }
    }

    /// Decoded file header.
    #[derive(Clone, Debug, Eq, PartialEq)]
    pub struct FileHeader {
        /// Both top-ref slots.
        pub top_refs: [Ref; 2],
        /// Format versions paired with each slot.
        pub versions: [u8; 2],
        /// Raw flags byte.
        pub flags: u8,
    }

    impl FileHeader {
        /// Header of an empty store.
        pub fn new(format_version: u8) -> Self {
            Self {
                top_refs: [Ref::NULL; 2],
                versions: [format_version; 2],
                flags: 0,
            }
        }

        /// Index of the slot that holds the current top ref.
        pub fn current_slot(&self) -> usize {
            usize::from(self.flags & 1)
        }

        /// Current top ref.
        pub fn top_ref(&self) -> Ref {
            self.top_refs[self.current_slot()]
        }

        /// Format version of the current slot.
        pub fn format_version(&self) -> u8 {
            self.versions[self.current_slot()]
        }

        /// Writes `top_ref` into the inactive slot without selecting it.
        pub fn stage(&mut self, top_ref: Ref, version: u8) -> usize {
            let slot = 1 - self.current_slot();
            self.top_refs[slot] = top_ref;
            self.versions[slot] = version;
            slot
        }

        /// Makes `slot` the current one.
        pub fn select(&mut self, slot: usize) {
            self.flags = (self.flags & !1) | (slot as u8 & 1);
        }

        /// Encodes the header into the first 24 bytes of `dst`.
        pub fn encode(&self, dst: &mut [u8]) -> Result<()> {
            if dst.len() < FILE_HEADER_LEN {
                return Err(StrataError::Invalid("file header buffer too small"));
            }
            for slot in 0..2 {
                dst[slot_range(slot)].copy_from_slice(&self.top_refs[slot].0.to_le_bytes());
            }
            dst[offsets::MNEMONIC].copy_from_slice(&MNEMONIC);
            dst[offsets::VERSION_0] = self.versions[0];
            dst[offsets::VERSION_1] = self.versions[1];
            dst[offsets::RESERVED] = 0;
            dst[offsets::FLAGS] = self.flags;
            Ok(())
        }

        /// Decodes and validates a header against the buffer it heads.
        pub fn decode(src: &[u8]) -> Result<Self> {
            if src.len() < FILE_HEADER_LEN {
                return Err(StrataError::Corruption("file shorter than header"));
            }
            if src.len() % 8 != 0 {
                return Err(StrataError::Corruption("file size not 8-byte aligned"));
            }
            if src[offsets::MNEMONIC] != MNEMONIC {
                return Err(StrataError::Corruption("bad file mnemonic"));
            }
            let mut top_refs = [Ref::NULL; 2];
            for (slot, top) in top_refs.iter_mut().enumerate() {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(&src[slot_range(slot)]);
                *top = Ref(u64::from_le_bytes(raw));
            }
            let header = Self {
                top_refs,
                versions: [src[offsets::VERSION_0], src[offsets::VERSION_1]],
                flags: src[offsets::FLAGS],
            };
            let version = header.format_version();
            if version != CURRENT_FORMAT_VERSION && version != LEGACY_FORMAT_VERSION {
                return Err(StrataError::Corruption("unsupported file format version"));
            }
            let top = header.top_ref();
            if top.0 % 8 != 0 || top.0 >= src.len() as u64 {
                return Err(StrataError::Corruption("top ref outside file"));
            }
            if !top.is_null() && (top.0 as usize) < FILE_HEADER_LEN {
                return Err(StrataError::Corruption("top ref inside file header"));
            }
            Ok(header)
        }
    }

}
