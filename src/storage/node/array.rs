#![forbid(unsafe_code)]
//! Array nodes: the unit of storage every higher structure is built from.
//!
//! An [`Array`] is a handle over one node in the allocator's address space. It
//! caches the decoded header and, for compressed nodes, the compressor that
//! reads the payload. Every mutation copies a read-only node into slab memory
//! first and writes the new ref into the parent slot, so snapshots that still
//! hold the old ref keep seeing the old bytes.
//!
//! Handles do not observe each other. After a structural change to a parent
//! (one that may move it), child handles must be re-derived from the parent.

use tracing::debug;

use crate::primitives::bits::{read_bits, sign_extend, write_bits};
use crate::primitives::slab::Allocator;
use crate::storage::compress::{choose_encoding, plain_width, Compressor, IntegerCompressor};
use crate::types::{MemRef, Ref, Result, StrataError};

use super::find::{Condition, FieldScan, QueryState};
use super::header::{
    align8, calc_aligned_byte_size, calc_byte_len, Encoding, NodeHeader, HEADER_SIZE,
    MAX_ARRAY_BYTES, MAX_ARRAY_SIZE,
};

/// Smallest allocation made for a new writable node.
const INITIAL_CAPACITY: usize = 128;
/// Slack added when a read-only node is copied into slab memory.
const COW_SLACK: usize = 64;

/// Smallest plain width that can store `v`.
///
/// Widths 0 to 4 hold unsigned values; 8 and above are two's complement.
pub fn bit_width(v: i64) -> u8 {
    if (v as u64) >> 4 == 0 {
        const SMALL: [u8; 16] = [0, 1, 2, 2, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4, 4];
        return SMALL[v as usize];
    }
    let v = if v < 0 { !v } else { v };
    if v >> 7 == 0 {
        8
    } else if v >> 15 == 0 {
        16
    } else if v >> 31 == 0 {
        32
    } else {
        64
    }
}

/// Range of values a plain field of `width` bits can hold.
pub const fn width_bounds(width: u8) -> (i64, i64) {
    match width {
        0 => (0, 0),
        1 => (0, 1),
        2 => (0, 3),
        4 => (0, 15),
        8 => (i8::MIN as i64, i8::MAX as i64),
        16 => (i16::MIN as i64, i16::MAX as i64),
        32 => (i32::MIN as i64, i32::MAX as i64),
        _ => (i64::MIN, i64::MAX),
    }
}

fn get_plain(data: &[u8], width: u8, ndx: usize) -> i64 {
    let w = usize::from(width);
    let raw = read_bits(data, ndx * w, w);
    if width >= 8 {
        sign_extend(raw, w)
    } else {
        raw as i64
    }
}

fn set_plain(data: &mut [u8], width: u8, ndx: usize, value: i64) {
    let w = usize::from(width);
    write_bits(data, ndx * w, w, value as u64);
}

/// Slot in a has-refs node that stores a child's ref.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct ParentSlot {
    /// Ref of the parent node.
    pub parent: Ref,
    /// Index of the child within the parent.
    pub ndx: usize,
}

impl ParentSlot {
    /// Slot `ndx` of `parent`.
    pub const fn new(parent: Ref, ndx: usize) -> Self {
        Self { parent, ndx }
    }

    /// Overwrites the slot with `child`.
    ///
    /// The parent must be writable and store 64-bit refs.
    pub fn write(self, alloc: &mut dyn Allocator, child: Ref) -> Result<()> {
        if alloc.is_read_only(self.parent) {
            return Err(StrataError::Invalid(
                "parent is read-only; copy it on write before its children",
            ));
        }
        let mem = alloc.translate(self.parent)?;
        let bytes = alloc.bytes_mut(mem)?;
        let header = NodeHeader::decode(bytes)?;
        if !header.has_refs || header.encoding != Encoding::Bits || header.width != 64 {
            return Err(StrataError::Corruption("parent slot is not a 64-bit ref slot"));
        }
        if self.ndx >= header.size {
            return Err(StrataError::Invalid("parent slot out of range"));
        }
        let at = HEADER_SIZE + self.ndx * 8;
        bytes[at..at + 8].copy_from_slice(&child.to_value().to_le_bytes());
        Ok(())
    }
}

/// Shape of a new node.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum NodeType {
    /// Integers.
    Normal,
    /// Child refs mixed with tagged integers.
    HasRefs,
    /// Inner node of a B+-tree.
    InnerBptreeNode,
}

impl NodeType {
    fn has_refs(self) -> bool {
        !matches!(self, NodeType::Normal)
    }

    fn header(self, context_flag: bool) -> NodeHeader {
        NodeHeader {
            is_inner_bptree_node: self == NodeType::InnerBptreeNode,
            has_refs: self.has_refs(),
            context_flag,
            ..NodeHeader::plain(if self.has_refs() { 64 } else { 0 }, 0)
        }
    }
}

fn initial_capacity(byte_size: usize) -> Result<usize> {
    if byte_size > MAX_ARRAY_BYTES {
        return Err(StrataError::Invalid("array exceeds the largest node size"));
    }
    Ok(byte_size.max(INITIAL_CAPACITY))
}

/// Handle over one node.
#[derive(Debug)]
pub struct Array {
    mem: MemRef,
    header: NodeHeader,
    compressor: Option<Compressor>,
    lbound: i64,
    ubound: i64,
    parent: Option<ParentSlot>,
}

impl Array {
    /// Allocates a node with `size` copies of `value`.
    pub fn create(
        alloc: &mut dyn Allocator,
        node_type: NodeType,
        context_flag: bool,
        size: usize,
        value: i64,
    ) -> Result<Self> {
        if size > MAX_ARRAY_SIZE {
            return Err(StrataError::Invalid("array exceeds the largest element count"));
        }
        let mut header = node_type.header(context_flag);
        if !node_type.has_refs() {
            header.width = bit_width(value);
        }
        header.size = size;
        let byte_size = header.plain_byte_size();
        header.capacity = initial_capacity(byte_size)?;
        let mem = alloc.alloc(header.capacity)?;
        {
            let bytes = alloc.bytes_mut(mem)?;
            bytes[..header.capacity].fill(0);
            header.encode(bytes)?;
            if value != 0 {
                let data = &mut bytes[HEADER_SIZE..header.capacity];
                for ndx in 0..size {
                    set_plain(data, header.width, ndx, value);
                }
            }
        }
        Ok(Self::attached(mem, header, None, width_bounds(header.width)))
    }

    /// Allocates an empty node.
    pub fn create_empty(
        alloc: &mut dyn Allocator,
        node_type: NodeType,
        context_flag: bool,
    ) -> Result<Self> {
        Self::create(alloc, node_type, context_flag, 0, 0)
    }

    /// Allocates a node holding `values`.
    pub fn create_from(
        alloc: &mut dyn Allocator,
        node_type: NodeType,
        values: &[i64],
    ) -> Result<Self> {
        if values.len() > MAX_ARRAY_SIZE {
            return Err(StrataError::Invalid("array exceeds the largest element count"));
        }
        let mut header = node_type.header(false);
        if !node_type.has_refs() {
            header.width = plain_width(values);
        }
        header.size = values.len();
        header.capacity = initial_capacity(header.plain_byte_size())?;
        let mem = alloc.alloc(header.capacity)?;
        {
            let bytes = alloc.bytes_mut(mem)?;
            bytes[..header.capacity].fill(0);
            header.encode(bytes)?;
            let data = &mut bytes[HEADER_SIZE..header.capacity];
            for (ndx, &v) in values.iter().enumerate() {
                set_plain(data, header.width, ndx, v);
            }
        }
        Ok(Self::attached(mem, header, None, width_bounds(header.width)))
    }

    /// Allocates a byte node of `len` zero bytes.
    pub fn create_raw(alloc: &mut dyn Allocator, context_flag: bool, len: usize) -> Result<Self> {
        let header = NodeHeader {
            context_flag,
            encoding: Encoding::Ignore,
            size: len,
            capacity: initial_capacity(calc_aligned_byte_size(Encoding::Ignore, len, 0))?,
            ..NodeHeader::plain(0, 0)
        };
        let mem = alloc.alloc(header.capacity)?;
        let bytes = alloc.bytes_mut(mem)?;
        bytes[..header.capacity].fill(0);
        header.encode(bytes)?;
        Ok(Self::attached(mem, header, None, (0, 0)))
    }

    fn attached(
        mem: MemRef,
        header: NodeHeader,
        compressor: Option<Compressor>,
        (lbound, ubound): (i64, i64),
    ) -> Self {
        Self {
            mem,
            header,
            compressor,
            lbound,
            ubound,
            parent: None,
        }
    }

    /// Attaches to the node at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        let mem = alloc.translate(ref_)?;
        Self::from_mem(alloc, mem)
    }

    /// Attaches to an already translated node.
    pub fn from_mem(alloc: &dyn Allocator, mem: MemRef) -> Result<Self> {
        let bytes = alloc.bytes(mem)?;
        let header = NodeHeader::decode(bytes)?;
        let node = bytes
            .get(..header.capacity)
            .ok_or(StrataError::Corruption("node extends past its region"))?;
        let (compressor, bounds) = if header.encoding.is_compressed() {
            let payload = &node[HEADER_SIZE..];
            let compressor = Compressor::decode(header.encoding, payload)?;
            if HEADER_SIZE + compressor.payload_len(header.size) > header.capacity {
                return Err(StrataError::Corruption("compressed node exceeds its capacity"));
            }
            let bounds = compressor.bounds(payload);
            (Some(compressor), bounds)
        } else {
            (None, width_bounds(header.width))
        };
        Ok(Self::attached(mem, header, compressor, bounds))
    }

    /// Sets the slot this node's ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.parent = Some(slot);
        self
    }

    /// Replaces the parent slot.
    pub fn set_parent(&mut self, slot: Option<ParentSlot>) {
        self.parent = slot;
    }

    /// Parent slot, if any.
    pub fn parent(&self) -> Option<ParentSlot> {
        self.parent
    }

    /// Re-reads the node header, picking up changes made through other handles.
    pub fn refresh(&mut self, alloc: &dyn Allocator) -> Result<()> {
        let parent = self.parent;
        *self = Self::from_mem(alloc, self.mem)?;
        self.parent = parent;
        Ok(())
    }

    /// Ref of the node.
    pub fn ref_(&self) -> Ref {
        self.mem.ref_
    }

    /// Translated location of the node.
    pub fn mem(&self) -> MemRef {
        self.mem
    }

    /// Cached header.
    pub fn header(&self) -> &NodeHeader {
        &self.header
    }

    /// Element count, or byte count for raw nodes.
    pub fn len(&self) -> usize {
        self.header.size
    }

    /// Returns true when the node holds no elements.
    pub fn is_empty(&self) -> bool {
        self.header.size == 0
    }

    /// Plain element width in bits; zero for compressed nodes.
    pub fn width(&self) -> u8 {
        self.header.width
    }

    /// Element layout.
    pub fn encoding(&self) -> Encoding {
        self.header.encoding
    }

    /// Whether the node stores a compressed encoding.
    pub fn is_compressed(&self) -> bool {
        self.compressor.is_some()
    }

    /// Whether elements are child refs.
    pub fn has_refs(&self) -> bool {
        self.header.has_refs
    }

    /// Whether the node is an inner B+-tree node.
    pub fn is_inner_bptree_node(&self) -> bool {
        self.header.is_inner_bptree_node
    }

    /// Node-specific flag.
    pub fn context_flag(&self) -> bool {
        self.header.context_flag
    }

    /// Shape the node was created with.
    pub fn node_type(&self) -> NodeType {
        match (self.header.is_inner_bptree_node, self.header.has_refs) {
            (true, _) => NodeType::InnerBptreeNode,
            (false, true) => NodeType::HasRefs,
            (false, false) => NodeType::Normal,
        }
    }

    /// Smallest and largest value the current layout can hold.
    pub fn bounds(&self) -> (i64, i64) {
        (self.lbound, self.ubound)
    }

    /// Whether the node lives in the committed image.
    pub fn is_read_only(&self, alloc: &dyn Allocator) -> bool {
        alloc.is_read_only(self.mem.ref_)
    }

    /// Bytes the node's content occupies, header included, 8-aligned.
    pub fn byte_size(&self) -> usize {
        match &self.compressor {
            Some(c) => c.node_byte_size(self.header.size),
            None => self.header.plain_byte_size(),
        }
    }

    fn node<'a>(&self, alloc: &'a dyn Allocator) -> Result<&'a [u8]> {
        alloc
            .bytes(self.mem)?
            .get(..self.header.capacity)
            .ok_or(StrataError::Corruption("node extends past its region"))
    }

    fn data<'a>(&self, alloc: &'a dyn Allocator) -> Result<&'a [u8]> {
        Ok(&self.node(alloc)?[HEADER_SIZE..])
    }

    fn data_mut<'a>(&self, alloc: &'a mut dyn Allocator) -> Result<&'a mut [u8]> {
        alloc
            .bytes_mut(self.mem)?
            .get_mut(HEADER_SIZE..self.header.capacity)
            .ok_or(StrataError::Corruption("node extends past its region"))
    }

    fn write_header(&self, alloc: &mut dyn Allocator) -> Result<()> {
        self.header.encode(alloc.bytes_mut(self.mem)?)
    }

    fn check_index(&self, ndx: usize) -> Result<()> {
        if ndx >= self.header.size {
            return Err(StrataError::Invalid("index out of range"));
        }
        Ok(())
    }

    fn check_range(&self, begin: usize, end: usize) -> Result<()> {
        if begin > end || end > self.header.size {
            return Err(StrataError::Invalid("range out of bounds"));
        }
        Ok(())
    }

    fn check_integers(&self) -> Result<()> {
        if self.header.encoding == Encoding::Ignore || self.header.encoding == Encoding::Multiply {
            return Err(StrataError::Unsupported("integer access to a byte node"));
        }
        Ok(())
    }

    fn required_width(&self, value: i64) -> u8 {
        if self.header.has_refs {
            64
        } else {
            bit_width(value)
        }
    }

    /// Writes the node's ref into its parent slot.
    pub fn update_parent(&self, alloc: &mut dyn Allocator) -> Result<()> {
        match self.parent {
            Some(slot) => slot.write(alloc, self.mem.ref_),
            None => Ok(()),
        }
    }

    /// Element `ndx`.
    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> Result<i64> {
        self.check_index(ndx)?;
        self.check_integers()?;
        let data = self.data(alloc)?;
        Ok(match &self.compressor {
            Some(c) => c.get(data, ndx),
            None => get_plain(data, self.header.width, ndx),
        })
    }

    /// Element `ndx` read as a child ref.
    pub fn get_as_ref(&self, alloc: &dyn Allocator, ndx: usize) -> Result<Ref> {
        self.get(alloc, ndx).map(Ref::from_value)
    }

    /// Attaches to the child stored at `ndx`, linked back to this node.
    pub fn child(&self, alloc: &dyn Allocator, ndx: usize) -> Result<Array> {
        let ref_ = self.get_as_ref(alloc, ndx)?;
        if !Ref::is_valid_child(ref_.to_value()) {
            return Err(StrataError::Invalid("slot does not hold a child ref"));
        }
        Ok(Self::from_ref(alloc, ref_)?.with_parent(ParentSlot::new(self.ref_(), ndx)))
    }

    /// Elements `[begin, end)`.
    pub fn get_all(&self, alloc: &dyn Allocator, begin: usize, end: usize) -> Result<Vec<i64>> {
        self.check_range(begin, end)?;
        self.check_integers()?;
        let data = self.data(alloc)?;
        Ok(match &self.compressor {
            Some(c) => c.get_all(data, begin, end),
            None => {
                let mut out = Vec::with_capacity(end - begin);
                out.extend((begin..end).map(|ndx| get_plain(data, self.header.width, ndx)));
                out
            }
        })
    }

    /// Up to eight elements from `ndx`; positions past the end read as zero.
    pub fn get_chunk(&self, alloc: &dyn Allocator, ndx: usize, out: &mut [i64; 8]) -> Result<()> {
        self.check_index(ndx)?;
        self.check_integers()?;
        let data = self.data(alloc)?;
        let size = self.header.size;
        match &self.compressor {
            Some(c) => c.get_chunk(data, ndx, size, out),
            None => {
                for (i, slot) in out.iter_mut().enumerate() {
                    *slot = if ndx + i < size {
                        get_plain(data, self.header.width, ndx + i)
                    } else {
                        0
                    };
                }
            }
        }
        Ok(())
    }

    /// First element.
    pub fn front(&self, alloc: &dyn Allocator) -> Result<i64> {
        self.get(alloc, 0)
    }

    /// Last element.
    pub fn back(&self, alloc: &dyn Allocator) -> Result<i64> {
        let last = self
            .header
            .size
            .checked_sub(1)
            .ok_or(StrataError::Invalid("back of an empty array"))?;
        self.get(alloc, last)
    }

    /// Moves a read-only node into slab memory and relinks the parent.
    ///
    /// Compressed nodes are decompressed on the way. No-op for writable nodes.
    pub fn copy_on_write(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        if !self.is_read_only(alloc) {
            return Ok(());
        }
        if self.compressor.is_some() {
            return self.decompress(alloc);
        }
        let byte_size = self.byte_size();
        let capacity = align8(byte_size + COW_SLACK).min(MAX_ARRAY_BYTES).max(byte_size);
        let content = self
            .node(alloc)?
            .get(..byte_size)
            .ok_or(StrataError::Corruption("node extends past its region"))?
            .to_vec();
        let old = self.mem;
        let mem = alloc.alloc(capacity)?;
        let bytes = alloc.bytes_mut(mem)?;
        bytes[..byte_size].copy_from_slice(&content);
        bytes[byte_size..capacity].fill(0);
        self.mem = mem;
        self.header.capacity = capacity;
        self.write_header(alloc)?;
        alloc.free(old)?;
        self.update_parent(alloc)?;
        debug!(old = old.ref_.0, new = mem.ref_.0, size = byte_size, "node.copy_on_write");
        Ok(())
    }

    fn prepare_plain(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        if self.compressor.is_some() {
            self.decompress(alloc)
        } else {
            self.copy_on_write(alloc)
        }
    }

    /// Makes room for `new_size` elements of `new_width` bits.
    ///
    /// The node must already be writable. Grows capacity by doubling, or to
    /// the exact size when doubling is not enough, and widens existing
    /// elements when the width grows.
    pub fn alloc(&mut self, alloc: &mut dyn Allocator, new_size: usize, new_width: u8) -> Result<()> {
        if self.is_read_only(alloc) || self.compressor.is_some() {
            return Err(StrataError::Invalid("alloc on a node that is not writable plain"));
        }
        if new_size > MAX_ARRAY_SIZE {
            return Err(StrataError::Invalid("array exceeds the largest element count"));
        }
        let new_width = if self.header.encoding == Encoding::Bits {
            new_width.max(self.header.width)
        } else {
            self.header.width
        };
        let needed = calc_aligned_byte_size(self.header.encoding, new_size, new_width);
        if needed > MAX_ARRAY_BYTES {
            return Err(StrataError::Invalid("array exceeds the largest node size"));
        }
        if needed > self.header.capacity {
            let mut capacity = (self.header.capacity * 2).min(MAX_ARRAY_BYTES);
            if capacity < needed {
                capacity = needed;
            }
            let old = self.mem.ref_;
            self.mem = alloc.realloc(self.mem, capacity)?;
            self.header.capacity = capacity;
            self.write_header(alloc)?;
            self.update_parent(alloc)?;
            debug!(old = old.0, new = self.mem.ref_.0, capacity, "node.grow");
        }
        let old_width = self.header.width;
        if new_width != old_width {
            let kept = self.header.size.min(new_size);
            let data = self.data_mut(alloc)?;
            for ndx in (0..kept).rev() {
                let v = get_plain(data, old_width, ndx);
                set_plain(data, new_width, ndx, v);
            }
            self.header.width = new_width;
            (self.lbound, self.ubound) = width_bounds(new_width);
        }
        self.header.size = new_size;
        self.write_header(alloc)
    }

    /// Overwrites element `ndx`.
    ///
    /// Compressed nodes are updated in place when the value fits and the node
    /// is writable; otherwise they are decompressed first.
    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        self.check_index(ndx)?;
        self.check_integers()?;
        if let Some(c) = self.compressor.clone() {
            if !self.is_read_only(alloc) && c.fits(self.data(alloc)?, value) {
                return c.set(self.data_mut(alloc)?, ndx, value);
            }
            self.decompress(alloc)?;
        }
        self.copy_on_write(alloc)?;
        if value < self.lbound || value > self.ubound {
            let width = self.required_width(value);
            self.alloc(alloc, self.header.size, width)?;
        }
        let width = self.header.width;
        set_plain(self.data_mut(alloc)?, width, ndx, value);
        Ok(())
    }

    /// Stores a child ref at `ndx`.
    pub fn set_as_ref(&mut self, alloc: &mut dyn Allocator, ndx: usize, child: Ref) -> Result<()> {
        self.set(alloc, ndx, child.to_value())
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: i64) -> Result<()> {
        let size = self.header.size;
        if ndx > size {
            return Err(StrataError::Invalid("insert position out of range"));
        }
        self.check_integers()?;
        self.prepare_plain(alloc)?;
        let width = self.header.width.max(self.required_width(value));
        self.alloc(alloc, size + 1, width)?;
        let data = self.data_mut(alloc)?;
        for i in (ndx..size).rev() {
            let v = get_plain(data, width, i);
            set_plain(data, width, i + 1, v);
        }
        set_plain(data, width, ndx, value);
        Ok(())
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut dyn Allocator, value: i64) -> Result<()> {
        self.insert(alloc, self.header.size, value)
    }

    /// Removes element `ndx`.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.check_index(ndx)?;
        self.erase_range(alloc, ndx, ndx + 1)
    }

    /// Removes elements `[begin, end)`.
    pub fn erase_range(&mut self, alloc: &mut dyn Allocator, begin: usize, end: usize) -> Result<()> {
        self.check_range(begin, end)?;
        self.check_integers()?;
        if begin == end {
            return Ok(());
        }
        self.prepare_plain(alloc)?;
        let size = self.header.size;
        let width = self.header.width;
        let data = self.data_mut(alloc)?;
        for i in end..size {
            let v = get_plain(data, width, i);
            set_plain(data, width, i - (end - begin), v);
        }
        self.header.size = size - (end - begin);
        self.write_header(alloc)
    }

    /// Copies elements `[begin, end)` so they start at `dest`, as `memmove` would.
    pub fn move_range(
        &mut self,
        alloc: &mut dyn Allocator,
        begin: usize,
        end: usize,
        dest: usize,
    ) -> Result<()> {
        self.check_range(begin, end)?;
        self.check_range(dest, dest + (end - begin))?;
        self.check_integers()?;
        self.prepare_plain(alloc)?;
        let values = self.get_all(alloc, begin, end)?;
        let width = self.header.width;
        let data = self.data_mut(alloc)?;
        for (i, v) in values.into_iter().enumerate() {
            set_plain(data, width, dest + i, v);
        }
        Ok(())
    }

    /// Shrinks the element count to `new_size`, keeping capacity.
    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: usize) -> Result<()> {
        if new_size > self.header.size {
            return Err(StrataError::Invalid("truncate beyond current size"));
        }
        if new_size == self.header.size {
            return Ok(());
        }
        self.prepare_plain(alloc)?;
        self.header.size = new_size;
        self.write_header(alloc)
    }

    /// Truncates, destroying the subtrees of removed child refs.
    pub fn truncate_and_destroy_children(
        &mut self,
        alloc: &mut dyn Allocator,
        new_size: usize,
    ) -> Result<()> {
        if new_size > self.header.size {
            return Err(StrataError::Invalid("truncate beyond current size"));
        }
        if self.header.has_refs {
            for value in self.get_all(alloc, new_size, self.header.size)? {
                if Ref::is_valid_child(value) {
                    Self::destroy_deep_ref(alloc, Ref::from_value(value))?;
                }
            }
        }
        self.truncate(alloc, new_size)
    }

    /// Removes every element.
    pub fn clear(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        self.truncate(alloc, 0)
    }

    /// Removes every element, destroying child subtrees.
    pub fn clear_and_destroy_children(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        self.truncate_and_destroy_children(alloc, 0)
    }

    /// Adds `diff` to every element in `[begin, end)`.
    pub fn adjust(
        &mut self,
        alloc: &mut dyn Allocator,
        begin: usize,
        end: usize,
        diff: i64,
    ) -> Result<()> {
        self.check_range(begin, end)?;
        if diff == 0 {
            return Ok(());
        }
        for ndx in begin..end {
            let v = self.get(alloc, ndx)?;
            self.set(alloc, ndx, v.wrapping_add(diff))?;
        }
        Ok(())
    }

    /// Sets or clears the context flag.
    pub fn set_context_flag(&mut self, alloc: &mut dyn Allocator, flag: bool) -> Result<()> {
        if self.header.context_flag == flag {
            return Ok(());
        }
        self.copy_on_write(alloc)?;
        self.header.context_flag = flag;
        self.write_header(alloc)
    }

    /// Frees this node only.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        alloc.free(self.mem)
    }

    /// Frees this node and every subtree its refs reach.
    pub fn destroy_deep(self, alloc: &mut dyn Allocator) -> Result<()> {
        if self.header.has_refs {
            for value in self.get_all(alloc, 0, self.header.size)? {
                if Ref::is_valid_child(value) {
                    Self::destroy_deep_ref(alloc, Ref::from_value(value))?;
                }
            }
        }
        alloc.free(self.mem)
    }

    /// Frees the subtree rooted at `ref_`.
    pub fn destroy_deep_ref(alloc: &mut dyn Allocator, ref_: Ref) -> Result<()> {
        Self::from_ref(alloc, ref_)?.destroy_deep(alloc)
    }

    /// Copies this node and its subtree into fresh slab memory.
    pub fn clone_deep(&self, alloc: &mut dyn Allocator) -> Result<Ref> {
        if !self.header.has_refs {
            let size = self.byte_size();
            let content = self
                .node(alloc)?
                .get(..size)
                .ok_or(StrataError::Corruption("node extends past its region"))?
                .to_vec();
            let mem = alloc.alloc(size)?;
            let bytes = alloc.bytes_mut(mem)?;
            bytes[..size].copy_from_slice(&content);
            let header = NodeHeader {
                capacity: size,
                ..self.header
            };
            header.encode(bytes)?;
            return Ok(mem.ref_);
        }
        let mut clone = Self::create_empty(alloc, self.node_type(), self.header.context_flag)?;
        match self.clone_children_into(alloc, &mut clone) {
            Ok(()) => Ok(clone.ref_()),
            Err(err) => {
                clone.destroy_deep(alloc)?;
                Err(err)
            }
        }
    }

    fn clone_children_into(&self, alloc: &mut dyn Allocator, clone: &mut Array) -> Result<()> {
        for value in self.get_all(alloc, 0, self.header.size)? {
            let value = if Ref::is_valid_child(value) {
                Self::from_ref(alloc, Ref::from_value(value))?
                    .clone_deep(alloc)?
                    .to_value()
            } else {
                value
            };
            clone.add(alloc, value)?;
        }
        Ok(())
    }

    /// Wrapping sum of `[begin, end)`.
    pub fn sum(&self, alloc: &dyn Allocator, begin: usize, end: usize) -> Result<i64> {
        Ok(self
            .get_all(alloc, begin, end)?
            .into_iter()
            .fold(0i64, i64::wrapping_add))
    }

    fn plain_scan(&self) -> FieldScan {
        FieldScan {
            bit_offset: 0,
            width: usize::from(self.header.width),
            signed: self.header.width >= 8,
            lbound: self.lbound,
            ubound: self.ubound,
        }
    }

    /// Reports elements in `[begin, end)` matching `cond` as `base + ndx`.
    ///
    /// Returns false when `state` reached its limit.
    #[allow(clippy::too_many_arguments)]
    pub fn find_all(
        &self,
        alloc: &dyn Allocator,
        cond: Condition,
        value: i64,
        begin: usize,
        end: usize,
        base: usize,
        state: &mut QueryState,
    ) -> Result<bool> {
        self.check_range(begin, end)?;
        self.check_integers()?;
        let data = self.data(alloc)?;
        Ok(match &self.compressor {
            Some(c) => c.find_all(data, cond, value, begin, end, base, state),
            None => self
                .plain_scan()
                .find_all(data, cond, value, begin, end, base, state),
        })
    }

    /// Index of the first element in `[begin, end)` matching `cond`.
    pub fn find_first(
        &self,
        alloc: &dyn Allocator,
        cond: Condition,
        value: i64,
        begin: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        let mut state = QueryState::with_limit(1);
        self.find_all(alloc, cond, value, begin, end, 0, &mut state)?;
        Ok(state.matches().first().copied())
    }

    /// First position whose element is not less than `value`; elements must be sorted.
    pub fn lower_bound(&self, alloc: &dyn Allocator, value: i64) -> Result<usize> {
        self.partition_point(alloc, |v| v < value)
    }

    /// First position whose element is greater than `value`; elements must be sorted.
    pub fn upper_bound(&self, alloc: &dyn Allocator, value: i64) -> Result<usize> {
        self.partition_point(alloc, |v| v <= value)
    }

    fn partition_point(&self, alloc: &dyn Allocator, pred: impl Fn(i64) -> bool) -> Result<usize> {
        let (mut lo, mut hi) = (0, self.header.size);
        while lo < hi {
            let mid = lo + (hi - lo) / 2;
            if pred(self.get(alloc, mid)?) {
                lo = mid + 1;
            } else {
                hi = mid;
            }
        }
        Ok(lo)
    }

    /// Re-encodes the node with whichever compressed encoding pays off.
    ///
    /// Returns whether the node was compressed.
    pub fn compress(&mut self, alloc: &mut dyn Allocator) -> Result<bool> {
        if self.header.has_refs || self.compressor.is_some() {
            return Ok(false);
        }
        self.check_integers()?;
        let values = self.get_all(alloc, 0, self.header.size)?;
        match choose_encoding(&values) {
            Some(encoding) => {
                self.encode_values(alloc, encoding, &values)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Re-encodes the node with `encoding` regardless of size.
    pub fn try_encode(&mut self, alloc: &mut dyn Allocator, encoding: Encoding) -> Result<()> {
        if self.header.has_refs {
            return Err(StrataError::Unsupported("ref nodes stay plain"));
        }
        if !encoding.is_compressed() {
            return Err(StrataError::Invalid("encoding is not compressed"));
        }
        self.check_integers()?;
        let values = self.get_all(alloc, 0, self.header.size)?;
        self.encode_values(alloc, encoding, &values)
    }

    fn encode_values(
        &mut self,
        alloc: &mut dyn Allocator,
        encoding: Encoding,
        values: &[i64],
    ) -> Result<()> {
        let compressor = Compressor::for_values(encoding, values)?;
        let capacity = compressor.node_byte_size(values.len());
        if capacity > MAX_ARRAY_BYTES {
            return Err(StrataError::Invalid("array exceeds the largest node size"));
        }
        let header = NodeHeader {
            encoding,
            width: 0,
            capacity,
            ..self.header
        };
        let mem = alloc.alloc(capacity)?;
        {
            let bytes = alloc.bytes_mut(mem)?;
            bytes[..capacity].fill(0);
            header.encode(bytes)?;
        }
        let written = alloc
            .bytes_mut(mem)
            .and_then(|bytes| compressor.encode_into(values, &mut bytes[HEADER_SIZE..capacity]));
        if let Err(err) = written {
            alloc.free(mem)?;
            return Err(err);
        }
        let old = self.mem;
        self.mem = mem;
        self.header = header;
        let bounds = compressor.bounds(self.data(alloc)?);
        (self.lbound, self.ubound) = bounds;
        self.compressor = Some(compressor);
        alloc.free(old)?;
        self.update_parent(alloc)?;
        debug!(
            old = old.ref_.0,
            new = mem.ref_.0,
            ?encoding,
            size = header.size,
            bytes = capacity,
            "node.compress"
        );
        Ok(())
    }

    /// Restores the plain encoding into fresh slab memory.
    pub fn decompress(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        if self.compressor.is_none() {
            return Ok(());
        }
        let values = self.get_all(alloc, 0, self.header.size)?;
        let width = plain_width(&values);
        let mut header = NodeHeader {
            encoding: Encoding::Bits,
            width,
            ..self.header
        };
        header.capacity = initial_capacity(header.plain_byte_size())?;
        let mem = alloc.alloc(header.capacity)?;
        {
            let bytes = alloc.bytes_mut(mem)?;
            bytes[..header.capacity].fill(0);
            header.encode(bytes)?;
            let data = &mut bytes[HEADER_SIZE..header.capacity];
            for (ndx, &v) in values.iter().enumerate() {
                set_plain(data, width, ndx, v);
            }
        }
        let old = self.mem;
        self.mem = mem;
        self.header = header;
        self.compressor = None;
        (self.lbound, self.ubound) = width_bounds(width);
        alloc.free(old)?;
        self.update_parent(alloc)?;
        debug!(old = old.ref_.0, new = mem.ref_.0, width, "node.decompress");
        Ok(())
    }

    /// Bytes of a raw node.
    pub fn raw<'a>(&self, alloc: &'a dyn Allocator) -> Result<&'a [u8]> {
        self.check_raw()?;
        let len = self.header.size;
        self.data(alloc)?
            .get(..len)
            .ok_or(StrataError::Corruption("raw node exceeds its capacity"))
    }

    /// Writable bytes of a raw node, copying it on write first.
    pub fn raw_mut<'a>(&mut self, alloc: &'a mut dyn Allocator) -> Result<&'a mut [u8]> {
        self.check_raw()?;
        self.copy_on_write(alloc)?;
        let len = self.header.size;
        Ok(&mut self.data_mut(alloc)?[..len])
    }

    /// Changes the length of a raw node; new bytes are zero.
    pub fn resize_raw(&mut self, alloc: &mut dyn Allocator, new_len: usize) -> Result<()> {
        self.check_raw()?;
        self.copy_on_write(alloc)?;
        let old_len = self.header.size;
        self.alloc(alloc, new_len, 0)?;
        if new_len > old_len {
            self.data_mut(alloc)?[old_len..new_len].fill(0);
        }
        Ok(())
    }

    /// Inserts `bytes` at byte position `pos` of a raw node.
    pub fn insert_raw(&mut self, alloc: &mut dyn Allocator, pos: usize, bytes: &[u8]) -> Result<()> {
        let old_len = self.header.size;
        if pos > old_len {
            return Err(StrataError::Invalid("insert position out of range"));
        }
        self.resize_raw(alloc, old_len + bytes.len())?;
        let data = self.data_mut(alloc)?;
        data.copy_within(pos..old_len, pos + bytes.len());
        data[pos..pos + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Removes bytes `[begin, end)` of a raw node.
    pub fn erase_raw(&mut self, alloc: &mut dyn Allocator, begin: usize, end: usize) -> Result<()> {
        self.check_raw()?;
        self.check_range(begin, end)?;
        let old_len = self.header.size;
        self.copy_on_write(alloc)?;
        self.data_mut(alloc)?.copy_within(end..old_len, begin);
        self.header.size = old_len - (end - begin);
        self.write_header(alloc)
    }

    fn check_raw(&self) -> Result<()> {
        if self.header.encoding != Encoding::Ignore {
            return Err(StrataError::Unsupported("byte access to an integer node"));
        }
        Ok(())
    }

    /// Checks header sanity and, for ref nodes, that every child decodes.
    pub fn verify(&self, alloc: &dyn Allocator) -> Result<()> {
        let stored = NodeHeader::decode(alloc.bytes(self.mem)?)?;
        if stored != self.header {
            return Err(StrataError::Corruption("cached header differs from stored header"));
        }
        if self.byte_size() > self.header.capacity {
            return Err(StrataError::Corruption("node content exceeds its capacity"));
        }
        let payload = calc_byte_len(self.header.encoding, self.header.size, self.header.width);
        if self.compressor.is_none() && HEADER_SIZE + payload > self.header.capacity {
            return Err(StrataError::Corruption("node payload exceeds its capacity"));
        }
        if self.header.has_refs {
            if self.header.encoding != Encoding::Bits || self.header.width != 64 {
                return Err(StrataError::Corruption("ref node is not 64 bits wide"));
            }
            for value in self.get_all(alloc, 0, self.header.size)? {
                if Ref::is_valid_child(value) {
                    NodeHeader::decode(alloc.bytes(alloc.translate(Ref::from_value(value))?)?)?;
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::StorageOptions;
    use crate::primitives::slab::SlabAlloc;

    fn alloc() -> Result<SlabAlloc> {
        SlabAlloc::new(StorageOptions::default().track_allocations(true))
    }

    #[test]
    fn bit_width_matches_width_classes() {
        assert_eq!(bit_width(0), 0);
        assert_eq!(bit_width(1), 1);
        assert_eq!(bit_width(3), 2);
        assert_eq!(bit_width(15), 4);
        assert_eq!(bit_width(16), 8);
        assert_eq!(bit_width(-1), 8);
        assert_eq!(bit_width(127), 8);
        assert_eq!(bit_width(-128), 8);
        assert_eq!(bit_width(128), 16);
        assert_eq!(bit_width(-32769), 32);
        assert_eq!(bit_width(i64::MIN), 64);
        for v in [-300i64, -1, 0, 1, 2, 9, 200, 70_000, i64::MAX] {
            let (lb, ub) = width_bounds(bit_width(v));
            assert!(lb <= v && v <= ub, "{v}");
        }
    }

    #[test]
    fn widening_preserves_existing_values() -> Result<()> {
        let mut alloc = alloc()?;
        let mut arr = Array::create_empty(&mut alloc, NodeType::Normal, false)?;
        let inputs = [1i64, 0, 3, 12, -5, 300, 1 << 40, -7];
        for (i, v) in inputs.iter().enumerate() {
            arr.add(&mut alloc, *v)?;
            assert_eq!(arr.get_all(&alloc, 0, i + 1)?, inputs[..=i].to_vec());
        }
        assert_eq!(arr.width(), 64);
        arr.verify(&alloc)?;
        arr.destroy(&mut alloc)?;
        assert!(alloc.is_all_free());
        Ok(())
    }

    #[test]
    fn insert_erase_and_move_shift_elements() -> Result<()> {
        let mut alloc = alloc()?;
        let mut arr = Array::create_from(&mut alloc, NodeType::Normal, &[10, 20, 30])?;
        arr.insert(&mut alloc, 1, 15)?;
        arr.insert(&mut alloc, 0, 5)?;
        assert_eq!(arr.get_all(&alloc, 0, arr.len())?, vec![5, 10, 15, 20, 30]);
        arr.erase(&mut alloc, 2)?;
        arr.erase_range(&mut alloc, 0, 1)?;
        assert_eq!(arr.get_all(&alloc, 0, arr.len())?, vec![10, 20, 30]);
        arr.move_range(&mut alloc, 1, 3, 0)?;
        assert_eq!(arr.get_all(&alloc, 0, arr.len())?, vec![20, 30, 30]);
        assert!(matches!(arr.get(&alloc, 3), Err(StrataError::Invalid(_))));
        assert!(arr.insert(&mut alloc, 5, 1).is_err());
        arr.destroy(&mut alloc)?;
        Ok(())
    }

    #[test]
    fn growth_doubles_then_fits_exactly() -> Result<()> {
        let mut alloc = alloc()?;
        let mut arr = Array::create(&mut alloc, NodeType::Normal, false, 0, 0)?;
        assert_eq!(arr.header().capacity, INITIAL_CAPACITY);
        for v in 0..20 {
            arr.add(&mut alloc, i64::MAX - v)?;
        }
        assert_eq!(arr.header().capacity, 256);
        assert_eq!(arr.back(&alloc)?, i64::MAX - 19);
        arr.destroy(&mut alloc)?;
        Ok(())
    }

    #[test]
    fn sum_find_and_bounds_helpers() -> Result<()> {
        let mut alloc = alloc()?;
        let values: Vec<i64> = (0..50).map(|i| i * 3 - 20).collect();
        let arr = Array::create_from(&mut alloc, NodeType::Normal, &values)?;
        assert_eq!(arr.sum(&alloc, 0, 50)?, values.iter().sum::<i64>());
        assert_eq!(arr.find_first(&alloc, Condition::Greater, 0, 0, 50)?, Some(7));
        assert_eq!(arr.find_first(&alloc, Condition::Equal, 2, 0, 50)?, None);
        assert_eq!(arr.lower_bound(&alloc, 1)?, 7);
        assert_eq!(arr.upper_bound(&alloc, 1)?, 8);
        assert_eq!(arr.lower_bound(&alloc, 1)?, arr.upper_bound(&alloc, 0)?);
        assert_eq!(arr.upper_bound(&alloc, 1000)?, 50);
        let mut chunk = [0i64; 8];
        arr.get_chunk(&alloc, 46, &mut chunk)?;
        assert_eq!(chunk, [118, 121, 124, 127, 0, 0, 0, 0]);
        Ok(())
    }

    #[test]
    fn compressed_set_stays_in_place_when_it_fits() -> Result<()> {
        let mut alloc = alloc()?;
        let values: Vec<i64> = (0..64).map(|i| 1_000_000 + (i % 5)).collect();
        let mut arr = Array::create_from(&mut alloc, NodeType::Normal, &values)?;
        arr.try_encode(&mut alloc, Encoding::Delta)?;
        let compressed_ref = arr.ref_();
        arr.set(&mut alloc, 3, 1_000_004)?;
        assert_eq!(arr.ref_(), compressed_ref);
        assert!(arr.is_compressed());
        arr.set(&mut alloc, 3, -9)?;
        assert!(!arr.is_compressed());
        assert_ne!(arr.ref_(), compressed_ref);
        assert_eq!(arr.get(&alloc, 3)?, -9);
        assert_eq!(arr.get(&alloc, 4)?, 1_000_004);
        arr.destroy(&mut alloc)?;
        assert!(alloc.is_all_free());
        Ok(())
    }

    #[test]
    fn child_relocation_rewrites_parent_slot() -> Result<()> {
        let mut alloc = alloc()?;
        let child = Array::create(&mut alloc, NodeType::Normal, false, 4, 1)?;
        let mut parent = Array::create_empty(&mut alloc, NodeType::HasRefs, false)?;
        parent.add(&mut alloc, child.ref_().to_value())?;
        parent.add(&mut alloc, 7 << 1 | 1)?;
        let mut child = child.with_parent(ParentSlot::new(parent.ref_(), 0));
        for v in 0..40 {
            child.add(&mut alloc, v << 20)?;
        }
        assert_eq!(parent.get_as_ref(&alloc, 0)?, child.ref_());
        parent.verify(&alloc)?;

        let clone_ref = parent.clone_deep(&mut alloc)?;
        let clone = Array::from_ref(&alloc, clone_ref)?;
        let cloned_child = Array::from_ref(&alloc, clone.get_as_ref(&alloc, 0)?)?;
        assert_ne!(cloned_child.ref_(), child.ref_());
        assert_eq!(
            cloned_child.get_all(&alloc, 0, cloned_child.len())?,
            child.get_all(&alloc, 0, child.len())?
        );
        assert_eq!(clone.get(&alloc, 1)?, 15);
        clone.destroy_deep(&mut alloc)?;
        parent.destroy_deep(&mut alloc)?;
        assert!(alloc.is_all_free());
        Ok(())
    }

    #[test]
    fn raw_nodes_insert_and_erase_bytes() -> Result<()> {
        let mut alloc = alloc()?;
        let mut raw = Array::create_raw(&mut alloc, false, 0)?;
        raw.insert_raw(&mut alloc, 0, b"world")?;
        raw.insert_raw(&mut alloc, 0, b"hello ")?;
        assert_eq!(raw.raw(&alloc)?, b"hello world");
        raw.erase_raw(&mut alloc, 5, 11)?;
        assert_eq!(raw.raw(&alloc)?, b"hello");
        raw.raw_mut(&mut alloc)?[0] = b'j';
        assert_eq!(raw.raw(&alloc)?, b"jello");
        assert!(matches!(raw.get(&alloc, 0), Err(StrataError::Unsupported(_))));
        raw.destroy(&mut alloc)?;
        Ok(())
    }

    #[test]
    fn truncate_and_destroy_children_frees_subtrees() -> Result<()> {
        let mut alloc = alloc()?;
        let mut parent = Array::create_empty(&mut alloc, NodeType::HasRefs, false)?;
        for i in 0..4 {
            let child = Array::create(&mut alloc, NodeType::Normal, false, 3, i)?;
            parent.add(&mut alloc, child.ref_().to_value())?;
        }
        parent.truncate_and_destroy_children(&mut alloc, 1)?;
        assert_eq!(parent.len(), 1);
        assert_eq!(alloc.stats().tracked_allocations, Some(2));
        parent.clear_and_destroy_children(&mut alloc)?;
        parent.destroy(&mut alloc)?;
        assert!(alloc.is_all_free());
        Ok(())
    }
}
