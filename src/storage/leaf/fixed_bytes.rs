use crate::primitives::slab::Allocator;
use crate::storage::node::{Array, ParentSlot};
use crate::types::{Ref, Result, StrataError};

/// Fill written into null slots so stray reads stand out in dumps.
const NULL_FILL: u8 = 0xA5;

/// Fixed-size byte values of `N` bytes, nullable.
///
/// Elements are stored in groups of eight: one byte of null bits (bit `i`
/// set means slot `i` is null) followed by eight `N`-byte slots. The last
/// group is cut short after the last element.
#[derive(Debug)]
pub struct ArrayFixedBytes<const N: usize> {
    raw: Array,
}

/// 12-byte object ids.
pub type ArrayObjectId = ArrayFixedBytes<12>;
/// 16-byte UUIDs.
pub type ArrayUuid = ArrayFixedBytes<16>;

impl<const N: usize> ArrayFixedBytes<N> {
    const GROUP: usize = 1 + 8 * N;

    fn byte_len(count: usize) -> usize {
        let rest = count % 8;
        count / 8 * Self::GROUP + if rest > 0 { 1 + rest * N } else { 0 }
    }

    fn count(byte_len: usize) -> usize {
        let rest = byte_len % Self::GROUP;
        byte_len / Self::GROUP * 8 + if rest > 0 { (rest - 1) / N } else { 0 }
    }

    fn null_byte(ndx: usize) -> usize {
        ndx / 8 * Self::GROUP
    }

    fn slot(ndx: usize) -> usize {
        Self::null_byte(ndx) + 1 + ndx % 8 * N
    }

    /// Allocates an empty leaf.
    pub fn create(alloc: &mut dyn Allocator) -> Result<Self> {
        Ok(Self {
            raw: Array::create_raw(alloc, false, 0)?,
        })
    }

    /// Attaches to the leaf at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        let raw = Array::from_ref(alloc, ref_)?;
        let len = raw.len();
        if len != Self::byte_len(Self::count(len)) {
            return Err(StrataError::Corruption("fixed bytes leaf has a torn group"));
        }
        Ok(Self { raw })
    }

    /// Sets the slot this leaf's ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.raw.set_parent(Some(slot));
        self
    }

    /// Ref of the leaf node.
    pub fn ref_(&self) -> Ref {
        self.raw.ref_()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        Self::count(self.raw.len())
    }

    /// Returns true when the leaf holds no elements.
    pub fn is_empty(&self) -> bool {
        self.raw.is_empty()
    }

    fn check_index(&self, ndx: usize) -> Result<()> {
        if ndx >= self.len() {
            return Err(StrataError::Invalid("index out of range"));
        }
        Ok(())
    }

    fn read(bytes: &[u8], ndx: usize) -> Option<[u8; N]> {
        if bytes[Self::null_byte(ndx)] & (1 << (ndx % 8)) != 0 {
            return None;
        }
        let mut value = [0u8; N];
        let at = Self::slot(ndx);
        value.copy_from_slice(&bytes[at..at + N]);
        Some(value)
    }

    fn write(bytes: &mut [u8], ndx: usize, value: Option<&[u8; N]>) {
        let bit = 1u8 << (ndx % 8);
        let at = Self::slot(ndx);
        match value {
            Some(v) => {
                bytes[Self::null_byte(ndx)] &= !bit;
                bytes[at..at + N].copy_from_slice(v);
            }
            None => {
                bytes[Self::null_byte(ndx)] |= bit;
                bytes[at..at + N].fill(NULL_FILL);
            }
        }
    }

    /// Whether element `ndx` is null.
    pub fn is_null(&self, alloc: &dyn Allocator, ndx: usize) -> Result<bool> {
        self.check_index(ndx)?;
        Ok(self.raw.raw(alloc)?[Self::null_byte(ndx)] & (1 << (ndx % 8)) != 0)
    }

    /// Element `ndx`, or `None` for null.
    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> Result<Option<[u8; N]>> {
        self.check_index(ndx)?;
        Ok(Self::read(self.raw.raw(alloc)?, ndx))
    }

    /// Overwrites element `ndx`.
    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<&[u8; N]>) -> Result<()> {
        self.check_index(ndx)?;
        Self::write(self.raw.raw_mut(alloc)?, ndx, value);
        Ok(())
    }

    /// Marks element `ndx` null.
    pub fn set_null(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.set(alloc, ndx, None)
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<&[u8; N]>) -> Result<()> {
        let size = self.len();
        if ndx > size {
            return Err(StrataError::Invalid("insert position out of range"));
        }
        let tail: Vec<Option<[u8; N]>> = {
            let bytes = self.raw.raw(alloc)?;
            (ndx..size).map(|i| Self::read(bytes, i)).collect()
        };
        self.raw.resize_raw(alloc, Self::byte_len(size + 1))?;
        let bytes = self.raw.raw_mut(alloc)?;
        Self::write(bytes, ndx, value);
        for (i, v) in tail.iter().enumerate() {
            Self::write(bytes, ndx + 1 + i, v.as_ref());
        }
        Ok(())
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut dyn Allocator, value: Option<&[u8; N]>) -> Result<()> {
        self.insert(alloc, self.len(), value)
    }

    /// Removes element `ndx`.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.check_index(ndx)?;
        let size = self.len();
        let tail: Vec<Option<[u8; N]>> = {
            let bytes = self.raw.raw(alloc)?;
            (ndx + 1..size).map(|i| Self::read(bytes, i)).collect()
        };
        let bytes = self.raw.raw_mut(alloc)?;
        for (i, v) in tail.iter().enumerate() {
            Self::write(bytes, ndx + i, v.as_ref());
        }
        self.raw.resize_raw(alloc, Self::byte_len(size - 1))
    }

    /// Drops every element from `new_size` on.
    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: usize) -> Result<()> {
        if new_size > self.len() {
            return Err(StrataError::Invalid("truncate beyond current size"));
        }
        self.raw.resize_raw(alloc, Self::byte_len(new_size))
    }

    /// Position of the first element equal to `value` in `[begin, end)`.
    pub fn find_first(
        &self,
        alloc: &dyn Allocator,
        value: Option<&[u8; N]>,
        begin: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        if begin > end || end > self.len() {
            return Err(StrataError::Invalid("range out of bounds"));
        }
        let bytes = self.raw.raw(alloc)?;
        Ok((begin..end).find(|&i| Self::read(bytes, i).as_ref() == value))
    }

    /// Frees the leaf.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.raw.destroy(alloc)
    }
}
