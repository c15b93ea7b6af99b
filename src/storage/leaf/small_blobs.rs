use crate::primitives::slab::Allocator;
use crate::storage::node::{Array, NodeType, ParentSlot};
use crate::types::file::LEGACY_FORMAT_VERSION;
use crate::types::{Ref, Result, StrataError};

const OFFSETS: usize = 0;
const BLOB: usize = 1;
const NULLS: usize = 2;

/// Variable-length byte strings packed into one buffer.
///
/// The top node holds refs to three children: cumulative end offsets, the
/// concatenated payload, and one null flag per element. Files written with
/// the legacy format store "not null" in the flag array instead of "null".
#[derive(Debug)]
pub struct ArraySmallBlobs {
    top: Array,
    terminated: bool,
}

impl ArraySmallBlobs {
    /// Allocates an empty leaf.
    pub fn create(alloc: &mut dyn Allocator) -> Result<Self> {
        Self::create_with(alloc, false)
    }

    fn create_with(alloc: &mut dyn Allocator, terminated: bool) -> Result<Self> {
        let offsets = Array::create_empty(alloc, NodeType::Normal, false)?;
        let blob = Array::create_raw(alloc, false, 0)?;
        let nulls = Array::create_empty(alloc, NodeType::Normal, false)?;
        let refs = [offsets.ref_(), blob.ref_(), nulls.ref_()].map(Ref::to_value);
        let top = Array::create_from(alloc, NodeType::HasRefs, &refs)?;
        Ok(Self { top, terminated })
    }

    /// Attaches to the leaf at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        Self::from_ref_with(alloc, ref_, false)
    }

    fn from_ref_with(alloc: &dyn Allocator, ref_: Ref, terminated: bool) -> Result<Self> {
        let top = Array::from_ref(alloc, ref_)?;
        if !top.has_refs() || top.len() != 3 {
            return Err(StrataError::Corruption("small blob leaf needs three children"));
        }
        Ok(Self { top, terminated })
    }

    /// Sets the slot this leaf's ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.top.set_parent(Some(slot));
        self
    }

    /// Ref of the top node.
    pub fn ref_(&self) -> Ref {
        self.top.ref_()
    }

    /// Number of elements.
    pub fn len(&self, alloc: &dyn Allocator) -> Result<usize> {
        Ok(self.top.child(alloc, OFFSETS)?.len())
    }

    /// Returns true when the leaf holds no elements.
    pub fn is_empty(&self, alloc: &dyn Allocator) -> Result<bool> {
        Ok(self.len(alloc)? == 0)
    }

    fn legacy(alloc: &dyn Allocator) -> bool {
        alloc.file_format_version() <= LEGACY_FORMAT_VERSION
    }

    fn null_flag(alloc: &dyn Allocator, is_null: bool) -> i64 {
        i64::from(is_null != Self::legacy(alloc))
    }

    fn range(&self, alloc: &dyn Allocator, offsets: &Array, ndx: usize) -> Result<(usize, usize)> {
        let start = match ndx {
            0 => 0,
            _ => offsets.get(alloc, ndx - 1)? as usize,
        };
        Ok((start, offsets.get(alloc, ndx)? as usize))
    }

    /// Whether element `ndx` is null.
    pub fn is_null(&self, alloc: &dyn Allocator, ndx: usize) -> Result<bool> {
        let flag = self.top.child(alloc, NULLS)?.get(alloc, ndx)?;
        Ok((flag != 0) != Self::legacy(alloc))
    }

    /// Element `ndx`, or `None` for null.
    pub fn get<'a>(&self, alloc: &'a dyn Allocator, ndx: usize) -> Result<Option<&'a [u8]>> {
        if self.is_null(alloc, ndx)? {
            return Ok(None);
        }
        let offsets = self.top.child(alloc, OFFSETS)?;
        let (start, mut end) = self.range(alloc, &offsets, ndx)?;
        if self.terminated {
            end = end.saturating_sub(1).max(start);
        }
        let blob = self.top.child(alloc, BLOB)?;
        blob.raw(alloc)?
            .get(start..end)
            .map(Some)
            .ok_or(StrataError::Corruption("offset past end of blob payload"))
    }

    fn encoded(&self, value: Option<&[u8]>) -> Vec<u8> {
        let mut bytes = value.unwrap_or_default().to_vec();
        if self.terminated {
            bytes.push(0);
        }
        bytes
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<&[u8]>) -> Result<()> {
        let size = self.len(alloc)?;
        if ndx > size {
            return Err(StrataError::Invalid("insert position out of range"));
        }
        let bytes = self.encoded(value);
        self.top.copy_on_write(alloc)?;
        let mut offsets = self.top.child(alloc, OFFSETS)?;
        let start = match ndx {
            0 => 0,
            _ => offsets.get(alloc, ndx - 1)?,
        };
        let len = bytes.len() as i64;
        self.top
            .child(alloc, BLOB)?
            .insert_raw(alloc, start as usize, &bytes)?;
        offsets.insert(alloc, ndx, start + len)?;
        offsets.adjust(alloc, ndx + 1, size + 1, len)?;
        let flag = Self::null_flag(alloc, value.is_none());
        self.top.child(alloc, NULLS)?.insert(alloc, ndx, flag)
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut dyn Allocator, value: Option<&[u8]>) -> Result<()> {
        let size = self.len(alloc)?;
        self.insert(alloc, size, value)
    }

    /// Overwrites element `ndx`.
    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<&[u8]>) -> Result<()> {
        let size = self.len(alloc)?;
        if ndx >= size {
            return Err(StrataError::Invalid("index out of range"));
        }
        let bytes = self.encoded(value);
        self.top.copy_on_write(alloc)?;
        let mut offsets = self.top.child(alloc, OFFSETS)?;
        let (start, end) = self.range(alloc, &offsets, ndx)?;
        let mut blob = self.top.child(alloc, BLOB)?;
        blob.erase_raw(alloc, start, end)?;
        blob.insert_raw(alloc, start, &bytes)?;
        let diff = bytes.len() as i64 - (end - start) as i64;
        offsets.adjust(alloc, ndx, size, diff)?;
        let flag = Self::null_flag(alloc, value.is_none());
        self.top.child(alloc, NULLS)?.set(alloc, ndx, flag)
    }

    /// Removes element `ndx`.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        let size = self.len(alloc)?;
        if ndx >= size {
            return Err(StrataError::Invalid("index out of range"));
        }
        self.top.copy_on_write(alloc)?;
        let mut offsets = self.top.child(alloc, OFFSETS)?;
        let (start, end) = self.range(alloc, &offsets, ndx)?;
        self.top.child(alloc, BLOB)?.erase_raw(alloc, start, end)?;
        offsets.erase(alloc, ndx)?;
        offsets.adjust(alloc, ndx, size - 1, -((end - start) as i64))?;
        self.top.child(alloc, NULLS)?.erase(alloc, ndx)
    }

    /// Drops every element from `new_size` on.
    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: usize) -> Result<()> {
        let size = self.len(alloc)?;
        if new_size > size {
            return Err(StrataError::Invalid("truncate beyond current size"));
        }
        if new_size == size {
            return Ok(());
        }
        self.top.copy_on_write(alloc)?;
        let mut offsets = self.top.child(alloc, OFFSETS)?;
        let keep = match new_size {
            0 => 0,
            _ => offsets.get(alloc, new_size - 1)? as usize,
        };
        offsets.truncate(alloc, new_size)?;
        let mut blob = self.top.child(alloc, BLOB)?;
        let blob_len = blob.len();
        blob.erase_raw(alloc, keep, blob_len)?;
        self.top.child(alloc, NULLS)?.truncate(alloc, new_size)
    }

    /// Position of the first element equal to `value` in `[begin, end)`.
    pub fn find_first(
        &self,
        alloc: &dyn Allocator,
        value: Option<&[u8]>,
        begin: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        for ndx in begin..end {
            if self.get(alloc, ndx)? == value {
                return Ok(Some(ndx));
            }
        }
        Ok(None)
    }

    /// Frees the leaf and its children.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.top.destroy_deep(alloc)
    }
}

/// Strings stored as zero-terminated small blobs.
#[derive(Debug)]
pub struct ArrayStringLong {
    inner: ArraySmallBlobs,
}

impl ArrayStringLong {
    /// Allocates an empty leaf.
    pub fn create(alloc: &mut dyn Allocator) -> Result<Self> {
        Ok(Self {
            inner: ArraySmallBlobs::create_with(alloc, true)?,
        })
    }

    /// Attaches to the leaf at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        Ok(Self {
            inner: ArraySmallBlobs::from_ref_with(alloc, ref_, true)?,
        })
    }

    /// Sets the slot this leaf's ref is stored in.
    pub fn with_parent(self, slot: ParentSlot) -> Self {
        Self {
            inner: self.inner.with_parent(slot),
        }
    }

    /// Ref of the top node.
    pub fn ref_(&self) -> Ref {
        self.inner.ref_()
    }

    /// Number of strings.
    pub fn len(&self, alloc: &dyn Allocator) -> Result<usize> {
        self.inner.len(alloc)
    }

    /// Returns true when the leaf holds no strings.
    pub fn is_empty(&self, alloc: &dyn Allocator) -> Result<bool> {
        self.inner.is_empty(alloc)
    }

    /// Whether string `ndx` is null.
    pub fn is_null(&self, alloc: &dyn Allocator, ndx: usize) -> Result<bool> {
        self.inner.is_null(alloc, ndx)
    }

    /// String `ndx`, or `None` for null.
    pub fn get<'a>(&self, alloc: &'a dyn Allocator, ndx: usize) -> Result<Option<&'a str>> {
        self.inner
            .get(alloc, ndx)?
            .map(|bytes| {
                std::str::from_utf8(bytes).map_err(|_| StrataError::Corruption("string is not utf-8"))
            })
            .transpose()
    }

    /// Inserts `value` before string `ndx`.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<&str>) -> Result<()> {
        self.inner.insert(alloc, ndx, value.map(str::as_bytes))
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut dyn Allocator, value: Option<&str>) -> Result<()> {
        self.inner.add(alloc, value.map(str::as_bytes))
    }

    /// Overwrites string `ndx`.
    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<&str>) -> Result<()> {
        self.inner.set(alloc, ndx, value.map(str::as_bytes))
    }

    /// Removes string `ndx`.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        self.inner.erase(alloc, ndx)
    }

    /// Drops every string from `new_size` on.
    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: usize) -> Result<()> {
        self.inner.truncate(alloc, new_size)
    }

    /// Position of the first string equal to `value` in `[begin, end)`.
    pub fn find_first(
        &self,
        alloc: &dyn Allocator,
        value: Option<&str>,
        begin: usize,
        end: usize,
    ) -> Result<Option<usize>> {
        self.inner
            .find_first(alloc, value.map(str::as_bytes), begin, end)
    }

    /// Frees the leaf and its children.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.inner.destroy(alloc)
    }
}
