use crate::primitives::slab::Allocator;
use crate::storage::node::{Array, NodeType, ParentSlot};
use crate::types::{Ref, Result, StrataError};

use super::ArrayBlob;

/// One standalone [`ArrayBlob`] per element; a zero slot is null.
#[derive(Debug)]
pub struct ArrayBigBlobs {
    refs: Array,
    max_chunk_size: usize,
}

impl ArrayBigBlobs {
    /// Allocates an empty leaf using the chunk limit from the allocator options.
    pub fn create(alloc: &mut dyn Allocator) -> Result<Self> {
        Ok(Self {
            refs: Array::create_empty(alloc, NodeType::HasRefs, false)?,
            max_chunk_size: alloc.options().max_blob_chunk_size,
        })
    }

    /// Attaches to the leaf at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        let refs = Array::from_ref(alloc, ref_)?;
        if !refs.has_refs() {
            return Err(StrataError::Corruption("big blob leaf must hold refs"));
        }
        Ok(Self {
            refs,
            max_chunk_size: alloc.options().max_blob_chunk_size,
        })
    }

    /// Chunk limit passed on to the blobs this leaf creates or rewrites.
    pub fn with_max_chunk_size(mut self, bytes: usize) -> Self {
        self.max_chunk_size = bytes.max(1);
        self
    }

    /// Sets the slot this leaf's ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.refs.set_parent(Some(slot));
        self
    }

    /// Ref of the leaf node.
    pub fn ref_(&self) -> Ref {
        self.refs.ref_()
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.refs.len()
    }

    /// Returns true when the leaf holds no elements.
    pub fn is_empty(&self) -> bool {
        self.refs.is_empty()
    }

    /// Whether element `ndx` is null.
    pub fn is_null(&self, alloc: &dyn Allocator, ndx: usize) -> Result<bool> {
        Ok(self.refs.get(alloc, ndx)? == 0)
    }

    fn blob(&self, alloc: &dyn Allocator, ndx: usize) -> Result<Option<ArrayBlob>> {
        let ref_ = self.refs.get_as_ref(alloc, ndx)?;
        if ref_.is_null() {
            return Ok(None);
        }
        Ok(Some(
            ArrayBlob::from_ref(alloc, ref_)?
                .with_max_chunk_size(self.max_chunk_size)
                .with_parent(ParentSlot::new(self.refs.ref_(), ndx)),
        ))
    }

    /// Copies element `ndx` out, or `None` for null.
    pub fn get(&self, alloc: &dyn Allocator, ndx: usize) -> Result<Option<Vec<u8>>> {
        self.blob(alloc, ndx)?.map(|blob| blob.get(alloc)).transpose()
    }

    fn new_blob(&self, alloc: &mut dyn Allocator, data: &[u8]) -> Result<Ref> {
        let mut blob = ArrayBlob::create(alloc)?.with_max_chunk_size(self.max_chunk_size);
        blob.append(alloc, data)?;
        Ok(blob.ref_())
    }

    /// Inserts `value` before element `ndx`.
    pub fn insert(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<&[u8]>) -> Result<()> {
        if ndx > self.len() {
            return Err(StrataError::Invalid("insert position out of range"));
        }
        let ref_ = match value {
            Some(data) => self.new_blob(alloc, data)?,
            None => Ref::NULL,
        };
        self.refs.insert(alloc, ndx, ref_.to_value())
    }

    /// Appends `value`.
    pub fn add(&mut self, alloc: &mut dyn Allocator, value: Option<&[u8]>) -> Result<()> {
        self.insert(alloc, self.len(), value)
    }

    /// Overwrites element `ndx`, reusing the existing blob's nodes when present.
    pub fn set(&mut self, alloc: &mut dyn Allocator, ndx: usize, value: Option<&[u8]>) -> Result<()> {
        self.refs.copy_on_write(alloc)?;
        match (self.blob(alloc, ndx)?, value) {
            (Some(mut blob), Some(data)) => {
                let size = blob.blob_size(alloc)?;
                blob.replace(alloc, 0, size, data)
            }
            (Some(blob), None) => {
                blob.destroy(alloc)?;
                self.refs.set(alloc, ndx, 0)
            }
            (None, Some(data)) => {
                let ref_ = self.new_blob(alloc, data)?;
                self.refs.set_as_ref(alloc, ndx, ref_)
            }
            (None, None) => Ok(()),
        }
    }

    /// Removes element `ndx`, freeing its blob.
    pub fn erase(&mut self, alloc: &mut dyn Allocator, ndx: usize) -> Result<()> {
        if let Some(blob) = self.blob(alloc, ndx)? {
            blob.destroy(alloc)?;
        }
        self.refs.erase(alloc, ndx)
    }

    /// Drops every element from `new_size` on, freeing their blobs.
    pub fn truncate(&mut self, alloc: &mut dyn Allocator, new_size: usize) -> Result<()> {
        self.refs.truncate_and_destroy_children(alloc, new_size)
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
            if self.get(alloc, ndx)?.as_deref() == value {
                return Ok(Some(ndx));
            }
        }
        Ok(None)
    }

    /// Frees the leaf and every blob.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.refs.destroy_deep(alloc)
    }
}
