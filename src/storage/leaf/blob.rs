use tracing::debug;

use crate::primitives::slab::Allocator;
use crate::storage::node::{Array, NodeType, ParentSlot};
use crate::types::{Ref, Result, StrataError};

/// A byte string stored in one raw node, or as a list of raw chunks once it
/// outgrows the chunk limit.
///
/// The chunked form is a ref node with the context flag set. It only
/// supports appending and full replacement.
#[derive(Debug)]
pub struct ArrayBlob {
    root: Array,
    max_chunk_size: usize,
}

impl ArrayBlob {
    /// Allocates an empty blob using the chunk limit from the allocator options.
    pub fn create(alloc: &mut dyn Allocator) -> Result<Self> {
        Ok(Self {
            root: Array::create_raw(alloc, false, 0)?,
            max_chunk_size: alloc.options().max_blob_chunk_size,
        })
    }

    /// Attaches to the blob at `ref_`.
    pub fn from_ref(alloc: &dyn Allocator, ref_: Ref) -> Result<Self> {
        Ok(Self {
            root: Array::from_ref(alloc, ref_)?,
            max_chunk_size: alloc.options().max_blob_chunk_size,
        })
    }

    /// Caps the size of each chunk.
    pub fn with_max_chunk_size(mut self, bytes: usize) -> Self {
        self.max_chunk_size = bytes.max(1);
        self
    }

    /// Sets the slot this blob's ref is stored in.
    pub fn with_parent(mut self, slot: ParentSlot) -> Self {
        self.root.set_parent(Some(slot));
        self
    }

    /// Ref of the root node.
    pub fn ref_(&self) -> Ref {
        self.root.ref_()
    }

    /// Whether the payload is split into chunks.
    pub fn is_chunked(&self) -> bool {
        self.root.context_flag()
    }

    /// Total payload length in bytes.
    pub fn blob_size(&self, alloc: &dyn Allocator) -> Result<usize> {
        if !self.is_chunked() {
            return Ok(self.root.len());
        }
        let mut total = 0;
        for ndx in 0..self.root.len() {
            total += self.root.child(alloc, ndx)?.len();
        }
        Ok(total)
    }

    /// Returns the run of contiguous bytes starting at `*pos` and advances
    /// `*pos` past it. Returns an empty slice at the end.
    pub fn get_at<'a>(&self, alloc: &'a dyn Allocator, pos: &mut usize) -> Result<&'a [u8]> {
        if !self.is_chunked() {
            let bytes = self.root.raw(alloc)?;
            let start = (*pos).min(bytes.len());
            *pos = bytes.len();
            return Ok(&bytes[start..]);
        }
        let mut chunk_start = 0;
        for ndx in 0..self.root.len() {
            let chunk = self.root.child(alloc, ndx)?;
            let chunk_end = chunk_start + chunk.len();
            if *pos < chunk_end {
                let bytes = chunk.raw(alloc)?;
                let from = *pos - chunk_start;
                *pos = chunk_end;
                return Ok(&bytes[from..]);
            }
            chunk_start = chunk_end;
        }
        Ok(&[])
    }

    /// Copies the whole payload out.
    pub fn get(&self, alloc: &dyn Allocator) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.blob_size(alloc)?);
        let mut pos = 0;
        loop {
            let run = self.get_at(alloc, &mut pos)?;
            if run.is_empty() {
                return Ok(out);
            }
            out.extend_from_slice(run);
        }
    }

    /// Appends `data`.
    pub fn append(&mut self, alloc: &mut dyn Allocator, data: &[u8]) -> Result<()> {
        let size = self.blob_size(alloc)?;
        self.replace(alloc, size, size, data)
    }

    /// Replaces bytes `[begin, end)` with `data`.
    ///
    /// A chunked blob only accepts an append (`begin == end == size`) or a
    /// full replacement (`begin == 0`, `end == size`).
    pub fn replace(
        &mut self,
        alloc: &mut dyn Allocator,
        begin: usize,
        end: usize,
        data: &[u8],
    ) -> Result<()> {
        let size = self.blob_size(alloc)?;
        if begin > end || end > size {
            return Err(StrataError::Invalid("blob range out of bounds"));
        }
        let is_append = begin == size && end == size;
        let is_full = begin == 0 && end == size;
        if self.is_chunked() {
            if is_append {
                return self.append_chunked(alloc, data);
            }
            if is_full {
                return self.rebuild(alloc, data);
            }
            return Err(StrataError::Unsupported("partial replace of a chunked blob"));
        }
        let new_size = size - (end - begin) + data.len();
        if new_size <= self.max_chunk_size {
            self.root.erase_raw(alloc, begin, end)?;
            return self.root.insert_raw(alloc, begin, data);
        }
        if is_append {
            let mut content = self.root.raw(alloc)?.to_vec();
            content.extend_from_slice(data);
            return self.rebuild(alloc, &content);
        }
        if is_full {
            return self.rebuild(alloc, data);
        }
        Err(StrataError::Unsupported("partial replace that outgrows one chunk"))
    }

    /// Empties the blob, returning it to the single-node form.
    pub fn clear(&mut self, alloc: &mut dyn Allocator) -> Result<()> {
        self.rebuild(alloc, &[])
    }

    /// Frees the root and every chunk.
    pub fn destroy(self, alloc: &mut dyn Allocator) -> Result<()> {
        self.root.destroy_deep(alloc)
    }

    fn append_chunked(&mut self, alloc: &mut dyn Allocator, mut data: &[u8]) -> Result<()> {
        self.root.copy_on_write(alloc)?;
        if let Some(last) = self.root.len().checked_sub(1) {
            let mut chunk = self.root.child(alloc, last)?;
            let room = self.max_chunk_size.saturating_sub(chunk.len());
            let take = room.min(data.len());
            if take > 0 {
                let at = chunk.len();
                chunk.insert_raw(alloc, at, &data[..take])?;
                data = &data[take..];
            }
        }
        for piece in data.chunks(self.max_chunk_size) {
            let mut chunk = Array::create_raw(alloc, false, 0)?;
            chunk.insert_raw(alloc, 0, piece)?;
            self.root.add(alloc, chunk.ref_().to_value())?;
        }
        Ok(())
    }

    fn rebuild(&mut self, alloc: &mut dyn Allocator, data: &[u8]) -> Result<()> {
        let mut root = if data.len() <= self.max_chunk_size {
            let mut root = Array::create_raw(alloc, false, 0)?;
            root.insert_raw(alloc, 0, data)?;
            root
        } else {
            let mut root = Array::create_empty(alloc, NodeType::HasRefs, true)?;
            for piece in data.chunks(self.max_chunk_size) {
                let mut chunk = Array::create_raw(alloc, false, 0)?;
                chunk.insert_raw(alloc, 0, piece)?;
                root.add(alloc, chunk.ref_().to_value())?;
            }
            debug!(
                bytes = data.len(),
                chunks = root.len(),
                "blob.chunked"
            );
            root
        };
        root.set_parent(self.root.parent());
        root.update_parent(alloc)?;
        let old = std::mem::replace(&mut self.root, root);
        old.destroy_deep(alloc)
    }
}
