#![forbid(unsafe_code)]
//! Slab allocator over a committed image.
//!
//! Refs below the baseline address the committed image, which is immutable
//! and may be shared with readers of older snapshots. Refs at or above the
//! baseline live in slabs: owned buffers that extend the address space one
//! after another. The slab table records each slab's end ref so translation
//! is a binary search.

mod freelist;
mod metrics;

use std::ops::Range;
use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde::Serialize;
use tracing::{debug, warn};

pub use freelist::{Chunk, FreeList, Release};
pub use metrics::{AllocMetrics, CounterMetrics, NoopMetrics};

use crate::options::StorageOptions;
use crate::primitives::bytes::fixed;
use crate::primitives::io::FileIo;
use crate::types::file::{FileHeader, FILE_HEADER_LEN};
use crate::types::{Addr, MemRef, Ref, Result, StrataError};

/// Node header bytes holding the allocation size in bytes.
const NODE_CAPACITY: Range<usize> = 4..7;
/// Slab sizes are rounded up to this granularity.
const SLAB_GRANULE: usize = 256;

/// Allocation interface consumed by the node layers.
pub trait Allocator {
    /// Allocates `size` bytes (a positive multiple of 8).
    fn alloc(&mut self, size: usize) -> Result<MemRef>;

    /// Moves a block to fresh space of `new_size` bytes, copying its content
    /// and freeing the old block.
    fn realloc(&mut self, mem: MemRef, new_size: usize) -> Result<MemRef>;

    /// Frees the block at `mem`; its size is read from the node header.
    fn free(&mut self, mem: MemRef) -> Result<()>;

    /// Resolves a ref to its physical location.
    fn translate(&self, ref_: Ref) -> Result<MemRef>;

    /// Returns true for refs into the committed image.
    fn is_read_only(&self, ref_: Ref) -> bool;

    /// Bytes from `mem` to the end of its region.
    fn bytes(&self, mem: MemRef) -> Result<&[u8]>;

    /// Mutable bytes from `mem` to the end of its slab.
    fn bytes_mut(&mut self, mem: MemRef) -> Result<&mut [u8]>;

    /// Format version of the attached image.
    fn file_format_version(&self) -> u8;

    /// Options the allocator was created with. Node layers read their size
    /// limits from here.
    fn options(&self) -> &StorageOptions;
}

/// Reads the allocation size stored in a node header.
pub fn node_capacity(header: &[u8]) -> Result<usize> {
    let field = header
        .get(NODE_CAPACITY)
        .ok_or(StrataError::Corruption("node header truncated"))?;
    fixed::get_u24_be(field)
}

struct Slab {
    ref_end: u64,
    data: Box<[u8]>,
}

/// Snapshot of allocator occupancy.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct SlabStats {
    /// First slab ref.
    pub baseline: u64,
    /// Number of slabs.
    pub slab_count: usize,
    /// Bytes held in slabs.
    pub slab_bytes: usize,
    /// Bytes on the free list.
    pub free_bytes: usize,
    /// Entries on the free list.
    pub free_chunks: usize,
    /// Committed bytes released during this transaction.
    pub read_only_free_bytes: usize,
    /// Live allocations, when tracking is enabled.
    pub tracked_allocations: Option<usize>,
}

/// Single-writer slab allocator.
pub struct SlabAlloc {
    committed: Arc<[u8]>,
    header: FileHeader,
    baseline: u64,
    slabs: Vec<Slab>,
    slab_bytes: usize,
    free_space: FreeList,
    free_read_only: Vec<Chunk>,
    tracked: Option<FxHashMap<u64, usize>>,
    options: StorageOptions,
    metrics: Arc<dyn AllocMetrics>,
}

impl SlabAlloc {
    /// Creates an allocator over an empty in-memory store.
    pub fn new(options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let mut image = vec![0u8; FILE_HEADER_LEN];
        FileHeader::new(options.file_format_version).encode(&mut image)?;
        Self::attach_buffer(image, options)
    }

    /// Attaches to a committed image held in memory.
    pub fn attach_buffer(image: impl Into<Arc<[u8]>>, options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let committed: Arc<[u8]> = image.into();
        let header = FileHeader::decode(&committed)?;
        let baseline = committed.len() as u64;
        let tracked = options.track_allocations.then(FxHashMap::default);
        debug!(
            baseline,
            top_ref = header.top_ref().0,
            version = header.format_version(),
            "slab.attach"
        );
        Ok(Self {
            committed,
            header,
            baseline,
            slabs: Vec::new(),
            slab_bytes: 0,
            free_space: FreeList::default(),
            free_read_only: Vec::new(),
            tracked,
            options,
            metrics: Arc::new(NoopMetrics),
        })
    }

    /// Attaches to a store file, writing a fresh header if the file is empty.
    pub fn attach_file(io: &dyn FileIo, options: StorageOptions) -> Result<Self> {
        options.validate()?;
        let len = io.len()?;
        if len == 0 {
            let mut image = vec![0u8; FILE_HEADER_LEN];
            FileHeader::new(options.file_format_version).encode(&mut image)?;
            io.write_at(0, &image)?;
            io.sync_all()?;
            debug!("slab.attach_file.created");
            return Self::attach_buffer(image, options);
        }
        let len = usize::try_from(len).map_err(|_| StrataError::Corruption("file too large"))?;
        let mut image = vec![0u8; len];
        io.read_at(0, &mut image)?;
        Self::attach_buffer(image, options)
    }

    /// Installs a metrics sink.
    pub fn with_metrics(mut self, metrics: Arc<dyn AllocMetrics>) -> Self {
        self.metrics = metrics;
        self
    }

    /// First ref past the committed image.
    pub fn baseline(&self) -> u64 {
        self.baseline
    }

    /// Current top ref recorded in the file header.
    pub fn top_ref(&self) -> Ref {
        self.header.top_ref()
    }

    /// Decoded file header of the committed image.
    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Shared handle to the committed image.
    pub fn committed_image(&self) -> Arc<[u8]> {
        Arc::clone(&self.committed)
    }

    /// Size of the address space: committed image plus all slabs.
    pub fn total_size(&self) -> u64 {
        self.slabs.last().map_or(self.baseline, |s| s.ref_end)
    }

    /// Committed spans released during this transaction.
    pub fn read_only_free_chunks(&self) -> &[Chunk] {
        &self.free_read_only
    }

    /// Free list entries.
    pub fn free_chunks(&self) -> &[Chunk] {
        self.free_space.chunks()
    }

    fn slab_start(&self, index: usize) -> u64 {
        if index == 0 {
            self.baseline
        } else {
            self.slabs[index - 1].ref_end
        }
    }

    fn slab_range(&self, index: usize) -> (u64, u64) {
        (self.slab_start(index), self.slabs[index].ref_end)
    }

    /// Returns true if `ref_` is the start or end of a slab.
    pub fn is_slab_boundary(&self, ref_: u64) -> bool {
        ref_ == self.baseline
            || self
                .slabs
                .binary_search_by_key(&ref_, |s| s.ref_end)
                .is_ok()
    }

    fn new_slab_size(&self, size: usize) -> Result<usize> {
        let min_size = size.div_ceil(SLAB_GRANULE) * SLAB_GRANULE;
        let prev = self.slabs.last().map_or(0, |s| s.data.len());
        let mut new_size = min_size.max(2 * prev);
        if let Some(limit) = self.options.memory_limit {
            if self.slab_bytes + new_size > limit {
                new_size = min_size;
            }
            if self.slab_bytes + new_size > limit {
                return Err(StrataError::OutOfMemory { requested: size });
            }
        }
        Ok(new_size)
    }

    fn add_slab(&mut self, size: usize) -> Result<MemRef> {
        let new_size = self.new_slab_size(size)?;
        let mut data = Vec::new();
        data.try_reserve_exact(new_size)
            .map_err(|_| StrataError::OutOfMemory { requested: size })?;
        data.resize(new_size, 0);
        let start = self.total_size();
        let index = self.slabs.len();
        self.slabs.push(Slab {
            ref_end: start + new_size as u64,
            data: data.into_boxed_slice(),
        });
        self.slab_bytes += new_size;
        if new_size > size {
            self.free_space
                .push(Chunk::new(start + size as u64, new_size - size));
        }
        self.metrics.slab_created(new_size);
        debug!(slab = index, start, size = new_size, "slab.alloc.new_slab");
        Ok(MemRef::new(Addr::Slab { index, offset: 0 }, Ref(start)))
    }

    fn track(&mut self, ref_: u64, size: usize) {
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.insert(ref_, size);
        }
    }

    fn untrack(&mut self, ref_: u64, size: usize) -> Result<()> {
        let Some(tracked) = self.tracked.as_mut() else {
            return Ok(());
        };
        match tracked.remove(&ref_) {
            Some(allocated) if allocated == size => Ok(()),
            Some(allocated) => {
                tracked.insert(ref_, allocated);
                warn!(ref_, allocated, header = size, "slab.free.size_mismatch");
                Err(StrataError::Corruption(
                    "freed size differs from allocated size",
                ))
            }
            None => {
                warn!(ref_, "slab.free.untracked");
                Err(StrataError::Invalid("free of untracked or already freed ref"))
            }
        }
    }

    /// Returns true when every slab is covered by exactly one free entry.
    pub fn is_all_free(&self) -> bool {
        if self.free_space.len() != self.slabs.len() {
            return false;
        }
        (0..self.slabs.len()).all(|index| {
            let (start, end) = self.slab_range(index);
            self.free_space
                .chunks()
                .iter()
                .any(|c| c.start == start && c.end() == end)
        })
    }

    /// Checks free-list and tracking invariants.
    pub fn verify(&self) -> Result<()> {
        let mut chunks = self.free_space.chunks().to_vec();
        chunks.sort_by_key(|c| c.start);
        for pair in chunks.windows(2) {
            if pair[0].end() > pair[1].start {
                return Err(StrataError::Corruption("free list entries overlap"));
            }
        }
        for chunk in &chunks {
            if chunk.len == 0 {
                return Err(StrataError::Corruption("empty free list entry"));
            }
            let index = self.slabs.partition_point(|s| s.ref_end <= chunk.start);
            if chunk.start < self.baseline || index == self.slabs.len() {
                return Err(StrataError::Corruption("free list entry outside slabs"));
            }
            if chunk.end() > self.slabs[index].ref_end {
                return Err(StrataError::Corruption(
                    "free list entry crosses slab boundary",
                ));
            }
        }
        if let Some(tracked) = self.tracked.as_ref() {
            if tracked
                .iter()
                .any(|(&start, &len)| self.free_space.overlaps(start, len))
            {
                return Err(StrataError::Corruption("live allocation on free list"));
            }
        }
        Ok(())
    }

    /// Forgets every allocation made since the last attach or rebase.
    ///
    /// Each slab becomes one free entry. Used when a transaction ends.
    pub fn reset_free_space_tracking(&mut self) {
        let chunks = (0..self.slabs.len())
            .map(|index| {
                let (start, end) = self.slab_range(index);
                Chunk::new(start, (end - start) as usize)
            })
            .collect();
        self.free_space = FreeList::from_chunks(chunks);
        self.free_read_only.clear();
        if let Some(tracked) = self.tracked.as_mut() {
            tracked.clear();
        }
    }

    /// Switches to a newer committed image, keeping slab memory for reuse.
    ///
    /// Slabs are renumbered to start at the new baseline and all slab space
    /// becomes free.
    pub fn rebase(&mut self, image: Arc<[u8]>) -> Result<()> {
        let header = FileHeader::decode(&image)?;
        let baseline = image.len() as u64;
        let mut end = baseline;
        for slab in &mut self.slabs {
            end += slab.data.len() as u64;
            slab.ref_end = end;
        }
        debug!(
            old_baseline = self.baseline,
            baseline,
            slabs = self.slabs.len(),
            "slab.rebase"
        );
        self.committed = image;
        self.header = header;
        self.baseline = baseline;
        self.reset_free_space_tracking();
        Ok(())
    }

    /// Occupancy snapshot.
    pub fn stats(&self) -> SlabStats {
        SlabStats {
            baseline: self.baseline,
            slab_count: self.slabs.len(),
            slab_bytes: self.slab_bytes,
            free_bytes: self.free_space.total_bytes(),
            free_chunks: self.free_space.len(),
            read_only_free_bytes: self.free_read_only.iter().map(|c| c.len).sum(),
            tracked_allocations: self.tracked.as_ref().map(|t| t.len()),
        }
    }
}

impl Allocator for SlabAlloc {
    fn alloc(&mut self, size: usize) -> Result<MemRef> {
        if size == 0 || size % 8 != 0 {
            return Err(StrataError::Invalid(
                "allocation size must be a positive multiple of 8",
            ));
        }
        let mem = match self.free_space.take_first_fit(size) {
            Some(start) => self.translate(Ref(start))?,
            None => self.add_slab(size)?,
        };
        self.track(mem.ref_.0, size);
        self.metrics.allocated(size);
        Ok(mem)
    }

    fn realloc(&mut self, mem: MemRef, new_size: usize) -> Result<MemRef> {
        let old_size = node_capacity(self.bytes(mem)?)?;
        let copy_len = old_size.min(new_size);
        let content = self
            .bytes(mem)?
            .get(..copy_len)
            .ok_or(StrataError::Corruption("node extends past its region"))?
            .to_vec();
        let new_mem = self.alloc(new_size)?;
        self.bytes_mut(new_mem)?[..copy_len].copy_from_slice(&content);
        self.free(mem)?;
        Ok(new_mem)
    }

    fn free(&mut self, mem: MemRef) -> Result<()> {
        if mem.ref_.is_null() {
            return Err(StrataError::Invalid("free of null ref"));
        }
        let size = node_capacity(self.bytes(mem)?)?;
        if size == 0 || size % 8 != 0 {
            return Err(StrataError::Corruption("node capacity is not a valid size"));
        }
        let start = mem.ref_.0;
        if self.is_read_only(mem.ref_) {
            let end = start + size as u64;
            if self.tracked.is_some()
                && self
                    .free_read_only
                    .iter()
                    .any(|c| c.start < end && start < c.end())
            {
                warn!(ref_ = start, size, "slab.free.read_only_twice");
                return Err(StrataError::Invalid("double free of committed ref"));
            }
            self.free_read_only.push(Chunk::new(start, size));
            self.metrics.read_only_freed(size);
            debug!(ref_ = start, size, "slab.free.read_only");
            return Ok(());
        }
        let Addr::Slab { index, offset } = mem.addr else {
            return Err(StrataError::Invalid("slab ref paired with committed address"));
        };
        let slab_len = self
            .slabs
            .get(index)
            .map(|s| s.data.len())
            .ok_or(StrataError::Invalid("slab index out of range"))?;
        if offset + size > slab_len {
            return Err(StrataError::Corruption("freed span crosses slab boundary"));
        }
        self.untrack(start, size)?;
        let baseline = self.baseline;
        let slabs = &self.slabs;
        let outcome = self.free_space.release(Chunk::new(start, size), |r| {
            r == baseline || slabs.binary_search_by_key(&r, |s| s.ref_end).is_ok()
        });
        self.metrics.freed(size);
        debug!(ref_ = start, size, merged = outcome == Release::Merged, "slab.free");
        Ok(())
    }

    fn translate(&self, ref_: Ref) -> Result<MemRef> {
        if ref_.is_null() {
            return Err(StrataError::Invalid("translate of null ref"));
        }
        if ref_.0 < self.baseline {
            return Ok(MemRef::new(Addr::Committed(ref_.0 as usize), ref_));
        }
        let index = self.slabs.partition_point(|s| s.ref_end <= ref_.0);
        if index == self.slabs.len() {
            return Err(StrataError::Invalid("ref beyond allocated space"));
        }
        let offset = (ref_.0 - self.slab_start(index)) as usize;
        Ok(MemRef::new(Addr::Slab { index, offset }, ref_))
    }

    fn is_read_only(&self, ref_: Ref) -> bool {
        ref_.0 < self.baseline
    }

    fn bytes(&self, mem: MemRef) -> Result<&[u8]> {
        match mem.addr {
            Addr::Committed(offset) => self
                .committed
                .get(offset..)
                .ok_or(StrataError::Corruption("ref outside committed image")),
            Addr::Slab { index, offset } => self
                .slabs
                .get(index)
                .and_then(|s| s.data.get(offset..))
                .ok_or(StrataError::Invalid("address outside slabs")),
        }
    }

    fn bytes_mut(&mut self, mem: MemRef) -> Result<&mut [u8]> {
        match mem.addr {
            Addr::Committed(_) => Err(StrataError::Invalid("committed memory is read-only")),
            Addr::Slab { index, offset } => self
                .slabs
                .get_mut(index)
                .and_then(|s| s.data.get_mut(offset..))
                .ok_or(StrataError::Invalid("address outside slabs")),
        }
    }

    fn file_format_version(&self) -> u8 {
        self.header.format_version()
    }

    fn options(&self) -> &StorageOptions {
        &self.options
    }
}

#[cfg(test)]
mod tests;
