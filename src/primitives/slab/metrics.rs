use std::sync::atomic::{AtomicU64, Ordering};

/// Hooks invoked by the slab allocator as space moves between states.
pub trait AllocMetrics: Send + Sync {
    /// A block of `bytes` was handed out.
    fn allocated(&self, bytes: usize);

    /// A block of `bytes` went back to the free list.
    fn freed(&self, bytes: usize);

    /// A committed block of `bytes` was released by a writer.
    fn read_only_freed(&self, bytes: usize);

    /// A new slab of `bytes` was created.
    fn slab_created(&self, bytes: usize);
}

/// Discards every event.
#[derive(Default)]
pub struct NoopMetrics;

impl AllocMetrics for NoopMetrics {
    fn allocated(&self, _bytes: usize) {}
    fn freed(&self, _bytes: usize) {}
    fn read_only_freed(&self, _bytes: usize) {}
    fn slab_created(&self, _bytes: usize) {}
}

/// Atomic counters for allocator activity.
#[derive(Default)]
pub struct CounterMetrics {
    /// Number of successful allocations.
    pub allocations: AtomicU64,
    /// Bytes handed out.
    pub bytes_allocated: AtomicU64,
    /// Number of frees of slab memory.
    pub frees: AtomicU64,
    /// Bytes returned to the free list.
    pub bytes_freed: AtomicU64,
    /// Committed bytes released by writers.
    pub read_only_bytes_freed: AtomicU64,
    /// Number of slabs created.
    pub slabs_created: AtomicU64,
}

impl AllocMetrics for CounterMetrics {
    fn allocated(&self, bytes: usize) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        self.bytes_allocated
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn freed(&self, bytes: usize) {
        self.frees.fetch_add(1, Ordering::Relaxed);
        self.bytes_freed.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn read_only_freed(&self, bytes: usize) {
        self.read_only_bytes_freed
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    fn slab_created(&self, _bytes: usize) {
        self.slabs_created.fetch_add(1, Ordering::Relaxed);
    }
}
