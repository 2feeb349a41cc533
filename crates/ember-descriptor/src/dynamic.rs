//! # Dynamic Suballocations Manager
//!
//! Per-context linear allocator over chunks taken from the dynamic region
//! of a [`GpuDescriptorHeap`]. Descriptors handed out here are valid until
//! the next [`discard_allocations`]; they are never freed one by one.
//!
//! [`discard_allocations`]: DynamicSuballocationsManager::discard_allocations

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use ember_core::FenceValue;

use crate::allocation::{DescriptorHeapAllocation, DescriptorRange};
use crate::gpu_heap::GpuDescriptorHeap;

/// Chunked bump allocator for per-frame shader-visible descriptors.
///
/// Not thread safe: each rendering context owns one and is its only user.
pub struct DynamicSuballocationsManager {
    parent: Arc<GpuDescriptorHeap>,
    name: String,
    /// Chunks taken from the parent's dynamic region, oldest first
    chunks: Vec<DescriptorHeapAllocation>,
    /// Next free slot in the last chunk
    current_offset: u32,
    /// Minimum chunk size
    chunk_size: u32,
    /// Descriptors handed out since the last discard
    current_size: u32,
    /// Peak of `current_size`
    peak_size: u32,
    /// Peak number of chunks held at once
    peak_chunks: usize,
}

impl DynamicSuballocationsManager {
    /// Create a manager drawing chunks of at least `chunk_size` descriptors
    /// from `parent`.
    pub fn new(parent: Arc<GpuDescriptorHeap>, chunk_size: u32, name: impl Into<String>) -> Self {
        debug_assert!(chunk_size > 0);
        Self {
            parent,
            name: name.into(),
            chunks: Vec::new(),
            current_offset: 0,
            chunk_size: chunk_size.max(1),
            current_size: 0,
            peak_size: 0,
            peak_chunks: 0,
        }
    }

    /// Allocate `count` contiguous descriptors. Returns a null allocation
    /// if the parent's dynamic region is exhausted.
    ///
    /// The result does not own its descriptors; dropping it does nothing.
    pub fn allocate(&mut self, count: u32) -> DescriptorHeapAllocation {
        debug_assert!(count > 0, "Zero-sized descriptor allocation");

        let needs_chunk = match self.chunks.last() {
            Some(chunk) => self.current_offset + count > chunk.num_handles(),
            None => true,
        };

        if needs_chunk {
            let chunk_size = self.chunk_size.max(count);
            let chunk = self.parent.allocate_dynamic(chunk_size);
            if chunk.is_null() {
                log::error!(
                    "{}: dynamic GPU descriptor heap is exhausted ({} descriptors requested)",
                    self.name,
                    chunk_size
                );
                return DescriptorHeapAllocation::null();
            }
            self.chunks.push(chunk);
            self.current_offset = 0;
            self.peak_chunks = self.peak_chunks.max(self.chunks.len());
        }

        let Some(chunk) = self.chunks.last() else {
            return DescriptorHeapAllocation::null();
        };
        let offset = self.current_offset;
        let gpu_handle = chunk.gpu_handle(offset);
        let range = DescriptorRange {
            first_cpu_handle: chunk.cpu_handle(offset),
            first_gpu_handle: (!gpu_handle.is_null()).then_some(gpu_handle),
            num_handles: count,
            descriptor_size: chunk.descriptor_size() as u16,
            manager_id: chunk.manager_id(),
            heap: match chunk.heap() {
                Some(heap) => heap.clone(),
                None => return DescriptorHeapAllocation::null(),
            },
        };

        self.current_offset += count;
        self.current_size += count;
        self.peak_size = self.peak_size.max(self.current_size);
        DescriptorHeapAllocation::new(range, None)
    }

    /// Per-allocation free is not supported; descriptors are reclaimed by
    /// [`discard_allocations`](Self::discard_allocations).
    pub fn free(&mut self, allocation: DescriptorHeapAllocation) {
        drop(allocation);
    }

    /// Return every chunk to the parent heap.
    ///
    /// Chunks are tagged with the parent's next fence value, so they are
    /// only reused once work submitted up to `fence_value` has completed.
    pub fn discard_allocations(&mut self, fence_value: FenceValue) {
        log::trace!(
            "{}: discarding {} dynamic descriptor chunks after fence {}",
            self.name,
            self.chunks.len(),
            fence_value
        );
        self.chunks.clear();
        self.current_offset = 0;
        self.current_size = 0;
    }

    /// Detach every chunk. The chunks return to the parent heap for
    /// immediate reuse when the result is dropped, so it must outlive
    /// every batch that references them.
    pub fn release_chunks(&mut self) -> RetiredChunks {
        log::trace!(
            "{}: retiring {} dynamic descriptor chunks",
            self.name,
            self.chunks.len()
        );
        self.current_offset = 0;
        self.current_size = 0;
        RetiredChunks {
            chunks: core::mem::take(&mut self.chunks),
        }
    }

    /// Byte distance between adjacent descriptors
    pub fn descriptor_size(&self) -> u32 {
        self.parent.heap().descriptor_size()
    }

    /// Chunks currently held
    pub fn num_chunks(&self) -> usize {
        self.chunks.len()
    }

    /// Descriptors handed out since the last discard
    pub fn current_size(&self) -> u32 {
        self.current_size
    }

    /// Peak descriptors handed out between two discards
    pub fn peak_size(&self) -> u32 {
        self.peak_size
    }

    /// Parent heap
    pub fn parent(&self) -> &Arc<GpuDescriptorHeap> {
        &self.parent
    }
}

impl Drop for DynamicSuballocationsManager {
    fn drop(&mut self) {
        log::info!(
            "{} usage stats: peak descriptors: {}, peak chunks: {}",
            self.name,
            self.peak_size,
            self.peak_chunks
        );
    }
}

/// Descriptor chunks detached from a [`DynamicSuballocationsManager`].
///
/// Dropping it hands the chunks back for immediate reuse, so it is parked
/// in a release queue until the GPU is done with them.
#[derive(Debug, Default)]
pub struct RetiredChunks {
    chunks: Vec<DescriptorHeapAllocation>,
}

impl RetiredChunks {
    /// Number of chunks
    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    /// No chunks
    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }
}

impl Drop for RetiredChunks {
    fn drop(&mut self) {
        for chunk in self.chunks.drain(..) {
            chunk.free_completed();
        }
    }
}

impl fmt::Debug for DynamicSuballocationsManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicSuballocationsManager")
            .field("name", &self.name)
            .field("chunks", &self.chunks.len())
            .field("current_offset", &self.current_offset)
            .field("chunk_size", &self.chunk_size)
            .finish()
    }
}

static_assertions::assert_impl_all!(DynamicSuballocationsManager: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{DescriptorHeapType, DeviceBackend, EmulatedDevice, EmulatedQueue};
    use ember_sync::CommandQueue;

    struct Fixture {
        hw: Arc<EmulatedQueue>,
        queue: Arc<CommandQueue>,
        heap: Arc<GpuDescriptorHeap>,
    }

    fn fixture(num_dynamic: u32) -> Fixture {
        let hw = Arc::new(EmulatedQueue::new());
        let queue = Arc::new(CommandQueue::new(hw.clone()));
        let backend: Arc<dyn DeviceBackend> = Arc::new(EmulatedDevice::new());
        let heap = GpuDescriptorHeap::new(
            &backend,
            queue.clone(),
            DescriptorHeapType::CbvSrvUav,
            16,
            num_dynamic,
        )
        .unwrap();
        Fixture { hw, queue, heap }
    }

    #[test]
    fn test_second_chunk_when_current_is_insufficient() {
        let fx = fixture(64);
        let mut mgr = DynamicSuballocationsManager::new(fx.heap.clone(), 16, "Test");

        let a = mgr.allocate(10);
        assert!(!a.is_null());
        assert_eq!(mgr.num_chunks(), 1);
        assert_eq!(fx.heap.current_dynamic_size(), 16);

        let b = mgr.allocate(10);
        assert!(!b.is_null());
        assert_eq!(mgr.num_chunks(), 2);
        assert_eq!(fx.heap.current_dynamic_size(), 32);

        // Second allocation starts at the beginning of the new chunk
        let stride = mgr.descriptor_size() as usize;
        assert_ne!(b.cpu_handle(0).raw(), a.cpu_handle(0).raw() + 10 * stride);
    }

    #[test]
    fn test_suballocations_are_contiguous_within_chunk() {
        let fx = fixture(64);
        let mut mgr = DynamicSuballocationsManager::new(fx.heap.clone(), 16, "Test");
        let a = mgr.allocate(4);
        let b = mgr.allocate(4);
        let stride = mgr.descriptor_size() as usize;
        assert_eq!(b.cpu_handle(0).raw(), a.cpu_handle(0).raw() + 4 * stride);
        assert_eq!(
            b.gpu_handle(0).raw(),
            a.gpu_handle(0).raw() + 4 * stride as u64
        );
        assert_eq!(mgr.num_chunks(), 1);
        assert_eq!(mgr.current_size(), 8);
    }

    #[test]
    fn test_large_request_gets_own_chunk() {
        let fx = fixture(64);
        let mut mgr = DynamicSuballocationsManager::new(fx.heap.clone(), 8, "Test");
        let a = mgr.allocate(20);
        assert!(!a.is_null());
        assert_eq!(a.num_handles(), 20);
        assert_eq!(fx.heap.current_dynamic_size(), 20);
    }

    #[test]
    fn test_free_is_a_no_op() {
        let fx = fixture(64);
        let mut mgr = DynamicSuballocationsManager::new(fx.heap.clone(), 16, "Test");
        let a = mgr.allocate(4);
        mgr.free(a);
        assert_eq!(fx.heap.current_dynamic_size(), 16);
        assert_eq!(fx.heap.dynamic_manager().num_stale_descriptors(), 0);

        let b = mgr.allocate(4);
        let stride = mgr.descriptor_size() as usize;
        let chunk_start = fx.heap.dynamic_manager().heap().cpu_start().raw() + 16 * stride;
        assert_eq!(b.cpu_handle(0).raw(), chunk_start + 4 * stride);
    }

    #[test]
    fn test_discard_returns_chunks_after_fence() {
        let fx = fixture(32);
        let mut mgr = DynamicSuballocationsManager::new(fx.heap.clone(), 16, "Test");
        mgr.allocate(16);
        mgr.allocate(16);
        assert!(mgr.allocate(1).is_null());

        let fence = fx.queue.submit().unwrap();
        mgr.discard_allocations(fence);
        assert_eq!(mgr.num_chunks(), 0);
        assert_eq!(fx.heap.current_dynamic_size(), 0);
        assert_eq!(fx.heap.dynamic_manager().num_stale_descriptors(), 32);

        // Chunks were tagged with the value after `fence`
        fx.hw.complete_up_to(fence);
        fx.heap.release_stale_allocations(fx.queue.completed_fence_value());
        assert!(mgr.allocate(1).is_null());

        let next = fx.queue.submit().unwrap();
        fx.hw.complete_up_to(next);
        fx.heap.release_stale_allocations(fx.queue.completed_fence_value());
        assert!(!mgr.allocate(1).is_null());
        assert_eq!(mgr.peak_size(), 32);
    }

    #[test]
    fn test_retired_chunks_return_when_dropped() {
        let fx = fixture(32);
        let mut mgr = DynamicSuballocationsManager::new(fx.heap.clone(), 16, "Test");
        mgr.allocate(16);
        mgr.allocate(16);

        let retired = mgr.release_chunks();
        assert_eq!(retired.len(), 2);
        assert_eq!(mgr.num_chunks(), 0);
        assert_eq!(mgr.current_size(), 0);
        // Still parked: nothing to hand out
        assert!(mgr.allocate(1).is_null());

        drop(retired);
        assert_eq!(fx.heap.current_dynamic_size(), 0);
        assert_eq!(fx.heap.dynamic_manager().num_stale_descriptors(), 0);
        assert!(!mgr.allocate(1).is_null());
    }
}
