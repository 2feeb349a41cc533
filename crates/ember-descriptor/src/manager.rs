//! # Descriptor Heap Allocation Manager
//!
//! Binds a fenced variable-size allocator to a native descriptor heap, or
//! to a subrange of one, and turns offsets into handles.

use alloc::sync::Arc;
use core::fmt;

use ember_alloc::FencedVariableSizeAllocator;
use ember_core::{
    CpuDescriptorHandle, DescriptorHeapDesc, DeviceBackend, Error, FenceTracker, FenceValue,
    GpuDescriptorHandle, NativeDescriptorHeap, Result,
};
use spin::Mutex;

use crate::allocation::{DescriptorRange, INVALID_MANAGER_ID};

/// Thread-safe allocator over one contiguous range of descriptor slots.
pub struct DescriptorHeapAllocationManager {
    /// Id stamped into every range this manager hands out
    id: u16,
    /// Backing heap
    heap: NativeDescriptorHeap,
    /// First slot of the managed range within the heap
    first_descriptor: u32,
    /// Number of slots in the managed range
    num_descriptors: u32,
    /// CPU handle of the first managed slot
    first_cpu_handle: CpuDescriptorHandle,
    /// GPU handle of the first managed slot
    first_gpu_handle: Option<GpuDescriptorHandle>,
    /// Byte distance between adjacent descriptors
    descriptor_size: u32,
    /// Free list over `[0, num_descriptors)`
    allocator: Mutex<FencedVariableSizeAllocator>,
    /// Source of the fence value freed ranges are tagged with
    fences: Arc<dyn FenceTracker>,
}

impl DescriptorHeapAllocationManager {
    /// Create a new native heap described by `desc` and manage all of it.
    pub fn new(
        backend: &Arc<dyn DeviceBackend>,
        fences: Arc<dyn FenceTracker>,
        id: u16,
        desc: &DescriptorHeapDesc,
    ) -> Result<Self> {
        let heap = NativeDescriptorHeap::create(backend, desc)?;
        Self::with_subrange(heap, fences, id, 0, desc.num_descriptors)
    }

    /// Manage slots `[first_descriptor, first_descriptor + num_descriptors)`
    /// of an existing heap.
    pub fn with_subrange(
        heap: NativeDescriptorHeap,
        fences: Arc<dyn FenceTracker>,
        id: u16,
        first_descriptor: u32,
        num_descriptors: u32,
    ) -> Result<Self> {
        if id == INVALID_MANAGER_ID || num_descriptors == 0 {
            return Err(Error::InvalidParameter);
        }
        let end = first_descriptor as u64 + num_descriptors as u64;
        if end > heap.num_descriptors() as u64 {
            return Err(Error::InvalidParameter);
        }

        let descriptor_size = heap.descriptor_size();
        if descriptor_size == 0 || descriptor_size > u16::MAX as u32 {
            return Err(Error::NotSupported);
        }

        let skip = first_descriptor as u64 * descriptor_size as u64;
        let first_cpu_handle = heap.cpu_start().offset(skip as usize);
        let first_gpu_handle = heap.gpu_start().map(|gpu| gpu.offset(skip));

        Ok(Self {
            id,
            first_descriptor,
            num_descriptors,
            first_cpu_handle,
            first_gpu_handle,
            descriptor_size,
            allocator: Mutex::new(FencedVariableSizeAllocator::new(num_descriptors as u64)),
            fences,
            heap,
        })
    }

    /// Allocate `count` contiguous descriptors; `None` when the range has
    /// no block large enough.
    pub fn allocate(&self, count: u32) -> Option<DescriptorRange> {
        let offset = self.allocator.lock().allocate(count as u64)?;
        let skip = offset * self.descriptor_size as u64;

        Some(DescriptorRange {
            first_cpu_handle: self.first_cpu_handle.offset(skip as usize),
            first_gpu_handle: self.first_gpu_handle.map(|gpu| gpu.offset(skip)),
            num_handles: count,
            descriptor_size: self.descriptor_size as u16,
            manager_id: self.id,
            heap: self.heap.clone(),
        })
    }

    /// Queue `range` for reuse once the next submitted batch completes.
    pub fn free(&self, range: DescriptorRange) {
        let offset = self.offset_of(&range);
        let mut allocator = self.allocator.lock();
        // Read under the lock so stale records stay in fence order
        let fence_value = self.fences.next_fence_value();
        allocator.free(offset, range.num_handles as u64, fence_value);
    }

    /// Make `range` reusable right away. Only valid once every batch that
    /// referenced it has completed.
    pub fn free_completed(&self, range: DescriptorRange) {
        let offset = self.offset_of(&range);
        self.allocator.lock().free_now(offset, range.num_handles as u64);
    }

    fn offset_of(&self, range: &DescriptorRange) -> u64 {
        debug_assert_eq!(range.manager_id, self.id, "Invalid descriptor heap manager id");
        debug_assert!(range.heap.ptr_eq(&self.heap), "Range belongs to another heap");

        let offset = (range.first_cpu_handle.raw() - self.first_cpu_handle.raw()) as u64
            / self.descriptor_size as u64;
        debug_assert!(offset + range.num_handles as u64 <= self.num_descriptors as u64);
        offset
    }

    /// Make ranges whose fence value has completed reusable.
    pub fn release_stale_allocations(&self, completed_fence_value: FenceValue) {
        self.allocator
            .lock()
            .release_stale_allocations(completed_fence_value);
    }

    /// Make every stale range reusable. Only valid once the GPU is idle.
    pub fn release_all_stale(&self) {
        self.allocator.lock().release_all_stale();
    }

    /// Descriptors available for allocation now
    pub fn num_available_descriptors(&self) -> u32 {
        self.allocator.lock().free_size() as u32
    }

    /// Descriptors freed but waiting for their fence value
    pub fn num_stale_descriptors(&self) -> u32 {
        self.allocator.lock().stale_allocations_size() as u32
    }

    /// Size of the managed range
    pub fn max_descriptors(&self) -> u32 {
        self.num_descriptors
    }

    /// Manager id
    pub fn id(&self) -> u16 {
        self.id
    }

    /// First slot of the managed range within the heap
    pub fn first_descriptor(&self) -> u32 {
        self.first_descriptor
    }

    /// Backing heap
    pub fn heap(&self) -> &NativeDescriptorHeap {
        &self.heap
    }

    /// Byte distance between adjacent descriptors
    pub fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }

    /// Whether `handle` points into the managed range
    pub fn contains(&self, handle: CpuDescriptorHandle) -> bool {
        let start = self.first_cpu_handle.raw();
        let end = start + self.num_descriptors as usize * self.descriptor_size as usize;
        (start..end).contains(&handle.raw())
    }
}

impl Drop for DescriptorHeapAllocationManager {
    fn drop(&mut self) {
        let allocator = self.allocator.lock();
        debug_assert_eq!(
            allocator.free_size() + allocator.stale_allocations_size(),
            self.num_descriptors as u64,
            "Not all descriptors were released"
        );
    }
}

impl fmt::Debug for DescriptorHeapAllocationManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DescriptorHeapAllocationManager")
            .field("id", &self.id)
            .field("heap_type", &self.heap.heap_type())
            .field("first_descriptor", &self.first_descriptor)
            .field("num_descriptors", &self.num_descriptors)
            .field("available", &self.num_available_descriptors())
            .finish()
    }
}

static_assertions::assert_impl_all!(DescriptorHeapAllocationManager: Send, Sync);
