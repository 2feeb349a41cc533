//! # Descriptor Heap Allocation
//!
//! A contiguous range of descriptor slots borrowed from a heap.

use alloc::sync::Arc;
use core::fmt;

use ember_core::{CpuDescriptorHandle, GpuDescriptorHandle, NativeDescriptorHeap, Result};

/// Manager id carried by null allocations
pub const INVALID_MANAGER_ID: u16 = u16::MAX;

// =============================================================================
// DESCRIPTOR RANGE
// =============================================================================

/// Plain description of an allocated range, without ownership semantics.
#[derive(Debug, Clone)]
pub struct DescriptorRange {
    /// CPU handle of the first descriptor
    pub first_cpu_handle: CpuDescriptorHandle,
    /// GPU handle of the first descriptor, if the heap is shader visible
    pub first_gpu_handle: Option<GpuDescriptorHandle>,
    /// Number of descriptors
    pub num_handles: u32,
    /// Byte distance between adjacent descriptors
    pub descriptor_size: u16,
    /// Id of the manager that owns the range within its allocator
    pub manager_id: u16,
    /// Heap the range lives in
    pub heap: NativeDescriptorHeap,
}

// =============================================================================
// DESCRIPTOR ALLOCATOR TRAIT
// =============================================================================

/// An object that hands out [`DescriptorHeapAllocation`]s and takes their
/// ranges back.
pub trait DescriptorAllocator: Send + Sync {
    /// Allocate `count` contiguous descriptors.
    ///
    /// Returns a null allocation when the allocator is exhausted and an
    /// error only when the platform fails to create backing storage.
    fn allocate(&self, count: u32) -> Result<DescriptorHeapAllocation>;

    /// Return an allocation produced by this allocator.
    fn free(&self, allocation: DescriptorHeapAllocation);

    /// Take back a range. Called when an allocation is dropped.
    fn free_range(&self, range: DescriptorRange);

    /// Take back a range no pending GPU work references. Defaults to
    /// [`free_range`](Self::free_range).
    fn free_range_completed(&self, range: DescriptorRange) {
        self.free_range(range);
    }

    /// Byte distance between adjacent descriptors.
    fn descriptor_size(&self) -> u32;
}

// =============================================================================
// DESCRIPTOR HEAP ALLOCATION
// =============================================================================

/// Move-only handle to a range of descriptors.
///
/// Dropping a non-null allocation returns the range to the allocator that
/// produced it. Allocations without an allocator (sub-allocations of a
/// per-context chunk) return nothing: the chunk they point into is
/// released as a whole.
#[derive(Default)]
pub struct DescriptorHeapAllocation {
    range: Option<DescriptorRange>,
    allocator: Option<Arc<dyn DescriptorAllocator>>,
}

impl DescriptorHeapAllocation {
    /// The null allocation
    pub fn null() -> Self {
        Self::default()
    }

    /// Wrap `range`; it goes back to `allocator` on drop.
    pub fn new(range: DescriptorRange, allocator: Option<Arc<dyn DescriptorAllocator>>) -> Self {
        debug_assert!(!range.first_cpu_handle.is_null());
        debug_assert!(range.num_handles > 0);
        Self {
            range: Some(range),
            allocator,
        }
    }

    /// Whether this allocation holds no descriptors
    #[inline]
    pub fn is_null(&self) -> bool {
        self.range.is_none()
    }

    /// Whether descriptors in this allocation have GPU handles
    #[inline]
    pub fn is_shader_visible(&self) -> bool {
        self.range
            .as_ref()
            .map_or(false, |r| r.first_gpu_handle.is_some())
    }

    /// CPU handle of descriptor `offset` within the allocation
    pub fn cpu_handle(&self, offset: u32) -> CpuDescriptorHandle {
        match &self.range {
            Some(range) => {
                debug_assert!(offset < range.num_handles, "Descriptor offset out of range");
                range
                    .first_cpu_handle
                    .offset(offset as usize * range.descriptor_size as usize)
            }
            None => CpuDescriptorHandle::null(),
        }
    }

    /// GPU handle of descriptor `offset` within the allocation; null when
    /// the heap is not shader visible
    pub fn gpu_handle(&self, offset: u32) -> GpuDescriptorHandle {
        match &self.range {
            Some(DescriptorRange {
                first_gpu_handle: Some(first),
                num_handles,
                descriptor_size,
                ..
            }) => {
                debug_assert!(offset < *num_handles, "Descriptor offset out of range");
                first.offset(offset as u64 * *descriptor_size as u64)
            }
            _ => GpuDescriptorHandle::null(),
        }
    }

    /// Number of descriptors. A null allocation reports one (null) handle.
    pub fn num_handles(&self) -> u32 {
        self.range.as_ref().map_or(1, |r| r.num_handles)
    }

    /// Byte distance between adjacent descriptors
    pub fn descriptor_size(&self) -> u32 {
        self.range.as_ref().map_or(0, |r| r.descriptor_size as u32)
    }

    /// Id of the manager that produced the allocation
    pub fn manager_id(&self) -> u16 {
        self.range
            .as_ref()
            .map_or(INVALID_MANAGER_ID, |r| r.manager_id)
    }

    /// Heap the descriptors live in
    pub fn heap(&self) -> Option<&NativeDescriptorHeap> {
        self.range.as_ref().map(|r| &r.heap)
    }

    /// Whether this allocation will be returned to `allocator`
    pub fn is_owned_by(&self, allocator: &dyn DescriptorAllocator) -> bool {
        self.allocator.as_ref().map_or(false, |owner| {
            core::ptr::eq(
                Arc::as_ptr(owner) as *const u8,
                allocator as *const dyn DescriptorAllocator as *const u8,
            )
        })
    }

    /// Return the range to its allocator for immediate reuse. Only valid
    /// once every batch that referenced the descriptors has completed.
    pub fn free_completed(mut self) {
        if let (Some(range), Some(allocator)) = (self.range.take(), self.allocator.take()) {
            allocator.free_range_completed(range);
        }
    }

    /// Detach the range without returning it anywhere
    pub(crate) fn take_range(&mut self) -> Option<DescriptorRange> {
        self.allocator = None;
        self.range.take()
    }
}

impl Drop for DescriptorHeapAllocation {
    fn drop(&mut self) {
        if let (Some(range), Some(allocator)) = (self.range.take(), self.allocator.take()) {
            allocator.free_range(range);
        }
    }
}

impl fmt::Debug for DescriptorHeapAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.range {
            Some(range) => f
                .debug_struct("DescriptorHeapAllocation")
                .field("cpu", &range.first_cpu_handle)
                .field("gpu", &range.first_gpu_handle)
                .field("num_handles", &range.num_handles)
                .field("manager_id", &range.manager_id)
                .field("owned", &self.allocator.is_some())
                .finish(),
            None => f.write_str("DescriptorHeapAllocation(null)"),
        }
    }
}

static_assertions::assert_impl_all!(DescriptorHeapAllocation: Send, Sync);
static_assertions::assert_not_impl_any!(DescriptorHeapAllocation: Clone, Copy);
