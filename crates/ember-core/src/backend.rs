//! # Backend Traits
//!
//! The narrow surface Ember needs from the platform graphics API.
//!
//! A backend creates and destroys descriptor heaps and buffers, reports
//! descriptor increment sizes, and exposes per-queue fences. Everything
//! else (descriptor writes, command recording) stays outside Ember.

use core::ptr::NonNull;

use crate::error::Result;
use crate::types::{
    BufferFlags, CpuDescriptorHandle, DescriptorHeapFlags, DescriptorHeapType, FenceValue,
    GpuAddr, GpuDescriptorHandle, ResourceId,
};

// =============================================================================
// DESCRIPTOR HEAPS
// =============================================================================

/// Parameters for creating a native descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapDesc {
    /// Heap category
    pub heap_type: DescriptorHeapType,
    /// Number of descriptor slots
    pub num_descriptors: u32,
    /// Creation flags
    pub flags: DescriptorHeapFlags,
}

impl DescriptorHeapDesc {
    /// Describe a CPU-only heap
    pub const fn cpu_only(heap_type: DescriptorHeapType, num_descriptors: u32) -> Self {
        Self {
            heap_type,
            num_descriptors,
            flags: DescriptorHeapFlags::empty(),
        }
    }

    /// Describe a shader-visible heap
    pub const fn shader_visible(heap_type: DescriptorHeapType, num_descriptors: u32) -> Self {
        Self {
            heap_type,
            num_descriptors,
            flags: DescriptorHeapFlags::SHADER_VISIBLE,
        }
    }

    /// Whether the heap will have GPU handles
    #[inline]
    pub fn is_shader_visible(&self) -> bool {
        self.flags.contains(DescriptorHeapFlags::SHADER_VISIBLE)
    }
}

/// What the backend reports about a freshly created descriptor heap
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorHeapInfo {
    /// Backend identifier
    pub id: ResourceId,
    /// CPU handle of slot 0
    pub cpu_start: CpuDescriptorHandle,
    /// GPU handle of slot 0, present only for shader-visible heaps
    pub gpu_start: Option<GpuDescriptorHandle>,
}

// =============================================================================
// BUFFERS
// =============================================================================

/// Parameters for creating a native buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// Creation flags
    pub flags: BufferFlags,
}

impl BufferDesc {
    /// Describe a persistently mapped upload buffer
    pub const fn upload(size: u64) -> Self {
        Self {
            size,
            flags: BufferFlags::CPU_ACCESSIBLE,
        }
    }
}

/// What the backend reports about a freshly created buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferInfo {
    /// Backend identifier
    pub id: ResourceId,
    /// GPU virtual address of byte 0
    pub gpu_address: GpuAddr,
    /// Persistent CPU mapping of byte 0, if the buffer is CPU accessible
    pub cpu_address: Option<NonNull<u8>>,
}

// =============================================================================
// TRAITS
// =============================================================================

/// Object creation interface implemented by the platform
pub trait DeviceBackend: Send + Sync {
    /// Create a descriptor heap
    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo>;

    /// Destroy a descriptor heap created by this backend
    fn destroy_descriptor_heap(&self, id: ResourceId);

    /// Byte distance between adjacent descriptors of `heap_type`
    fn descriptor_handle_increment_size(&self, heap_type: DescriptorHeapType) -> u32;

    /// Create a buffer
    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferInfo>;

    /// Destroy a buffer created by this backend
    fn destroy_buffer(&self, id: ResourceId);
}

/// A hardware command queue with a monotonic completion fence
pub trait GpuQueue: Send + Sync {
    /// Submit the pending work and signal `fence_value` when it completes
    fn submit(&self, fence_value: FenceValue) -> Result<()>;

    /// Highest fence value the GPU has completed
    fn completed_fence_value(&self) -> FenceValue;

    /// Block until `fence_value` has completed
    fn wait_for_fence(&self, fence_value: FenceValue);
}

/// Source of fence values used to tag deferred frees
///
/// `next_fence_value` is the value the next submitted batch will signal.
/// Anything freed now may still be referenced by that batch, so it is
/// tagged with this value and recycled once `completed_fence_value`
/// reaches it.
pub trait FenceTracker: Send + Sync {
    /// Fence value the next submitted batch will signal
    fn next_fence_value(&self) -> FenceValue;

    /// Highest fence value known to be complete
    fn completed_fence_value(&self) -> FenceValue;
}
