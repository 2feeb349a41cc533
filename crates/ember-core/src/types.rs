//! # Ember Core Types
//!
//! Strongly-typed handles and identifiers used across the allocators.
//!
//! Descriptor handles are plain addresses: a CPU handle addresses a slot in
//! the CPU view of a descriptor heap, a GPU handle addresses the same slot
//! as seen by shaders. Neither can be dereferenced by Ember itself.

use bitflags::bitflags;
use core::fmt;

// =============================================================================
// FENCE VALUES
// =============================================================================

/// Monotonic per-queue timeline value.
///
/// A command batch is associated with the fence value that the queue
/// signals when the batch completes on the GPU.
pub type FenceValue = u64;

// =============================================================================
// COMMAND QUEUE MASKS
// =============================================================================

/// Set of command queues, one bit per queue index.
pub type CommandQueueMask = u64;

/// Highest number of queues a [`CommandQueueMask`] can describe
pub const MAX_COMMAND_QUEUES: usize = CommandQueueMask::BITS as usize;

/// Mask holding only queue `index`
#[inline]
pub const fn queue_bit(index: usize) -> CommandQueueMask {
    1 << index
}

/// Iterate the queue indices set in `mask`, lowest first
pub fn queue_indices(mask: CommandQueueMask) -> impl Iterator<Item = usize> {
    (0..MAX_COMMAND_QUEUES).filter(move |&index| mask & queue_bit(index) != 0)
}

// =============================================================================
// CPU DESCRIPTOR HANDLE
// =============================================================================

/// Address of a descriptor slot in the CPU view of a heap
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct CpuDescriptorHandle(usize);

impl CpuDescriptorHandle {
    /// Create a handle from a raw address
    #[inline]
    pub const fn new(ptr: usize) -> Self {
        Self(ptr)
    }

    /// The null handle
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw address
    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by `bytes`
    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for CpuDescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "CpuDescriptorHandle({:#x})", self.0)
    }
}

// =============================================================================
// GPU DESCRIPTOR HANDLE
// =============================================================================

/// Address of a descriptor slot as seen by shaders
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuDescriptorHandle(u64);

impl GpuDescriptorHandle {
    /// Create a handle from a raw address
    #[inline]
    pub const fn new(ptr: u64) -> Self {
        Self(ptr)
    }

    /// The null handle
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw address
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by `bytes`
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Debug for GpuDescriptorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuDescriptorHandle({:#x})", self.0)
    }
}

// =============================================================================
// GPU ADDRESS
// =============================================================================

/// GPU virtual address of buffer memory
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct GpuAddr(u64);

impl GpuAddr {
    /// Create a new GPU address
    #[inline]
    pub const fn new(addr: u64) -> Self {
        Self(addr)
    }

    /// Create a null GPU address
    #[inline]
    pub const fn null() -> Self {
        Self(0)
    }

    /// Get the raw u64 value
    #[inline]
    pub const fn raw(self) -> u64 {
        self.0
    }

    /// Check if null
    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Offset by bytes
    #[inline]
    pub const fn offset(self, bytes: u64) -> Self {
        Self(self.0.wrapping_add(bytes))
    }
}

impl fmt::Debug for GpuAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GpuAddr({:#x})", self.0)
    }
}

// =============================================================================
// RESOURCE ID
// =============================================================================

/// Opaque identifier of a backend-owned object
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct ResourceId(pub u64);

// =============================================================================
// DESCRIPTOR HEAP TYPE
// =============================================================================

/// Descriptor heap category
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum DescriptorHeapType {
    /// Constant buffer, shader resource and unordered access views
    CbvSrvUav = 0,
    /// Samplers
    Sampler = 1,
    /// Render target views
    Rtv = 2,
    /// Depth stencil views
    Dsv = 3,
}

impl DescriptorHeapType {
    /// Number of heap types
    pub const COUNT: usize = 4;

    /// Number of heap types that can be shader visible
    pub const SHADER_VISIBLE_COUNT: usize = 2;

    /// All heap types in index order
    pub const ALL: [Self; Self::COUNT] = [Self::CbvSrvUav, Self::Sampler, Self::Rtv, Self::Dsv];

    /// Dense index of this type
    #[inline]
    pub const fn index(self) -> usize {
        self as usize
    }

    /// Whether heaps of this type may be created shader visible
    #[inline]
    pub const fn can_be_shader_visible(self) -> bool {
        matches!(self, Self::CbvSrvUav | Self::Sampler)
    }

    /// Human-readable name
    pub const fn name(self) -> &'static str {
        match self {
            Self::CbvSrvUav => "CBV/SRV/UAV",
            Self::Sampler => "Sampler",
            Self::Rtv => "RTV",
            Self::Dsv => "DSV",
        }
    }
}

impl fmt::Display for DescriptorHeapType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

// =============================================================================
// FLAGS
// =============================================================================

bitflags! {
    /// Descriptor heap creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct DescriptorHeapFlags: u32 {
        /// Heap is visible to shaders and has GPU handles
        const SHADER_VISIBLE = 1 << 0;
    }
}

bitflags! {
    /// Buffer creation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct BufferFlags: u32 {
        /// Buffer is persistently mapped for CPU writes
        const CPU_ACCESSIBLE = 1 << 0;
        /// Buffer may be bound as an unordered access view
        const UNORDERED_ACCESS = 1 << 1;
    }
}

// =============================================================================
// HELPERS
// =============================================================================

/// Round `value` up to a multiple of the power-of-two `alignment`
#[inline]
pub const fn align_up(value: u64, alignment: u64) -> u64 {
    let mask = alignment - 1;
    (value + mask) & !mask
}

#[cfg(test)]
mod tests {
    use super::*;

    static_assertions::assert_eq_size!(CpuDescriptorHandle, usize);
    static_assertions::assert_eq_size!(GpuDescriptorHandle, u64);
    static_assertions::const_assert_eq!(DescriptorHeapType::ALL.len(), DescriptorHeapType::COUNT);

    #[test]
    fn test_handle_offset() {
        let cpu = CpuDescriptorHandle::new(0x1000);
        assert_eq!(cpu.offset(64).raw(), 0x1040);
        assert!(CpuDescriptorHandle::null().is_null());

        let gpu = GpuDescriptorHandle::new(0x2000);
        assert_eq!(gpu.offset(32).raw(), 0x2020);
    }

    #[test]
    fn test_heap_type_indices() {
        for (i, ty) in DescriptorHeapType::ALL.iter().enumerate() {
            assert_eq!(ty.index(), i);
        }
        assert!(DescriptorHeapType::Sampler.can_be_shader_visible());
        assert!(!DescriptorHeapType::Dsv.can_be_shader_visible());
    }

    #[test]
    fn test_queue_mask_indices() {
        let mask = queue_bit(0) | queue_bit(3) | queue_bit(63);
        let indices: alloc::vec::Vec<usize> = queue_indices(mask).collect();
        assert_eq!(indices, [0, 3, 63]);
        assert_eq!(queue_indices(0).count(), 0);
    }

    #[test]
    fn test_align_up() {
        assert_eq!(align_up(0, 256), 0);
        assert_eq!(align_up(1, 256), 256);
        assert_eq!(align_up(256, 256), 256);
        assert_eq!(align_up(300, 16), 304);
    }
}
