//! # Host Emulation Backend
//!
//! A [`DeviceBackend`] and [`GpuQueue`] that run entirely in host memory.
//!
//! Descriptor heaps get disjoint, deterministic handle ranges; buffers are
//! backed by zeroed host allocations so CPU writes through mapped pointers
//! are real. Queues never execute anything: completion is advanced by the
//! owner with [`EmulatedQueue::complete_up_to`] or implicitly by waits.

use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec;
use core::fmt;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::backend::{
    BufferDesc, BufferInfo, DescriptorHeapDesc, DescriptorHeapInfo, DeviceBackend, GpuQueue,
};
use crate::error::{Error, Result};
use crate::types::{
    align_up, BufferFlags, CpuDescriptorHandle, DescriptorHeapType, FenceValue, GpuAddr,
    GpuDescriptorHandle, ResourceId,
};

// =============================================================================
// CONSTANTS
// =============================================================================

/// First CPU descriptor address handed out
const CPU_HANDLE_BASE: usize = 0x0001_0000;
/// First GPU descriptor address handed out
const GPU_HANDLE_BASE: u64 = 0x0000_8000_0000_0000;
/// First buffer GPU address handed out
const GPU_ADDRESS_BASE: u64 = 0x0000_0001_0000_0000;
/// Granularity of handle and address ranges
const RANGE_ALIGNMENT: u64 = 0x1_0000;

/// Descriptor increment size per heap type
const DESCRIPTOR_SIZES: [u32; DescriptorHeapType::COUNT] = [32, 16, 32, 8];

// =============================================================================
// EMULATED DEVICE
// =============================================================================

struct EmulatedBuffer {
    size: u64,
    // Kept alive for the mapping handed out in `BufferInfo`
    _storage: Option<Box<[u8]>>,
}

#[derive(Default)]
struct DeviceState {
    next_id: u64,
    next_cpu_handle: usize,
    next_gpu_handle: u64,
    next_gpu_address: u64,
    heaps: BTreeMap<ResourceId, DescriptorHeapDesc>,
    buffers: BTreeMap<ResourceId, EmulatedBuffer>,
    buffer_bytes: u64,
}

/// Host-memory device backend
pub struct EmulatedDevice {
    state: Mutex<DeviceState>,
    buffer_budget: Option<u64>,
}

impl EmulatedDevice {
    /// Create a device with unlimited buffer memory
    pub fn new() -> Self {
        Self {
            state: Mutex::new(DeviceState {
                next_id: 1,
                next_cpu_handle: CPU_HANDLE_BASE,
                next_gpu_handle: GPU_HANDLE_BASE,
                next_gpu_address: GPU_ADDRESS_BASE,
                ..DeviceState::default()
            }),
            buffer_budget: None,
        }
    }

    /// Limit the total size of live buffers; creation beyond it fails
    /// with [`Error::OutOfDeviceMemory`]
    pub fn with_buffer_budget(mut self, bytes: u64) -> Self {
        self.buffer_budget = Some(bytes);
        self
    }

    /// Number of descriptor heaps not yet destroyed
    pub fn live_heap_count(&self) -> usize {
        self.state.lock().heaps.len()
    }

    /// Number of buffers not yet destroyed
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Total size of live buffers
    pub fn live_buffer_bytes(&self) -> u64 {
        self.state.lock().buffer_bytes
    }
}

impl DeviceBackend for EmulatedDevice {
    fn create_descriptor_heap(&self, desc: &DescriptorHeapDesc) -> Result<DescriptorHeapInfo> {
        let mut state = self.state.lock();
        let id = ResourceId(state.next_id);
        state.next_id += 1;

        let span = desc.num_descriptors as u64
            * self.descriptor_handle_increment_size(desc.heap_type) as u64;
        let span = align_up(span, RANGE_ALIGNMENT);

        let cpu_start = CpuDescriptorHandle::new(state.next_cpu_handle);
        state.next_cpu_handle += span as usize;

        let gpu_start = if desc.is_shader_visible() {
            let start = GpuDescriptorHandle::new(state.next_gpu_handle);
            state.next_gpu_handle += span;
            Some(start)
        } else {
            None
        };

        state.heaps.insert(id, *desc);
        Ok(DescriptorHeapInfo {
            id,
            cpu_start,
            gpu_start,
        })
    }

    fn destroy_descriptor_heap(&self, id: ResourceId) {
        let removed = self.state.lock().heaps.remove(&id);
        debug_assert!(removed.is_some(), "Descriptor heap {:?} destroyed twice", id);
    }

    fn descriptor_handle_increment_size(&self, heap_type: DescriptorHeapType) -> u32 {
        DESCRIPTOR_SIZES[heap_type.index()]
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<BufferInfo> {
        let mut state = self.state.lock();
        if let Some(budget) = self.buffer_budget {
            if state.buffer_bytes + desc.size > budget {
                return Err(Error::OutOfDeviceMemory);
            }
        }

        let id = ResourceId(state.next_id);
        state.next_id += 1;

        let gpu_address = GpuAddr::new(state.next_gpu_address);
        state.next_gpu_address += align_up(desc.size, RANGE_ALIGNMENT);

        let mut storage = if desc.flags.contains(BufferFlags::CPU_ACCESSIBLE) {
            Some(vec![0u8; desc.size as usize].into_boxed_slice())
        } else {
            None
        };
        let cpu_address = storage.as_mut().and_then(|s| NonNull::new(s.as_mut_ptr()));

        state.buffer_bytes += desc.size;
        state.buffers.insert(
            id,
            EmulatedBuffer {
                size: desc.size,
                _storage: storage,
            },
        );

        Ok(BufferInfo {
            id,
            gpu_address,
            cpu_address,
        })
    }

    fn destroy_buffer(&self, id: ResourceId) {
        let mut state = self.state.lock();
        match state.buffers.remove(&id) {
            Some(buffer) => state.buffer_bytes -= buffer.size,
            None => debug_assert!(false, "Buffer {:?} destroyed twice", id),
        }
    }
}

impl fmt::Debug for EmulatedDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EmulatedDevice")
            .field("heaps", &state.heaps.len())
            .field("buffers", &state.buffers.len())
            .field("buffer_bytes", &state.buffer_bytes)
            .field("buffer_budget", &self.buffer_budget)
            .finish()
    }
}

// =============================================================================
// EMULATED QUEUE
// =============================================================================

/// Host command queue with manually advanced completion
#[derive(Debug)]
pub struct EmulatedQueue {
    /// Highest fence value submitted
    submitted: AtomicU64,
    /// Highest fence value completed
    completed: AtomicU64,
    /// Number of submissions
    submissions: AtomicU64,
    /// Complete every batch as soon as it is submitted
    auto_complete: bool,
}

impl EmulatedQueue {
    /// Queue whose batches stay in flight until completed explicitly
    pub fn new() -> Self {
        Self {
            submitted: AtomicU64::new(0),
            completed: AtomicU64::new(0),
            submissions: AtomicU64::new(0),
            auto_complete: false,
        }
    }

    /// Queue that completes each batch on submission
    pub fn auto_completing() -> Self {
        Self {
            auto_complete: true,
            ..Self::new()
        }
    }

    /// Complete every batch up to `fence_value` (clamped to what was submitted)
    pub fn complete_up_to(&self, fence_value: FenceValue) {
        let submitted = self.submitted.load(Ordering::Acquire);
        self.completed
            .fetch_max(fence_value.min(submitted), Ordering::AcqRel);
    }

    /// Complete everything submitted so far
    pub fn complete_all(&self) {
        self.complete_up_to(FenceValue::MAX);
    }

    /// Highest fence value submitted
    pub fn submitted_fence_value(&self) -> FenceValue {
        self.submitted.load(Ordering::Acquire)
    }

    /// Number of submissions seen
    pub fn submission_count(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }
}

impl GpuQueue for EmulatedQueue {
    fn submit(&self, fence_value: FenceValue) -> Result<()> {
        let previous = self.submitted.fetch_max(fence_value, Ordering::AcqRel);
        debug_assert!(
            fence_value > previous,
            "Fence value {} submitted after {}",
            fence_value,
            previous
        );
        self.submissions.fetch_add(1, Ordering::Relaxed);
        if self.auto_complete {
            self.completed.fetch_max(fence_value, Ordering::AcqRel);
        }
        Ok(())
    }

    fn completed_fence_value(&self) -> FenceValue {
        self.completed.load(Ordering::Acquire)
    }

    fn wait_for_fence(&self, fence_value: FenceValue) {
        self.complete_up_to(fence_value);
    }
}
