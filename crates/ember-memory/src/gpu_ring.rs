//! # GPU Ring Buffer
//!
//! A [`RingBuffer`] bound to one native buffer.

use alloc::sync::Arc;
use core::fmt;

use ember_alloc::RingBuffer;
use ember_core::{BufferDesc, BufferFlags, DeviceBackend, FenceValue, NativeBuffer, Result};

use crate::page::DynamicAllocation;

/// Frame-released circular allocator over a GPU buffer.
pub struct GpuRingBuffer {
    ring: RingBuffer,
    buffer: NativeBuffer,
}

impl GpuRingBuffer {
    /// Create a ring of `max_size` bytes. A CPU-accessible ring is
    /// persistently mapped; otherwise it is GPU-writable only.
    pub fn new(backend: &Arc<dyn DeviceBackend>, max_size: u64, cpu_accessible: bool) -> Result<Self> {
        let flags = if cpu_accessible {
            BufferFlags::CPU_ACCESSIBLE
        } else {
            BufferFlags::UNORDERED_ACCESS
        };
        let buffer = NativeBuffer::create(backend, &BufferDesc { size: max_size, flags })?;

        log::info!(
            "GPU ring buffer created: {} bytes, {}",
            max_size,
            if cpu_accessible { "CPU accessible" } else { "GPU only" }
        );

        Ok(Self {
            ring: RingBuffer::new(max_size),
            buffer,
        })
    }

    /// Allocate `size` contiguous bytes at an offset aligned to
    /// `alignment`, or `None` if the ring is full.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Option<DynamicAllocation> {
        let offset = self.ring.allocate_aligned(size, alignment)?;
        Some(DynamicAllocation::new(&self.buffer, offset, size))
    }

    /// Close the current frame; it completes with `fence_value`.
    pub fn finish_current_frame(&mut self, fence_value: FenceValue) {
        self.ring.finish_current_frame(fence_value);
    }

    /// Release every frame whose fence value is at most
    /// `completed_fence_value`.
    pub fn release_completed_frames(&mut self, completed_fence_value: FenceValue) {
        self.ring
            .release_completed_frames(completed_fence_value.saturating_add(1));
    }

    /// Capacity in bytes
    pub fn max_size(&self) -> u64 {
        self.ring.max_size()
    }

    /// Bytes in use, including wrap gaps
    pub fn used_size(&self) -> u64 {
        self.ring.used_size()
    }

    /// Nothing in use
    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Backing buffer
    pub fn buffer(&self) -> &NativeBuffer {
        &self.buffer
    }
}

impl Drop for GpuRingBuffer {
    fn drop(&mut self) {
        log::info!("GPU ring buffer destroyed: {} bytes", self.ring.max_size());
    }
}

impl fmt::Debug for GpuRingBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuRingBuffer")
            .field("buffer", &self.buffer.id())
            .field("ring", &self.ring)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::EmulatedDevice;

    fn backend() -> Arc<dyn DeviceBackend> {
        Arc::new(EmulatedDevice::new())
    }

    #[test]
    fn test_allocations_map_into_buffer() {
        let backend = backend();
        let mut ring = GpuRingBuffer::new(&backend, 1024, true).unwrap();
        let a = ring.allocate(100, 1).unwrap();
        let b = ring.allocate(28, 1).unwrap();
        assert_eq!(b.offset(), 100);
        assert_eq!(b.gpu_address().raw(), ring.buffer().gpu_address().raw() + 100);
        assert!(a.cpu_address().is_some());
        ring.finish_current_frame(1);
        ring.release_completed_frames(1);
    }

    #[test]
    fn test_gpu_only_ring_has_no_mapping() {
        let backend = backend();
        let mut ring = GpuRingBuffer::new(&backend, 256, false).unwrap();
        let a = ring.allocate(16, 1).unwrap();
        assert!(a.cpu_address().is_none());
        assert!(ring.buffer().flags().contains(BufferFlags::UNORDERED_ACCESS));
    }

    #[test]
    fn test_frame_released_once_fence_completes() {
        let backend = backend();
        let mut ring = GpuRingBuffer::new(&backend, 64, true).unwrap();
        ring.allocate(64, 1).unwrap();
        assert!(ring.allocate(1, 1).is_none());

        ring.finish_current_frame(3);
        ring.release_completed_frames(2);
        assert_eq!(ring.used_size(), 64);

        ring.release_completed_frames(3);
        assert!(ring.is_empty());
        assert!(ring.allocate(64, 1).is_some());
    }
}
