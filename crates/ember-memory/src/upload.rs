//! # Dynamic Upload Heap
//!
//! Growable list of [`GpuRingBuffer`]s. Allocation always goes to the
//! newest ring; when it is full a ring twice as large is appended, and
//! older rings are dropped once they drain.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;

use ember_core::{align_up, DeviceBackend, Error, FenceValue, Result};

use crate::gpu_ring::GpuRingBuffer;
use crate::page::DynamicAllocation;

/// Per-context upload memory.
pub struct DynamicUploadHeap {
    backend: Arc<dyn DeviceBackend>,
    name: String,
    cpu_accessible: bool,
    /// Oldest first; never empty
    rings: Vec<GpuRingBuffer>,
}

impl DynamicUploadHeap {
    /// Create a heap with one ring of `initial_size` bytes.
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        name: impl Into<String>,
        initial_size: u64,
        cpu_accessible: bool,
    ) -> Result<Self> {
        let ring = GpuRingBuffer::new(&backend, initial_size, cpu_accessible)?;
        let mut rings = Vec::with_capacity(2);
        rings.push(ring);
        Ok(Self {
            backend,
            name: name.into(),
            cpu_accessible,
            rings,
        })
    }

    /// Allocate `size` bytes rounded up to `alignment` (a power of two),
    /// at an offset aligned to `alignment`.
    pub fn allocate(&mut self, size: u64, alignment: u64) -> Result<DynamicAllocation> {
        if size == 0 || !alignment.is_power_of_two() {
            return Err(Error::InvalidParameter);
        }
        let aligned_size = align_up(size, alignment);

        let max_size = match self.rings.last_mut() {
            Some(ring) => {
                if let Some(allocation) = ring.allocate(aligned_size, alignment) {
                    return Ok(allocation);
                }
                ring.max_size()
            }
            None => 0,
        };

        let mut new_size = max_size.max(1).saturating_mul(2);
        while new_size < aligned_size {
            new_size = new_size.saturating_mul(2);
        }

        let mut ring = match GpuRingBuffer::new(&self.backend, new_size, self.cpu_accessible) {
            Ok(ring) => ring,
            Err(err) => {
                log::error!(
                    "{}: failed to grow upload heap to {} bytes: {}",
                    self.name,
                    new_size,
                    err
                );
                return Err(err);
            }
        };

        let allocation = ring.allocate(aligned_size, alignment).ok_or(Error::AllocationTooLarge)?;
        self.rings.push(ring);
        Ok(allocation)
    }

    /// Close the frame on every ring, release frames up to
    /// `last_completed_fence_value`, and drop drained rings except the
    /// newest.
    pub fn finish_frame(&mut self, fence_value: FenceValue, last_completed_fence_value: FenceValue) {
        for ring in &mut self.rings {
            ring.finish_current_frame(fence_value);
            ring.release_completed_frames(last_completed_fence_value);
        }

        let newest = self.rings.len().saturating_sub(1);
        let num_drained = self.rings[..newest]
            .iter()
            .take_while(|ring| ring.is_empty())
            .count();
        if num_drained > 0 {
            log::debug!("{}: dropping {} drained upload rings", self.name, num_drained);
            self.rings = self.rings.split_off(num_drained);
        }
    }

    /// Number of rings
    pub fn num_rings(&self) -> usize {
        self.rings.len()
    }

    /// Capacity of the newest ring
    pub fn current_size(&self) -> u64 {
        self.rings.last().map_or(0, GpuRingBuffer::max_size)
    }

    /// Bytes in use across all rings
    pub fn used_size(&self) -> u64 {
        self.rings.iter().map(GpuRingBuffer::used_size).sum()
    }
}

impl fmt::Debug for DynamicUploadHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicUploadHeap")
            .field("name", &self.name)
            .field("rings", &self.rings.len())
            .field("current_size", &self.current_size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::EmulatedDevice;

    fn heap(initial_size: u64) -> (Arc<EmulatedDevice>, DynamicUploadHeap) {
        let device = Arc::new(EmulatedDevice::new());
        let heap = DynamicUploadHeap::new(device.clone(), "Upload heap", initial_size, true).unwrap();
        (device, heap)
    }

    #[test]
    fn test_size_is_aligned() {
        let (_device, mut heap) = heap(1024);
        let a = heap.allocate(10, 16).unwrap();
        let b = heap.allocate(10, 16).unwrap();
        assert_eq!(a.offset(), 0);
        assert_eq!(b.offset(), 16);
        assert_eq!(heap.used_size(), 32);
    }

    #[test]
    fn test_mixed_alignments_keep_offsets_aligned() {
        let (_device, mut heap) = heap(1024);
        let small = heap.allocate(10, 1).unwrap();
        let constants = heap.allocate(16, 256).unwrap();
        assert_eq!(small.offset(), 0);
        assert_eq!(constants.offset(), 256);
        assert_eq!(constants.gpu_address().raw() % 256, 0);
        assert_eq!(heap.used_size(), 272);

        // Padding pushes the next request past the end; a new ring is added
        let next = heap.allocate(600, 256).unwrap();
        assert_eq!(next.offset(), 0);
        assert_eq!(heap.num_rings(), 2);
    }

    #[test]
    fn test_grows_by_doubling() {
        let (device, mut heap) = heap(256);
        heap.allocate(200, 1).unwrap();
        let big = heap.allocate(100, 1).unwrap();
        assert_eq!(heap.num_rings(), 2);
        assert_eq!(heap.current_size(), 512);
        assert_eq!(big.offset(), 0);

        // Doubles until the request fits
        heap.allocate(3000, 1).unwrap();
        assert_eq!(heap.current_size(), 4096);
        assert_eq!(device.live_buffer_count(), 3);
    }

    #[test]
    fn test_finish_frame_drops_drained_rings() {
        let (device, mut heap) = heap(256);
        heap.allocate(256, 1).unwrap();
        heap.allocate(256, 1).unwrap();
        assert_eq!(heap.num_rings(), 2);

        heap.finish_frame(1, 0);
        assert_eq!(heap.num_rings(), 2);

        heap.finish_frame(2, 1);
        assert_eq!(heap.num_rings(), 1);
        assert_eq!(heap.current_size(), 512);
        assert_eq!(device.live_buffer_count(), 1);
    }

    #[test]
    fn test_newest_ring_is_kept_when_drained() {
        let (device, mut heap) = heap(256);
        heap.allocate(64, 1).unwrap();
        heap.finish_frame(1, 1);
        assert_eq!(heap.used_size(), 0);
        assert_eq!(heap.num_rings(), 1);
        assert_eq!(device.live_buffer_count(), 1);
    }

    #[test]
    fn test_growth_failure_is_reported() {
        let device = Arc::new(EmulatedDevice::new().with_buffer_budget(256 + 256));
        let mut heap = DynamicUploadHeap::new(device, "Upload heap", 256, true).unwrap();
        heap.allocate(256, 1).unwrap();
        assert_eq!(heap.allocate(1, 1).unwrap_err(), Error::OutOfDeviceMemory);
        assert_eq!(heap.num_rings(), 1);
    }
}
