//! # CPU Descriptor Heap
//!
//! Growable pool of CPU-only descriptor heaps of one type. When no heap in
//! the pool can satisfy a request a new heap is created, so allocation
//! only fails if the platform cannot create one.

use alloc::collections::BTreeSet;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use ember_core::{
    DescriptorHeapDesc, DescriptorHeapType, DeviceBackend, Error, FenceTracker, FenceValue, Result,
};
use spin::Mutex;

use crate::allocation::{
    DescriptorAllocator, DescriptorHeapAllocation, DescriptorRange, INVALID_MANAGER_ID,
};
use crate::manager::DescriptorHeapAllocationManager;

struct HeapPool {
    /// Pool index is the manager id
    managers: Vec<DescriptorHeapAllocationManager>,
    /// Managers believed to have free descriptors
    available: BTreeSet<usize>,
    /// Size of the next heap to create
    heap_size: u32,
    /// Descriptors currently handed out
    current_size: u32,
    /// Peak of `current_size`
    max_size: u32,
    /// Peak number of stale descriptors
    max_stale_size: u32,
}

/// Pool of CPU-only descriptor heaps.
pub struct CpuDescriptorHeap {
    this: Weak<CpuDescriptorHeap>,
    backend: Arc<dyn DeviceBackend>,
    fences: Arc<dyn FenceTracker>,
    heap_type: DescriptorHeapType,
    descriptor_size: u32,
    pool: Mutex<HeapPool>,
}

impl CpuDescriptorHeap {
    /// Create a pool whose heaps hold `num_descriptors_in_heap` descriptors.
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        fences: Arc<dyn FenceTracker>,
        heap_type: DescriptorHeapType,
        num_descriptors_in_heap: u32,
    ) -> Result<Arc<Self>> {
        if num_descriptors_in_heap == 0 {
            return Err(Error::InvalidParameter);
        }
        let descriptor_size = backend.descriptor_handle_increment_size(heap_type);

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            backend,
            fences,
            heap_type,
            descriptor_size,
            pool: Mutex::new(HeapPool {
                managers: Vec::new(),
                available: BTreeSet::new(),
                heap_size: num_descriptors_in_heap,
                current_size: 0,
                max_size: 0,
                max_stale_size: 0,
            }),
        }))
    }

    /// Allocate `count` contiguous descriptors, creating a new heap if no
    /// existing one has room.
    pub fn allocate(&self, count: u32) -> Result<DescriptorHeapAllocation> {
        debug_assert!(count > 0, "Zero-sized descriptor allocation");
        let Some(owner) = self.owner() else {
            return Ok(DescriptorHeapAllocation::null());
        };

        let mut pool = self.pool.lock();
        // Managers lock internally; the pool lock is always taken first
        let mut found = None;
        let candidates: Vec<usize> = pool.available.iter().copied().collect();
        for index in candidates {
            let range = pool.managers[index].allocate(count);
            if pool.managers[index].num_available_descriptors() == 0 {
                pool.available.remove(&index);
            }
            if range.is_some() {
                found = range;
                break;
            }
        }

        let range = match found {
            Some(range) => range,
            None => {
                if count > pool.heap_size {
                    log::warn!(
                        "Number of requested {} CPU descriptors ({}) exceeds the descriptor heap size ({}). Increasing the number of descriptors in the heap",
                        self.heap_type,
                        count,
                        pool.heap_size
                    );
                    pool.heap_size = count;
                }

                let index = pool.managers.len();
                if index >= INVALID_MANAGER_ID as usize {
                    return Err(Error::HeapCreationFailed);
                }
                let desc = DescriptorHeapDesc::cpu_only(self.heap_type, pool.heap_size);
                let manager = DescriptorHeapAllocationManager::new(
                    &self.backend,
                    Arc::clone(&self.fences),
                    index as u16,
                    &desc,
                )?;
                log::debug!(
                    "Created {} CPU descriptor heap #{} with {} descriptors",
                    self.heap_type,
                    index,
                    pool.heap_size
                );

                let range = manager.allocate(count);
                let has_room = manager.num_available_descriptors() > 0;
                pool.managers.push(manager);
                if has_room {
                    pool.available.insert(index);
                }
                match range {
                    Some(range) => range,
                    None => return Ok(DescriptorHeapAllocation::null()),
                }
            }
        };

        pool.current_size += count;
        pool.max_size = pool.max_size.max(pool.current_size);
        Ok(DescriptorHeapAllocation::new(range, Some(owner)))
    }

    /// Make descriptors whose fence value has completed reusable in every
    /// heap of the pool.
    pub fn release_stale_allocations(&self, completed_fence_value: FenceValue) {
        let mut pool = self.pool.lock();
        let mut stale_size = 0;
        for index in 0..pool.managers.len() {
            stale_size += pool.managers[index].num_stale_descriptors();
            pool.managers[index].release_stale_allocations(completed_fence_value);
            if pool.managers[index].num_available_descriptors() > 0 {
                pool.available.insert(index);
            }
        }
        pool.max_stale_size = pool.max_stale_size.max(stale_size);
    }

    /// Release every stale descriptor. Only valid once the GPU is idle.
    pub fn release_all_stale(&self) {
        self.release_stale_allocations(FenceValue::MAX);
    }

    /// Heap category
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// Number of heaps in the pool
    pub fn num_heaps(&self) -> usize {
        self.pool.lock().managers.len()
    }

    /// Descriptors currently handed out
    pub fn current_size(&self) -> u32 {
        self.pool.lock().current_size
    }

    /// Peak number of descriptors handed out at once
    pub fn max_size(&self) -> u32 {
        self.pool.lock().max_size
    }

    /// Size heaps created from now on will have
    pub fn heap_size(&self) -> u32 {
        self.pool.lock().heap_size
    }

    /// Descriptors freed but not yet reusable
    pub fn num_stale_descriptors(&self) -> u32 {
        let pool = self.pool.lock();
        pool.managers.iter().map(|m| m.num_stale_descriptors()).sum()
    }

    fn owner(&self) -> Option<Arc<dyn DescriptorAllocator>> {
        let this: Arc<dyn DescriptorAllocator> = self.this.upgrade()?;
        Some(this)
    }
}

impl DescriptorAllocator for CpuDescriptorHeap {
    fn allocate(&self, count: u32) -> Result<DescriptorHeapAllocation> {
        CpuDescriptorHeap::allocate(self, count)
    }

    fn free(&self, mut allocation: DescriptorHeapAllocation) {
        debug_assert!(
            allocation.is_null() || allocation.is_owned_by(self),
            "Allocation belongs to another allocator"
        );
        if let Some(range) = allocation.take_range() {
            self.free_range(range);
        }
    }

    fn free_range(&self, range: DescriptorRange) {
        let mut pool = self.pool.lock();
        let index = range.manager_id as usize;
        debug_assert!(index < pool.managers.len(), "Invalid descriptor heap manager id");
        pool.current_size -= range.num_handles;
        pool.managers[index].free(range);
    }

    fn free_range_completed(&self, range: DescriptorRange) {
        let mut pool = self.pool.lock();
        let index = range.manager_id as usize;
        debug_assert!(index < pool.managers.len(), "Invalid descriptor heap manager id");
        pool.current_size -= range.num_handles;
        pool.managers[index].free_completed(range);
        pool.available.insert(index);
    }

    fn descriptor_size(&self) -> u32 {
        self.descriptor_size
    }
}

impl Drop for CpuDescriptorHeap {
    fn drop(&mut self) {
        let pool = self.pool.get_mut();
        debug_assert_eq!(pool.current_size, 0, "Not all allocations released");

        let total: u32 = pool.managers.iter().map(|m| m.max_descriptors()).sum();
        let total = total.max(1);
        log::info!(
            "{} CPU heap max size: {} ({}%). Max stale size: {} ({}%)",
            self.heap_type,
            pool.max_size,
            pool.max_size as u64 * 100 / total as u64,
            pool.max_stale_size,
            pool.max_stale_size as u64 * 100 / total as u64
        );
    }
}

impl fmt::Debug for CpuDescriptorHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let pool = self.pool.lock();
        f.debug_struct("CpuDescriptorHeap")
            .field("heap_type", &self.heap_type)
            .field("heaps", &pool.managers.len())
            .field("available", &pool.available)
            .field("current_size", &pool.current_size)
            .field("max_size", &pool.max_size)
            .finish()
    }
}

static_assertions::assert_impl_all!(CpuDescriptorHeap: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::{EmulatedDevice, EmulatedQueue};
    use ember_sync::CommandQueue;

    struct Fixture {
        hw: Arc<EmulatedQueue>,
        queue: Arc<CommandQueue>,
        device: Arc<EmulatedDevice>,
    }

    impl Fixture {
        fn new() -> Self {
            let hw = Arc::new(EmulatedQueue::new());
            Self {
                queue: Arc::new(CommandQueue::new(hw.clone())),
                hw,
                device: Arc::new(EmulatedDevice::new()),
            }
        }

        fn heap(&self, ty: DescriptorHeapType, size: u32) -> Arc<CpuDescriptorHeap> {
            CpuDescriptorHeap::new(self.device.clone(), self.queue.clone(), ty, size).unwrap()
        }

        fn retire_frame(&self) -> FenceValue {
            let fence = self.queue.submit().unwrap();
            self.hw.complete_up_to(fence);
            self.queue.completed_fence_value()
        }
    }

    #[test]
    fn test_first_allocation_creates_heap() {
        let fx = Fixture::new();
        let heap = fx.heap(DescriptorHeapType::CbvSrvUav, 16);
        assert_eq!(heap.num_heaps(), 0);

        let a = heap.allocate(4).unwrap();
        assert!(!a.is_null());
        assert_eq!(a.manager_id(), 0);
        assert!(!a.is_shader_visible());
        assert_eq!(heap.num_heaps(), 1);
        assert_eq!(heap.current_size(), 4);
    }

    #[test]
    fn test_pool_grows_when_full() {
        let fx = Fixture::new();
        let heap = fx.heap(DescriptorHeapType::Rtv, 8);
        let a = heap.allocate(8).unwrap();
        let b = heap.allocate(1).unwrap();
        assert_eq!(a.manager_id(), 0);
        assert_eq!(b.manager_id(), 1);
        assert_eq!(heap.num_heaps(), 2);
        assert_eq!(fx.device.live_heap_count(), 2);
    }

    #[test]
    fn test_oversized_request_bumps_heap_size() {
        let fx = Fixture::new();
        let heap = fx.heap(DescriptorHeapType::CbvSrvUav, 16);
        let small = heap.allocate(10).unwrap();
        let first_cpu = small.cpu_handle(0);

        let big = heap.allocate(40).unwrap();
        assert!(!big.is_null());
        assert_eq!(big.num_handles(), 40);
        assert_eq!(heap.heap_size(), 40);
        assert_eq!(big.heap().unwrap().num_descriptors(), 40);

        // Earlier allocation untouched and in a different heap
        assert_eq!(small.cpu_handle(0), first_cpu);
        assert_eq!(small.manager_id(), 0);
        assert_ne!(big.manager_id(), small.manager_id());
        assert!(!big.heap().unwrap().ptr_eq(small.heap().unwrap()));
    }

    #[test]
    fn test_freed_descriptors_wait_for_fence() {
        let fx = Fixture::new();
        let heap = fx.heap(DescriptorHeapType::Sampler, 4);
        let a = heap.allocate(4).unwrap();
        let first = a.cpu_handle(0);
        drop(a);
        assert_eq!(heap.current_size(), 0);
        assert_eq!(heap.num_stale_descriptors(), 4);

        // Stale range is not reused: a second heap is created instead
        heap.release_stale_allocations(fx.queue.completed_fence_value());
        let b = heap.allocate(4).unwrap();
        assert_eq!(b.manager_id(), 1);
        drop(b);

        let completed = fx.retire_frame();
        heap.release_stale_allocations(completed);
        let c = heap.allocate(4).unwrap();
        assert_eq!(c.manager_id(), 0);
        assert_eq!(c.cpu_handle(0), first);
        assert_eq!(heap.max_size(), 4);
    }

    #[test]
    fn test_explicit_free() {
        let fx = Fixture::new();
        let heap = fx.heap(DescriptorHeapType::Dsv, 4);
        let a = heap.allocate(2).unwrap();
        DescriptorAllocator::free(heap.as_ref(), a);
        assert_eq!(heap.current_size(), 0);
        assert_eq!(heap.num_stale_descriptors(), 2);
    }

    #[test]
    fn test_concurrent_allocation() {
        use std::thread;

        let fx = Fixture::new();
        let heap = fx.heap(DescriptorHeapType::CbvSrvUav, 64);
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let heap = Arc::clone(&heap);
                thread::spawn(move || {
                    let allocations: Vec<_> =
                        (0..50).map(|i| heap.allocate(1 + i % 3).unwrap()).collect();
                    allocations
                        .iter()
                        .map(|a| (a.cpu_handle(0).raw(), a.num_handles()))
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut ranges: Vec<(usize, u32)> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        ranges.sort_unstable();
        let stride = heap.descriptor_size() as usize;
        for pair in ranges.windows(2) {
            let (start, count) = pair[0];
            assert!(start + count as usize * stride <= pair[1].0, "Overlapping allocations");
        }
        assert_eq!(heap.current_size(), 0);
    }
}
