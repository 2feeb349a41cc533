//! # GPU Descriptor Heap
//!
//! One shader-visible heap split into two regions:
//!
//! ```text
//!   0                      num_static             num_static + num_dynamic
//!   ├──────────────────────┼──────────────────────────────┤
//!   │  static (manager 0)  │      dynamic (manager 1)     │
//!   └──────────────────────┴──────────────────────────────┘
//! ```
//!
//! The static region serves long-lived binding tables. The dynamic region
//! only serves per-context chunks for [`DynamicSuballocationsManager`].
//! Both live in the same native heap so a command list binds one heap and
//! can index into either region.
//!
//! [`DynamicSuballocationsManager`]: crate::DynamicSuballocationsManager

use alloc::sync::{Arc, Weak};
use core::fmt;

use ember_core::{
    DescriptorHeapDesc, DescriptorHeapType, DeviceBackend, Error, FenceTracker, FenceValue,
    NativeDescriptorHeap, Result,
};
use spin::Mutex;

use crate::allocation::{DescriptorAllocator, DescriptorHeapAllocation, DescriptorRange};
use crate::manager::DescriptorHeapAllocationManager;

/// Manager id of the static region
pub const STATIC_MANAGER_ID: u16 = 0;
/// Manager id of the dynamic region
pub const DYNAMIC_MANAGER_ID: u16 = 1;

#[derive(Debug, Default, Clone, Copy)]
struct RegionStats {
    current_size: u32,
    max_size: u32,
    max_stale_size: u32,
}

/// Shader-visible descriptor heap with a static and a dynamic region.
pub struct GpuDescriptorHeap {
    this: Weak<GpuDescriptorHeap>,
    heap_type: DescriptorHeapType,
    heap: NativeDescriptorHeap,
    static_manager: DescriptorHeapAllocationManager,
    dynamic_manager: DescriptorHeapAllocationManager,
    static_stats: Mutex<RegionStats>,
    dynamic_stats: Mutex<RegionStats>,
}

impl GpuDescriptorHeap {
    /// Create a heap of `num_static + num_dynamic` descriptors.
    pub fn new(
        backend: &Arc<dyn DeviceBackend>,
        fences: Arc<dyn FenceTracker>,
        heap_type: DescriptorHeapType,
        num_static: u32,
        num_dynamic: u32,
    ) -> Result<Arc<Self>> {
        if !heap_type.can_be_shader_visible() || num_static == 0 || num_dynamic == 0 {
            return Err(Error::InvalidParameter);
        }
        let total = num_static
            .checked_add(num_dynamic)
            .ok_or(Error::InvalidParameter)?;

        let desc = DescriptorHeapDesc::shader_visible(heap_type, total);
        let heap = NativeDescriptorHeap::create(backend, &desc)?;

        let static_manager = DescriptorHeapAllocationManager::with_subrange(
            heap.clone(),
            Arc::clone(&fences),
            STATIC_MANAGER_ID,
            0,
            num_static,
        )?;
        let dynamic_manager = DescriptorHeapAllocationManager::with_subrange(
            heap.clone(),
            fences,
            DYNAMIC_MANAGER_ID,
            num_static,
            num_dynamic,
        )?;

        Ok(Arc::new_cyclic(|this| Self {
            this: this.clone(),
            heap_type,
            heap,
            static_manager,
            dynamic_manager,
            static_stats: Mutex::new(RegionStats::default()),
            dynamic_stats: Mutex::new(RegionStats::default()),
        }))
    }

    /// Allocate from the static region; null when it is exhausted.
    pub fn allocate(&self, count: u32) -> DescriptorHeapAllocation {
        Self::allocate_in(&self.static_manager, &self.static_stats, count, self.owner())
    }

    /// Allocate from the dynamic region; null when it is exhausted.
    pub fn allocate_dynamic(&self, count: u32) -> DescriptorHeapAllocation {
        Self::allocate_in(&self.dynamic_manager, &self.dynamic_stats, count, self.owner())
    }

    fn allocate_in(
        manager: &DescriptorHeapAllocationManager,
        stats: &Mutex<RegionStats>,
        count: u32,
        owner: Option<Arc<dyn DescriptorAllocator>>,
    ) -> DescriptorHeapAllocation {
        debug_assert!(count > 0, "Zero-sized descriptor allocation");
        let Some(owner) = owner else {
            return DescriptorHeapAllocation::null();
        };

        let mut stats = stats.lock();
        match manager.allocate(count) {
            Some(range) => {
                stats.current_size += count;
                stats.max_size = stats.max_size.max(stats.current_size);
                DescriptorHeapAllocation::new(range, Some(owner))
            }
            None => {
                log::debug!(
                    "Failed to allocate {} GPU descriptors from region {}",
                    count,
                    manager.id()
                );
                DescriptorHeapAllocation::null()
            }
        }
    }

    /// Make descriptors whose fence value has completed reusable in both
    /// regions.
    pub fn release_stale_allocations(&self, completed_fence_value: FenceValue) {
        for (manager, stats) in [
            (&self.static_manager, &self.static_stats),
            (&self.dynamic_manager, &self.dynamic_stats),
        ] {
            let mut stats = stats.lock();
            stats.max_stale_size = stats.max_stale_size.max(manager.num_stale_descriptors());
            manager.release_stale_allocations(completed_fence_value);
        }
    }

    /// Release every stale descriptor. Only valid once the GPU is idle.
    pub fn release_all_stale(&self) {
        self.release_stale_allocations(FenceValue::MAX);
    }

    /// Heap category
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.heap_type
    }

    /// The native heap to bind
    pub fn heap(&self) -> &NativeDescriptorHeap {
        &self.heap
    }

    /// Static region
    pub fn static_manager(&self) -> &DescriptorHeapAllocationManager {
        &self.static_manager
    }

    /// Dynamic region
    pub fn dynamic_manager(&self) -> &DescriptorHeapAllocationManager {
        &self.dynamic_manager
    }

    /// Static descriptors currently handed out
    pub fn current_static_size(&self) -> u32 {
        self.static_stats.lock().current_size
    }

    /// Peak static descriptors handed out at once
    pub fn max_static_size(&self) -> u32 {
        self.static_stats.lock().max_size
    }

    /// Dynamic descriptors currently handed out
    pub fn current_dynamic_size(&self) -> u32 {
        self.dynamic_stats.lock().current_size
    }

    /// Peak dynamic descriptors handed out at once
    pub fn max_dynamic_size(&self) -> u32 {
        self.dynamic_stats.lock().max_size
    }

    fn region(
        &self,
        manager_id: u16,
    ) -> Option<(&DescriptorHeapAllocationManager, &Mutex<RegionStats>)> {
        match manager_id {
            STATIC_MANAGER_ID => Some((&self.static_manager, &self.static_stats)),
            DYNAMIC_MANAGER_ID => Some((&self.dynamic_manager, &self.dynamic_stats)),
            id => {
                debug_assert!(false, "Invalid GPU descriptor heap manager id {}", id);
                None
            }
        }
    }

    fn owner(&self) -> Option<Arc<dyn DescriptorAllocator>> {
        let this: Arc<dyn DescriptorAllocator> = self.this.upgrade()?;
        Some(this)
    }
}

impl DescriptorAllocator for GpuDescriptorHeap {
    fn allocate(&self, count: u32) -> Result<DescriptorHeapAllocation> {
        Ok(GpuDescriptorHeap::allocate(self, count))
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
        if let Some((manager, stats)) = self.region(range.manager_id) {
            let mut stats = stats.lock();
            stats.current_size -= range.num_handles;
            manager.free(range);
        }
    }

    fn free_range_completed(&self, range: DescriptorRange) {
        if let Some((manager, stats)) = self.region(range.manager_id) {
            let mut stats = stats.lock();
            stats.current_size -= range.num_handles;
            manager.free_completed(range);
        }
    }

    fn descriptor_size(&self) -> u32 {
        self.heap.descriptor_size()
    }
}

impl Drop for GpuDescriptorHeap {
    fn drop(&mut self) {
        let static_stats = *self.static_stats.get_mut();
        let dynamic_stats = *self.dynamic_stats.get_mut();
        let static_total = self.static_manager.max_descriptors().max(1) as u64;
        let dynamic_total = self.dynamic_manager.max_descriptors().max(1) as u64;

        log::info!(
            "{} GPU heap max allocated size (static|dynamic): {} ({}%) | {} ({}%). Max stale size (static|dynamic): {} ({}%) | {} ({}%)",
            self.heap_type,
            static_stats.max_size,
            static_stats.max_size as u64 * 100 / static_total,
            dynamic_stats.max_size,
            dynamic_stats.max_size as u64 * 100 / dynamic_total,
            static_stats.max_stale_size,
            static_stats.max_stale_size as u64 * 100 / static_total,
            dynamic_stats.max_stale_size,
            dynamic_stats.max_stale_size as u64 * 100 / dynamic_total
        );
    }
}

impl fmt::Debug for GpuDescriptorHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GpuDescriptorHeap")
            .field("heap_type", &self.heap_type)
            .field("static", &self.static_manager)
            .field("dynamic", &self.dynamic_manager)
            .finish()
    }
}

static_assertions::assert_impl_all!(GpuDescriptorHeap: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;
    use ember_core::{EmulatedDevice, EmulatedQueue};
    use ember_sync::CommandQueue;

    fn heap(num_static: u32, num_dynamic: u32) -> (Arc<EmulatedQueue>, Arc<CommandQueue>, Arc<GpuDescriptorHeap>) {
        let hw = Arc::new(EmulatedQueue::new());
        let queue = Arc::new(CommandQueue::new(hw.clone()));
        let backend: Arc<dyn DeviceBackend> = Arc::new(EmulatedDevice::new());
        let heap = GpuDescriptorHeap::new(
            &backend,
            queue.clone(),
            DescriptorHeapType::CbvSrvUav,
            num_static,
            num_dynamic,
        )
        .unwrap();
        (hw, queue, heap)
    }

    #[test]
    fn test_regions_are_disjoint() {
        let (_hw, _queue, heap) = heap(32, 64);
        let stride = heap.descriptor_size() as usize;
        let start = heap.heap().cpu_start().raw();
        let static_end = start + 32 * stride;

        let mut statics = Vec::new();
        loop {
            let a = heap.allocate(3);
            if a.is_null() {
                break;
            }
            statics.push(a);
        }
        let mut dynamics = Vec::new();
        loop {
            let a = heap.allocate_dynamic(5);
            if a.is_null() {
                break;
            }
            dynamics.push(a);
        }

        assert_eq!(statics.len(), 10);
        assert_eq!(dynamics.len(), 12);
        for a in &statics {
            assert_eq!(a.manager_id(), STATIC_MANAGER_ID);
            assert!(a.cpu_handle(0).raw() >= start);
            assert!(a.cpu_handle(a.num_handles() - 1).raw() < static_end);
            assert!(heap.static_manager().contains(a.cpu_handle(0)));
        }
        for a in &dynamics {
            assert_eq!(a.manager_id(), DYNAMIC_MANAGER_ID);
            assert!(a.cpu_handle(0).raw() >= static_end);
            assert!(!heap.static_manager().contains(a.cpu_handle(a.num_handles() - 1)));
        }
        assert_eq!(heap.current_static_size(), 30);
        assert_eq!(heap.current_dynamic_size(), 60);
    }

    #[test]
    fn test_gpu_handles_track_cpu_handles() {
        let (_hw, _queue, heap) = heap(8, 8);
        let a = heap.allocate_dynamic(2);
        assert!(a.is_shader_visible());
        let cpu_offset = a.cpu_handle(1).raw() - heap.heap().cpu_start().raw();
        let gpu_offset = a.gpu_handle(1).raw() - heap.heap().gpu_start().unwrap().raw();
        assert_eq!(cpu_offset as u64, gpu_offset);
        assert_eq!(gpu_offset, 9 * heap.descriptor_size() as u64);
    }

    #[test]
    fn test_free_routes_to_owning_region() {
        let (hw, queue, heap) = heap(4, 4);
        let s = heap.allocate(4);
        let d = heap.allocate_dynamic(4);
        drop(s);
        drop(d);
        assert_eq!(heap.current_static_size(), 0);
        assert_eq!(heap.current_dynamic_size(), 0);
        assert_eq!(heap.static_manager().num_stale_descriptors(), 4);
        assert_eq!(heap.dynamic_manager().num_stale_descriptors(), 4);

        let fence = queue.submit().unwrap();
        hw.complete_up_to(fence);
        heap.release_stale_allocations(queue.completed_fence_value());
        assert_eq!(heap.static_manager().num_available_descriptors(), 4);
        assert_eq!(heap.dynamic_manager().num_available_descriptors(), 4);
        assert_eq!(heap.max_static_size(), 4);
        assert_eq!(heap.max_dynamic_size(), 4);
    }

    #[test]
    fn test_rejects_non_shader_visible_type() {
        let backend: Arc<dyn DeviceBackend> = Arc::new(EmulatedDevice::new());
        let queue = Arc::new(CommandQueue::new(Arc::new(EmulatedQueue::new())));
        let err = GpuDescriptorHeap::new(&backend, queue, DescriptorHeapType::Rtv, 4, 4).unwrap_err();
        assert_eq!(err, Error::InvalidParameter);
    }
}
