//! # Render Device
//!
//! Owns every device-lifetime pool and the per-queue fence bookkeeping.

use alloc::boxed::Box;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::any::Any;
use core::fmt;

use ember_core::{
    queue_bit, queue_indices, CommandQueueMask, DescriptorHeapType, DeviceBackend, Error,
    FenceTracker, FenceValue, GpuQueue, Result,
};
use ember_descriptor::{CpuDescriptorHeap, DescriptorHeapAllocation, GpuDescriptorHeap};
use ember_memory::DynamicMemoryManager;
use ember_sync::{CommandQueue, ResourceReleaseQueue};
use spin::Mutex;

use crate::config::DeviceCreateInfo;
use crate::context::RenderContext;

/// Queue whose fence timeline tags descriptor and dynamic memory frees
pub const PRIMARY_QUEUE: usize = 0;

struct QueueSlot {
    queue: Arc<CommandQueue>,
    release: Mutex<ResourceReleaseQueue>,
}

// =============================================================================
// RENDER DEVICE
// =============================================================================

/// Device-wide descriptor and memory state.
pub struct RenderDevice {
    backend: Arc<dyn DeviceBackend>,
    queues: Vec<QueueSlot>,
    cpu_heaps: [Arc<CpuDescriptorHeap>; DescriptorHeapType::COUNT],
    gpu_heaps: [Arc<GpuDescriptorHeap>; DescriptorHeapType::SHADER_VISIBLE_COUNT],
    dynamic_memory: Arc<DynamicMemoryManager>,
    info: DeviceCreateInfo,
}

impl RenderDevice {
    /// Create a device driving `queues`. Queue 0 is the primary queue.
    pub fn new(
        backend: Arc<dyn DeviceBackend>,
        queues: Vec<Arc<dyn GpuQueue>>,
        info: DeviceCreateInfo,
    ) -> Result<Self> {
        info.validate()?;
        if queues.len() != info.num_command_queues {
            return Err(Error::InvalidParameter);
        }

        let queues: Vec<QueueSlot> = queues
            .into_iter()
            .map(|queue| QueueSlot {
                queue: Arc::new(CommandQueue::new(queue)),
                release: Mutex::new(ResourceReleaseQueue::new()),
            })
            .collect();
        let fences: Arc<dyn FenceTracker> = match queues.first() {
            Some(slot) => slot.queue.clone() as Arc<dyn FenceTracker>,
            None => return Err(Error::InvalidParameter),
        };

        let cpu_sizes = &info.cpu_descriptor_heap_allocation_size;
        let cpu_heap = |ty: DescriptorHeapType| {
            CpuDescriptorHeap::new(backend.clone(), fences.clone(), ty, cpu_sizes[ty.index()])
        };
        let cpu_heaps = [
            cpu_heap(DescriptorHeapType::CbvSrvUav)?,
            cpu_heap(DescriptorHeapType::Sampler)?,
            cpu_heap(DescriptorHeapType::Rtv)?,
            cpu_heap(DescriptorHeapType::Dsv)?,
        ];

        let gpu_heap = |ty: DescriptorHeapType| {
            GpuDescriptorHeap::new(
                &backend,
                fences.clone(),
                ty,
                info.gpu_descriptor_heap_size[ty.index()],
                info.gpu_descriptor_heap_dynamic_size[ty.index()],
            )
        };
        let gpu_heaps = [
            gpu_heap(DescriptorHeapType::CbvSrvUav)?,
            gpu_heap(DescriptorHeapType::Sampler)?,
        ];

        let dynamic_memory = Arc::new(DynamicMemoryManager::new(
            backend.clone(),
            fences.clone(),
            info.num_dynamic_heap_pages_to_reserve,
            info.dynamic_heap_page_size,
        )?);

        log::info!(
            "Render device created: {} command queue(s), {} dynamic pages of {} bytes reserved",
            queues.len(),
            info.num_dynamic_heap_pages_to_reserve,
            info.dynamic_heap_page_size
        );

        Ok(Self {
            backend,
            queues,
            cpu_heaps,
            gpu_heaps,
            dynamic_memory,
            info,
        })
    }

    fn slot(&self, queue: usize) -> Result<&QueueSlot> {
        self.queues.get(queue).ok_or(Error::InvalidQueue)
    }

    // ------------------------------------------------------------------------
    // DESCRIPTORS
    // ------------------------------------------------------------------------

    /// Allocate `count` CPU-only descriptors of type `heap_type`.
    pub fn allocate_descriptors(
        &self,
        heap_type: DescriptorHeapType,
        count: u32,
    ) -> Result<DescriptorHeapAllocation> {
        self.cpu_heaps[heap_type.index()].allocate(count)
    }

    /// Allocate `count` descriptors from the static region of the
    /// shader-visible heap of `heap_type`. Null when the region is
    /// exhausted or the type cannot be shader visible.
    pub fn allocate_gpu_descriptors(
        &self,
        heap_type: DescriptorHeapType,
        count: u32,
    ) -> DescriptorHeapAllocation {
        match self.gpu_heap(heap_type) {
            Some(heap) => heap.allocate(count),
            None => {
                debug_assert!(false, "{} descriptors cannot be shader visible", heap_type);
                DescriptorHeapAllocation::null()
            }
        }
    }

    // ------------------------------------------------------------------------
    // DEFERRED RELEASE
    // ------------------------------------------------------------------------

    /// Keep `resource` alive until the next batch submitted on `queue`
    /// completes.
    pub fn safe_release<T: Any + Send>(&self, queue: usize, resource: T) -> Result<()> {
        let slot = self.slot(queue)?;
        let mut release = slot.release.lock();
        // Read under the lock so the release FIFO stays in fence order
        let fence_value = slot.queue.next_fence_value();
        release.safe_release(Box::new(resource), fence_value);
        Ok(())
    }

    /// Keep `resource` alive until the next batch submitted on every queue
    /// in `queue_mask` completes.
    ///
    /// A resource shared by several queues is parked in each of their
    /// release queues and dropped when the last of them lets go.
    pub fn safe_release_masked<T: Any + Send>(
        &self,
        queue_mask: CommandQueueMask,
        resource: T,
    ) -> Result<()> {
        if queue_mask == 0 || queue_indices(queue_mask).any(|queue| queue >= self.queues.len()) {
            return Err(Error::InvalidQueue);
        }
        if queue_mask.is_power_of_two() {
            return self.safe_release(queue_mask.trailing_zeros() as usize, resource);
        }

        let shared = Arc::new(Mutex::new(resource));
        for queue in queue_indices(queue_mask) {
            self.safe_release(queue, shared.clone())?;
        }
        Ok(())
    }

    /// Keep `resource` alive until the batch currently being recorded for
    /// `queue` is submitted and completes.
    pub fn stage_release<T: Any + Send>(&self, queue: usize, resource: T) -> Result<()> {
        let slot = self.slot(queue)?;
        let mut release = slot.release.lock();
        let cmd_list_number = slot.queue.next_fence_value();
        release.stage(Box::new(resource), cmd_list_number);
        Ok(())
    }

    /// Submit the pending batch on `queue`. Returns the fence value the
    /// batch signals.
    pub fn submit(&self, queue: usize) -> Result<FenceValue> {
        self.submit_inner(queue, None)
    }

    /// Submit the pending batch on `queue` and keep `resource` alive until
    /// that batch completes.
    pub fn submit_and_release<T: Any + Send>(&self, queue: usize, resource: T) -> Result<FenceValue> {
        self.submit_inner(queue, Some(Box::new(resource)))
    }

    fn submit_inner(&self, queue: usize, resource: Option<Box<dyn Any + Send>>) -> Result<FenceValue> {
        let slot = self.slot(queue)?;
        let fence_value = {
            let mut release = slot.release.lock();
            let fence_value = match slot.queue.submit() {
                Ok(fence_value) => fence_value,
                Err(err) => {
                    if let Some(resource) = resource {
                        release.safe_release(resource, slot.queue.next_fence_value());
                    }
                    return Err(err);
                }
            };
            release.discard_stale_resources(fence_value, fence_value);
            if let Some(resource) = resource {
                release.safe_release(resource, fence_value);
            }
            release.purge(slot.queue.completed_fence_value());
            fence_value
        };

        if queue == PRIMARY_QUEUE {
            self.release_pools(slot.queue.completed_fence_value());
        }
        Ok(fence_value)
    }

    /// Recycle everything whose fence value has completed. With `force`,
    /// recycle everything regardless; only valid once the GPU is idle.
    pub fn release_stale_resources(&self, force: bool) {
        for slot in &self.queues {
            let mut release = slot.release.lock();
            let released = if force {
                release.drain_all()
            } else {
                release.purge(slot.queue.completed_fence_value())
            };
            if released > 0 {
                log::trace!("Released {} stale resources", released);
            }
        }

        if force {
            for heap in &self.cpu_heaps {
                heap.release_all_stale();
            }
            for heap in &self.gpu_heaps {
                heap.release_all_stale();
            }
            self.dynamic_memory.release_stale_pages(FenceValue::MAX);
        } else {
            self.release_pools(self.queues[PRIMARY_QUEUE].queue.completed_fence_value());
        }
    }

    fn release_pools(&self, completed_fence_value: FenceValue) {
        for heap in &self.cpu_heaps {
            heap.release_stale_allocations(completed_fence_value);
        }
        for heap in &self.gpu_heaps {
            heap.release_stale_allocations(completed_fence_value);
        }
        self.dynamic_memory.release_stale_pages(completed_fence_value);
    }

    /// Wait for every queue to drain, then recycle stale resources.
    pub fn idle_gpu(&self) -> Result<()> {
        for slot in &self.queues {
            let mut release = slot.release.lock();
            let fence_value = slot.queue.idle()?;
            release.discard_stale_resources(fence_value, fence_value);
        }
        self.release_stale_resources(false);
        Ok(())
    }

    /// Fence value the next batch on `queue` will signal
    pub fn next_fence_value(&self, queue: usize) -> Result<FenceValue> {
        Ok(self.slot(queue)?.queue.next_fence_value())
    }

    /// Highest completed fence value on `queue`
    pub fn completed_fence_value(&self, queue: usize) -> Result<FenceValue> {
        Ok(self.slot(queue)?.queue.completed_fence_value())
    }

    /// Create a rendering context submitting on the primary queue
    pub fn create_context(&self, name: impl Into<String>) -> Result<RenderContext<'_>> {
        self.create_context_on(name, PRIMARY_QUEUE)
    }

    /// Create a rendering context submitting on `queue`
    pub fn create_context_on(
        &self,
        name: impl Into<String>,
        queue: usize,
    ) -> Result<RenderContext<'_>> {
        self.slot(queue)?;
        RenderContext::new(self, name.into(), queue)
    }

    /// Mask of every queue the device drives
    pub fn queue_mask(&self) -> CommandQueueMask {
        (0..self.queues.len()).fold(0, |mask, queue| mask | queue_bit(queue))
    }

    // ------------------------------------------------------------------------
    // ACCESSORS
    // ------------------------------------------------------------------------

    /// Platform backend
    pub fn backend(&self) -> &Arc<dyn DeviceBackend> {
        &self.backend
    }

    /// CPU descriptor heap pool of `heap_type`
    pub fn cpu_heap(&self, heap_type: DescriptorHeapType) -> &Arc<CpuDescriptorHeap> {
        &self.cpu_heaps[heap_type.index()]
    }

    /// Shader-visible heap of `heap_type`, if the type can be shader visible
    pub fn gpu_heap(&self, heap_type: DescriptorHeapType) -> Option<&Arc<GpuDescriptorHeap>> {
        if heap_type.can_be_shader_visible() {
            self.gpu_heaps.get(heap_type.index())
        } else {
            None
        }
    }

    /// Dynamic memory page pool
    pub fn dynamic_memory(&self) -> &Arc<DynamicMemoryManager> {
        &self.dynamic_memory
    }

    /// Command queue `queue`
    pub fn command_queue(&self, queue: usize) -> Option<&Arc<CommandQueue>> {
        self.queues.get(queue).map(|slot| &slot.queue)
    }

    /// Number of command queues
    pub fn num_command_queues(&self) -> usize {
        self.queues.len()
    }

    /// Objects parked on `queue` (staged, awaiting fence)
    pub fn pending_release_count(&self, queue: usize) -> Result<(usize, usize)> {
        let release = self.slot(queue)?.release.lock();
        Ok((release.stale_resource_count(), release.pending_release_count()))
    }

    /// Creation parameters
    pub fn create_info(&self) -> &DeviceCreateInfo {
        &self.info
    }
}

impl Drop for RenderDevice {
    fn drop(&mut self) {
        if let Err(err) = self.idle_gpu() {
            log::error!("Failed to idle the GPU at device shutdown: {}", err);
        }
        self.release_stale_resources(true);

        for heap in &self.cpu_heaps {
            log::info!(
                "{} CPU descriptor heap: {} heap(s), peak {} descriptors",
                heap.heap_type(),
                heap.num_heaps(),
                heap.max_size()
            );
        }
        for heap in &self.gpu_heaps {
            log::info!(
                "{} GPU descriptor heap: peak static {}/{}, peak dynamic {}/{}",
                heap.heap_type(),
                heap.max_static_size(),
                heap.static_manager().max_descriptors(),
                heap.max_dynamic_size(),
                heap.dynamic_manager().max_descriptors()
            );
        }
        self.dynamic_memory.destroy();
    }
}

impl fmt::Debug for RenderDevice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderDevice")
            .field("queues", &self.queues.len())
            .field("dynamic_memory", &self.dynamic_memory)
            .field("info", &self.info)
            .finish()
    }
}

static_assertions::assert_impl_all!(RenderDevice: Send, Sync);
