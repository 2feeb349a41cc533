//! # Render Context
//!
//! Per-thread recording state: the context's private dynamic descriptor
//! and memory allocators, finished together when the context flushes.

use alloc::format;
use alloc::string::String;
use core::fmt;

use ember_core::{queue_bit, CommandQueueMask, DescriptorHeapType, Error, FenceValue, Result};
use ember_descriptor::{DescriptorHeapAllocation, DynamicSuballocationsManager};
use ember_memory::{DynamicAllocation, DynamicHeap, DynamicUploadHeap};

use crate::device::{RenderDevice, PRIMARY_QUEUE};

/// A rendering context bound to a device.
///
/// Owned by one thread at a time; submits on the queue it was created for.
pub struct RenderContext<'d> {
    device: &'d RenderDevice,
    name: String,
    queue: usize,
    /// Queues this context has submitted work to
    submitted_queue_mask: CommandQueueMask,
    /// One per shader-visible heap type
    dynamic_descriptors: [DynamicSuballocationsManager; DescriptorHeapType::SHADER_VISIBLE_COUNT],
    dynamic_heap: DynamicHeap,
    /// `None` only while dropping
    upload_heap: Option<DynamicUploadHeap>,
}

impl<'d> RenderContext<'d> {
    pub(crate) fn new(device: &'d RenderDevice, name: String, queue: usize) -> Result<Self> {
        let info = device.create_info();
        let suballocator = |ty: DescriptorHeapType| -> Result<DynamicSuballocationsManager> {
            let heap = device.gpu_heap(ty).ok_or(Error::NotSupported)?;
            Ok(DynamicSuballocationsManager::new(
                heap.clone(),
                info.dynamic_descriptor_allocation_chunk_size[ty.index()],
                format!("{}: dynamic {} descriptors", name, ty),
            ))
        };
        let dynamic_descriptors = [
            suballocator(DescriptorHeapType::CbvSrvUav)?,
            suballocator(DescriptorHeapType::Sampler)?,
        ];

        let dynamic_heap = DynamicHeap::new(
            device.dynamic_memory().clone(),
            format!("{}: dynamic heap", name),
            info.dynamic_heap_page_size,
        );
        let upload_heap = DynamicUploadHeap::new(
            device.backend().clone(),
            format!("{}: upload heap", name),
            info.upload_heap_initial_size,
            true,
        )?;

        log::debug!("Render context '{}' created on queue {}", name, queue);
        Ok(Self {
            device,
            name,
            queue,
            submitted_queue_mask: 0,
            dynamic_descriptors,
            dynamic_heap,
            upload_heap: Some(upload_heap),
        })
    }

    /// Allocate `count` shader-visible descriptors valid until the next
    /// flush. Null when the dynamic region is exhausted.
    pub fn allocate_dynamic_descriptors(
        &mut self,
        heap_type: DescriptorHeapType,
        count: u32,
    ) -> DescriptorHeapAllocation {
        match self.dynamic_descriptors.get_mut(heap_type.index()) {
            Some(manager) if heap_type.can_be_shader_visible() => manager.allocate(count),
            _ => {
                debug_assert!(false, "{} descriptors cannot be shader visible", heap_type);
                DescriptorHeapAllocation::null()
            }
        }
    }

    /// Allocate per-draw GPU memory valid until the next flush.
    pub fn allocate_dynamic_memory(&mut self, size: u64, alignment: u64) -> Result<DynamicAllocation> {
        self.dynamic_heap.allocate(size, alignment)
    }

    /// Allocate upload memory valid until the next flush.
    pub fn allocate_upload(&mut self, size: u64, alignment: u64) -> Result<DynamicAllocation> {
        self.upload_heap
            .as_mut()
            .ok_or(Error::NotFound)?
            .allocate(size, alignment)
    }

    /// Submit the recorded batch and hand every per-frame allocation back
    /// to the device, tagged with the batch's fence value.
    pub fn flush(&mut self) -> Result<FenceValue> {
        let fence_value = if self.queue == PRIMARY_QUEUE {
            let fence_value = self.device.submit(PRIMARY_QUEUE)?;
            self.dynamic_heap.finish_frame(fence_value);
            for manager in &mut self.dynamic_descriptors {
                manager.discard_allocations(fence_value);
            }
            fence_value
        } else {
            // Pools follow the primary timeline; park this frame's pages
            // and chunks on our own queue instead
            let pages = self.dynamic_heap.release_pages();
            let [resources, samplers] = &mut self.dynamic_descriptors;
            let chunks = [resources.release_chunks(), samplers.release_chunks()];
            self.device.submit_and_release(self.queue, (pages, chunks))?
        };
        self.submitted_queue_mask |= queue_bit(self.queue);

        let completed = self.device.completed_fence_value(self.queue)?;
        if let Some(upload_heap) = self.upload_heap.as_mut() {
            upload_heap.finish_frame(fence_value, completed);
        }

        log::trace!("{}: flushed at fence {}", self.name, fence_value);
        Ok(fence_value)
    }

    /// Throw away everything recorded since the last flush. Nothing was
    /// submitted, so memory returns to the pools without waiting.
    pub fn abandon(&mut self) -> Result<()> {
        let completed = self.device.completed_fence_value(self.queue)?;

        self.dynamic_heap.discard_unsubmitted();
        if let Some(upload_heap) = self.upload_heap.as_mut() {
            upload_heap.finish_frame(completed, completed);
        }
        for manager in &mut self.dynamic_descriptors {
            drop(manager.release_chunks());
        }

        log::debug!("{}: abandoned unsubmitted work", self.name);
        Ok(())
    }

    /// Context name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning device
    pub fn device(&self) -> &'d RenderDevice {
        self.device
    }

    /// Queue this context submits on
    pub fn command_queue(&self) -> usize {
        self.queue
    }

    /// Queues this context has submitted work to
    pub fn submitted_queue_mask(&self) -> CommandQueueMask {
        self.submitted_queue_mask
    }

    /// Per-context dynamic memory heap
    pub fn dynamic_heap(&self) -> &DynamicHeap {
        &self.dynamic_heap
    }

    /// Per-context upload heap
    pub fn upload_heap(&self) -> Option<&DynamicUploadHeap> {
        self.upload_heap.as_ref()
    }

    /// Dynamic descriptor suballocator for a shader-visible heap type
    pub fn dynamic_descriptors(
        &self,
        heap_type: DescriptorHeapType,
    ) -> Option<&DynamicSuballocationsManager> {
        if heap_type.can_be_shader_visible() {
            self.dynamic_descriptors.get(heap_type.index())
        } else {
            None
        }
    }
}

impl Drop for RenderContext<'_> {
    fn drop(&mut self) {
        // Upload rings may still be read by submitted batches
        if let Some(upload_heap) = self.upload_heap.take() {
            if self.submitted_queue_mask != 0 {
                if let Err(err) = self
                    .device
                    .safe_release_masked(self.submitted_queue_mask, upload_heap)
                {
                    log::error!("{}: failed to release upload heap: {}", self.name, err);
                }
            }
        }
        log::debug!("Render context '{}' destroyed", self.name);
    }
}

impl fmt::Debug for RenderContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RenderContext")
            .field("name", &self.name)
            .field("dynamic_heap", &self.dynamic_heap)
            .field("upload_heap", &self.upload_heap)
            .finish()
    }
}

static_assertions::assert_impl_all!(RenderContext<'static>: Send);

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::sync::Arc;
    use alloc::vec::Vec;
    use ember_core::{EmulatedDevice, EmulatedQueue, GpuQueue};

    use crate::config::DeviceCreateInfo;

    fn device(hw: &Arc<EmulatedQueue>, info: DeviceCreateInfo) -> RenderDevice {
        RenderDevice::new(
            Arc::new(EmulatedDevice::new()),
            alloc::vec![hw.clone() as Arc<dyn GpuQueue>],
            info,
        )
        .unwrap()
    }

    #[test]
    fn test_flush_returns_submitted_fence() {
        let hw = Arc::new(EmulatedQueue::new());
        let device = device(&hw, DeviceCreateInfo::small());
        let mut ctx = device.create_context("Immediate").unwrap();

        ctx.allocate_dynamic_memory(256, 256).unwrap();
        let fence = ctx.flush().unwrap();
        assert_eq!(fence, 1);
        assert_eq!(hw.submitted_fence_value(), 1);
        assert_eq!(ctx.dynamic_heap().num_pages(), 0);
        assert_eq!(device.dynamic_memory().num_stale_pages(), 1);
    }

    #[test]
    fn test_dynamic_pages_recycle_after_completion() {
        let hw = Arc::new(EmulatedQueue::new());
        let device = device(&hw, DeviceCreateInfo::small());
        let mut ctx = device.create_context("Immediate").unwrap();

        let first = ctx.allocate_dynamic_memory(64, 16).unwrap().buffer().id();
        let fence = ctx.flush().unwrap();

        let second = ctx.allocate_dynamic_memory(64, 16).unwrap().buffer().id();
        assert_ne!(first, second);

        hw.complete_up_to(fence);
        ctx.flush().unwrap();
        let third = ctx.allocate_dynamic_memory(64, 16).unwrap().buffer().id();
        assert_eq!(third, first);
        ctx.abandon().unwrap();
    }

    #[test]
    fn test_dynamic_descriptors_recycle_after_completion() {
        let hw = Arc::new(EmulatedQueue::new());
        let info = DeviceCreateInfo::small().with_gpu_heap_size(DescriptorHeapType::Sampler, 16, 32);
        let device = device(&hw, info);
        let mut ctx = device.create_context("Immediate").unwrap();

        // Sampler chunks are 16 descriptors, two fit in the dynamic region
        assert!(!ctx.allocate_dynamic_descriptors(DescriptorHeapType::Sampler, 16).is_null());
        assert!(!ctx.allocate_dynamic_descriptors(DescriptorHeapType::Sampler, 16).is_null());
        assert!(ctx.allocate_dynamic_descriptors(DescriptorHeapType::Sampler, 1).is_null());

        ctx.flush().unwrap();
        // Chunks were returned after the flushed batch; drain the queue
        device.idle_gpu().unwrap();
        assert!(!ctx.allocate_dynamic_descriptors(DescriptorHeapType::Sampler, 16).is_null());
        ctx.abandon().unwrap();
    }

    #[test]
    fn test_abandon_returns_pages_immediately() {
        let hw = Arc::new(EmulatedQueue::new());
        let device = device(&hw, DeviceCreateInfo::small());
        let mut ctx = device.create_context("Deferred").unwrap();

        let first = ctx.allocate_dynamic_memory(128, 16).unwrap().buffer().id();
        ctx.abandon().unwrap();
        assert_eq!(device.dynamic_memory().num_stale_pages(), 0);
        assert_eq!(hw.submission_count(), 0);

        let again = ctx.allocate_dynamic_memory(128, 16).unwrap().buffer().id();
        assert_eq!(again, first);
        ctx.abandon().unwrap();
    }

    #[test]
    fn test_upload_memory_is_writable() {
        let hw = Arc::new(EmulatedQueue::new());
        let device = device(&hw, DeviceCreateInfo::small());
        let mut ctx = device.create_context("Uploader").unwrap();

        let mut upload = ctx.allocate_upload(16, 16).unwrap();
        let mut out = [0u8; 16];
        // SAFETY: the context has not been flushed yet
        unsafe {
            upload.write(&[7; 16]).unwrap();
            upload.read(&mut out).unwrap();
        }
        assert_eq!(out, [7; 16]);
        ctx.flush().unwrap();
    }

    #[test]
    fn test_upload_heap_outlives_context_until_fence() {
        let hw = Arc::new(EmulatedQueue::new());
        let backend = Arc::new(EmulatedDevice::new());
        let device = RenderDevice::new(
            backend.clone(),
            alloc::vec![hw.clone() as Arc<dyn GpuQueue>],
            DeviceCreateInfo::small(),
        )
        .unwrap();
        let baseline = backend.live_buffer_count();
        {
            let mut ctx = device.create_context("Transient").unwrap();
            ctx.allocate_upload(64, 16).unwrap();
            ctx.flush().unwrap();
        }
        // Ring buffer parked on the release queue
        assert_eq!(backend.live_buffer_count(), baseline + 1);
        device.idle_gpu().unwrap();
        assert_eq!(backend.live_buffer_count(), baseline);
    }

    #[test]
    fn test_context_on_secondary_queue() {
        let primary = Arc::new(EmulatedQueue::new());
        let compute = Arc::new(EmulatedQueue::new());
        let device = RenderDevice::new(
            Arc::new(EmulatedDevice::new()),
            alloc::vec![
                primary.clone() as Arc<dyn GpuQueue>,
                compute.clone() as Arc<dyn GpuQueue>,
            ],
            DeviceCreateInfo::small()
                .with_gpu_heap_size(DescriptorHeapType::Sampler, 16, 32)
                .with_command_queues(2),
        )
        .unwrap();

        let mut ctx = device.create_context_on("Compute", 1).unwrap();
        assert_eq!(ctx.command_queue(), 1);
        assert_eq!(ctx.submitted_queue_mask(), 0);

        ctx.allocate_dynamic_memory(64, 16).unwrap();
        assert!(!ctx.allocate_dynamic_descriptors(DescriptorHeapType::Sampler, 16).is_null());
        assert!(!ctx.allocate_dynamic_descriptors(DescriptorHeapType::Sampler, 16).is_null());

        let fence = ctx.flush().unwrap();
        assert_eq!(fence, 1);
        assert_eq!(compute.submitted_fence_value(), 1);
        assert_eq!(primary.submission_count(), 0);
        assert_eq!(ctx.submitted_queue_mask(), queue_bit(1));
        assert_eq!(device.pending_release_count(1).unwrap(), (0, 1));

        // The frame is still in flight on the compute queue
        assert!(ctx.allocate_dynamic_descriptors(DescriptorHeapType::Sampler, 1).is_null());
        assert_eq!(device.dynamic_memory().pages_in_use(), 1);
        assert_eq!(device.dynamic_memory().num_available_pages(), 0);

        compute.complete_up_to(fence);
        device.release_stale_resources(false);
        assert_eq!(device.dynamic_memory().pages_in_use(), 0);
        assert_eq!(device.dynamic_memory().num_available_pages(), 1);
        assert!(!ctx.allocate_dynamic_descriptors(DescriptorHeapType::Sampler, 16).is_null());

        // Upload rings follow the queues the context submitted to
        drop(ctx);
        assert_eq!(device.pending_release_count(1).unwrap(), (0, 1));
        assert_eq!(device.pending_release_count(PRIMARY_QUEUE).unwrap(), (0, 0));
    }

    #[test]
    fn test_unsubmitted_context_drops_upload_heap() {
        let hw = Arc::new(EmulatedQueue::new());
        let backend = Arc::new(EmulatedDevice::new());
        let device = RenderDevice::new(
            backend.clone(),
            alloc::vec![hw.clone() as Arc<dyn GpuQueue>],
            DeviceCreateInfo::small(),
        )
        .unwrap();
        let baseline = backend.live_buffer_count();
        {
            let mut ctx = device.create_context("Idle").unwrap();
            ctx.allocate_upload(64, 16).unwrap();
            ctx.abandon().unwrap();
        }
        assert_eq!(device.pending_release_count(PRIMARY_QUEUE).unwrap(), (0, 0));
        assert_eq!(backend.live_buffer_count(), baseline);
    }

    #[test]
    fn test_contexts_on_multiple_threads() {
        let hw = Arc::new(EmulatedQueue::auto_completing());
        let device = device(&hw, DeviceCreateInfo::small());

        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..4)
                .map(|i| {
                    let device = &device;
                    scope.spawn(move || {
                        let mut ctx = device.create_context(format!("Worker {}", i)).unwrap();
                        for _ in 0..16 {
                            let cbv = ctx.allocate_dynamic_descriptors(DescriptorHeapType::CbvSrvUav, 4);
                            assert!(!cbv.is_null());
                            ctx.allocate_dynamic_memory(512, 256).unwrap();
                            ctx.allocate_upload(128, 16).unwrap();
                            ctx.flush().unwrap();
                        }
                    })
                })
                .collect();
            for handle in handles {
                handle.join().unwrap();
            }
        });

        device.idle_gpu().unwrap();
        assert_eq!(device.dynamic_memory().pages_in_use(), 0);
        assert_eq!(device.next_fence_value(PRIMARY_QUEUE).unwrap(), 4 * 16 + 2);
    }
}
