//! # Native Object Ownership
//!
//! Reference-counted wrappers around backend objects.
//!
//! Every clone shares the same backend object; the object is destroyed
//! through its backend when the last clone is dropped. Descriptor
//! allocations and dynamic pages hold clones, so a heap or buffer cannot
//! disappear while something still points into it.

use alloc::sync::Arc;
use core::fmt;
use core::ptr::NonNull;

use crate::backend::{BufferDesc, DescriptorHeapDesc, DeviceBackend};
use crate::error::{Error, Result};
use crate::types::{
    BufferFlags, CpuDescriptorHandle, DescriptorHeapType, GpuAddr, GpuDescriptorHandle, ResourceId,
};

// =============================================================================
// DESCRIPTOR HEAP
// =============================================================================

struct HeapObject {
    backend: Arc<dyn DeviceBackend>,
    desc: DescriptorHeapDesc,
    id: ResourceId,
    cpu_start: CpuDescriptorHandle,
    gpu_start: Option<GpuDescriptorHandle>,
    descriptor_size: u32,
}

impl Drop for HeapObject {
    fn drop(&mut self) {
        self.backend.destroy_descriptor_heap(self.id);
    }
}

/// Shared ownership of a native descriptor heap
#[derive(Clone)]
pub struct NativeDescriptorHeap {
    inner: Arc<HeapObject>,
}

impl NativeDescriptorHeap {
    /// Create a heap through `backend`
    pub fn create(backend: &Arc<dyn DeviceBackend>, desc: &DescriptorHeapDesc) -> Result<Self> {
        if desc.num_descriptors == 0 {
            return Err(Error::InvalidParameter);
        }
        if desc.is_shader_visible() && !desc.heap_type.can_be_shader_visible() {
            return Err(Error::InvalidParameter);
        }

        let info = backend.create_descriptor_heap(desc)?;
        if info.cpu_start.is_null() || info.gpu_start.is_some() != desc.is_shader_visible() {
            backend.destroy_descriptor_heap(info.id);
            return Err(Error::HeapCreationFailed);
        }

        let descriptor_size = backend.descriptor_handle_increment_size(desc.heap_type);
        log::trace!(
            "Created {} descriptor heap {:?} with {} descriptors",
            desc.heap_type,
            info.id,
            desc.num_descriptors
        );

        Ok(Self {
            inner: Arc::new(HeapObject {
                backend: Arc::clone(backend),
                desc: *desc,
                id: info.id,
                cpu_start: info.cpu_start,
                gpu_start: info.gpu_start,
                descriptor_size,
            }),
        })
    }

    /// Backend identifier
    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// Creation parameters
    pub fn desc(&self) -> &DescriptorHeapDesc {
        &self.inner.desc
    }

    /// Heap category
    pub fn heap_type(&self) -> DescriptorHeapType {
        self.inner.desc.heap_type
    }

    /// Number of descriptor slots
    pub fn num_descriptors(&self) -> u32 {
        self.inner.desc.num_descriptors
    }

    /// CPU handle of slot 0
    pub fn cpu_start(&self) -> CpuDescriptorHandle {
        self.inner.cpu_start
    }

    /// GPU handle of slot 0
    pub fn gpu_start(&self) -> Option<GpuDescriptorHandle> {
        self.inner.gpu_start
    }

    /// Byte distance between adjacent descriptors
    pub fn descriptor_size(&self) -> u32 {
        self.inner.descriptor_size
    }

    /// Whether both handles refer to the same backend heap
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for NativeDescriptorHeap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeDescriptorHeap")
            .field("id", &self.inner.id)
            .field("desc", &self.inner.desc)
            .field("cpu_start", &self.inner.cpu_start)
            .field("gpu_start", &self.inner.gpu_start)
            .finish()
    }
}

// =============================================================================
// BUFFER
// =============================================================================

struct BufferObject {
    backend: Arc<dyn DeviceBackend>,
    desc: BufferDesc,
    id: ResourceId,
    gpu_address: GpuAddr,
    cpu_address: Option<NonNull<u8>>,
}

// SAFETY: the mapping is owned by the backend for the buffer's lifetime and
// Ember only hands out addresses into it; writes go through `unsafe` APIs.
unsafe impl Send for BufferObject {}
// SAFETY: see above
unsafe impl Sync for BufferObject {}

impl Drop for BufferObject {
    fn drop(&mut self) {
        self.backend.destroy_buffer(self.id);
    }
}

/// Shared ownership of a native buffer
#[derive(Clone)]
pub struct NativeBuffer {
    inner: Arc<BufferObject>,
}

impl NativeBuffer {
    /// Create a buffer through `backend`
    pub fn create(backend: &Arc<dyn DeviceBackend>, desc: &BufferDesc) -> Result<Self> {
        if desc.size == 0 {
            return Err(Error::InvalidParameter);
        }

        let info = backend.create_buffer(desc)?;
        if desc.flags.contains(BufferFlags::CPU_ACCESSIBLE) && info.cpu_address.is_none() {
            backend.destroy_buffer(info.id);
            return Err(Error::MappingFailed);
        }

        Ok(Self {
            inner: Arc::new(BufferObject {
                backend: Arc::clone(backend),
                desc: *desc,
                id: info.id,
                gpu_address: info.gpu_address,
                cpu_address: info.cpu_address,
            }),
        })
    }

    /// Backend identifier
    pub fn id(&self) -> ResourceId {
        self.inner.id
    }

    /// Size in bytes
    pub fn size(&self) -> u64 {
        self.inner.desc.size
    }

    /// Creation flags
    pub fn flags(&self) -> BufferFlags {
        self.inner.desc.flags
    }

    /// GPU address of byte 0
    pub fn gpu_address(&self) -> GpuAddr {
        self.inner.gpu_address
    }

    /// CPU mapping of byte 0
    pub fn cpu_address(&self) -> Option<NonNull<u8>> {
        self.inner.cpu_address
    }

    /// Whether both handles refer to the same backend buffer
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for NativeBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeBuffer")
            .field("id", &self.inner.id)
            .field("size", &self.inner.desc.size)
            .field("gpu_address", &self.inner.gpu_address)
            .finish()
    }
}

static_assertions::assert_impl_all!(NativeDescriptorHeap: Send, Sync, Clone);
static_assertions::assert_impl_all!(NativeBuffer: Send, Sync, Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emulation::EmulatedDevice;
    use crate::types::DescriptorHeapFlags;

    fn backend() -> (Arc<EmulatedDevice>, Arc<dyn DeviceBackend>) {
        let device = Arc::new(EmulatedDevice::new());
        let backend: Arc<dyn DeviceBackend> = device.clone();
        (device, backend)
    }

    #[test]
    fn test_heap_destroyed_with_last_clone() {
        let (device, backend) = backend();
        let desc = DescriptorHeapDesc::cpu_only(DescriptorHeapType::Rtv, 16);
        let heap = NativeDescriptorHeap::create(&backend, &desc).unwrap();
        let clone = heap.clone();
        assert_eq!(device.live_heap_count(), 1);

        drop(heap);
        assert_eq!(device.live_heap_count(), 1);
        drop(clone);
        assert_eq!(device.live_heap_count(), 0);
    }

    #[test]
    fn test_rejects_shader_visible_rtv() {
        let (_device, backend) = backend();
        let desc = DescriptorHeapDesc {
            heap_type: DescriptorHeapType::Rtv,
            num_descriptors: 8,
            flags: DescriptorHeapFlags::SHADER_VISIBLE,
        };
        assert_eq!(
            NativeDescriptorHeap::create(&backend, &desc).unwrap_err(),
            Error::InvalidParameter
        );
    }

    #[test]
    fn test_shader_visible_heap_has_gpu_start() {
        let (_device, backend) = backend();
        let desc = DescriptorHeapDesc::shader_visible(DescriptorHeapType::CbvSrvUav, 32);
        let heap = NativeDescriptorHeap::create(&backend, &desc).unwrap();
        assert!(heap.gpu_start().is_some());
        assert!(heap.descriptor_size() > 0);
    }

    #[test]
    fn test_buffer_mapping() {
        let (device, backend) = backend();
        let buffer = NativeBuffer::create(&backend, &BufferDesc::upload(4096)).unwrap();
        assert!(buffer.cpu_address().is_some());
        assert!(!buffer.gpu_address().is_null());
        assert_eq!(device.live_buffer_count(), 1);
        drop(buffer);
        assert_eq!(device.live_buffer_count(), 0);
    }
}
