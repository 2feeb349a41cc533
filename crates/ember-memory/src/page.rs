//! # Pages and Dynamic Allocations

use core::fmt;
use core::ptr::NonNull;

use ember_core::{BufferDesc, DeviceBackend, Error, GpuAddr, NativeBuffer, Result};

use alloc::sync::Arc;

// =============================================================================
// DYNAMIC PAGE
// =============================================================================

/// One persistently mapped GPU buffer handed between the shared pool and
/// per-context heaps.
#[derive(Debug)]
pub struct DynamicPage {
    buffer: NativeBuffer,
}

impl DynamicPage {
    /// Create a CPU-writable page of `size` bytes.
    pub fn create(backend: &Arc<dyn DeviceBackend>, size: u64) -> Result<Self> {
        let buffer = NativeBuffer::create(backend, &BufferDesc::upload(size))?;
        Ok(Self { buffer })
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.buffer.size()
    }

    /// Backing buffer.
    pub fn buffer(&self) -> &NativeBuffer {
        &self.buffer
    }

    /// GPU address of byte `offset`.
    pub fn gpu_address(&self, offset: u64) -> GpuAddr {
        self.buffer.gpu_address().offset(offset)
    }

    /// CPU address of byte `offset`.
    pub fn cpu_address(&self, offset: u64) -> Option<NonNull<u8>> {
        mapped_address(&self.buffer, offset)
    }

    /// Sub-range `[offset, offset + size)` as an allocation.
    pub fn suballocate(&self, offset: u64, size: u64) -> DynamicAllocation {
        DynamicAllocation::new(&self.buffer, offset, size)
    }
}

fn mapped_address(buffer: &NativeBuffer, offset: u64) -> Option<NonNull<u8>> {
    debug_assert!(offset <= buffer.size());
    buffer
        .cpu_address()
        // SAFETY: offset lies within the mapping
        .map(|base| unsafe { NonNull::new_unchecked(base.as_ptr().add(offset as usize)) })
}

// =============================================================================
// DYNAMIC ALLOCATION
// =============================================================================

/// A range of a dynamic buffer valid for the current frame.
///
/// The handle keeps the buffer alive, not the range. Once the frame that
/// produced it is finished and its fence value completes, the range is
/// recycled and may be handed out again, so CPU access through
/// [`write`](Self::write) and [`read`](Self::read) is `unsafe`.
pub struct DynamicAllocation {
    buffer: NativeBuffer,
    offset: u64,
    size: u64,
    cpu_address: Option<NonNull<u8>>,
    gpu_address: GpuAddr,
}

// SAFETY: the CPU address points into a mapping kept alive by `buffer`.
// Every access through it is an `unsafe` method whose caller guarantees
// the range is not used by another allocation.
unsafe impl Send for DynamicAllocation {}
// SAFETY: safe shared access only reads the stored addresses.
unsafe impl Sync for DynamicAllocation {}

impl DynamicAllocation {
    pub(crate) fn new(buffer: &NativeBuffer, offset: u64, size: u64) -> Self {
        debug_assert!(offset + size <= buffer.size());
        Self {
            buffer: buffer.clone(),
            offset,
            size,
            cpu_address: mapped_address(buffer, offset),
            gpu_address: buffer.gpu_address().offset(offset),
        }
    }

    /// Backing buffer.
    pub fn buffer(&self) -> &NativeBuffer {
        &self.buffer
    }

    /// Offset within the buffer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// GPU address of the first byte.
    pub fn gpu_address(&self) -> GpuAddr {
        self.gpu_address
    }

    /// CPU address of the first byte, if the buffer is mapped.
    pub fn cpu_address(&self) -> Option<NonNull<u8>> {
        self.cpu_address
    }

    /// Copy `data` to the start of the allocation.
    ///
    /// # Safety
    ///
    /// The frame that produced this allocation must not have been
    /// finished yet. After that the range may belong to a different
    /// allocation, or still be read by the GPU.
    pub unsafe fn write(&mut self, data: &[u8]) -> Result<()> {
        if data.len() as u64 > self.size {
            return Err(Error::InvalidParameter);
        }
        let dst = self.cpu_address.ok_or(Error::MappingFailed)?;
        // SAFETY: `dst..dst + size` is inside the live mapping, and the
        // caller guarantees no other allocation owns it.
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), dst.as_ptr(), data.len());
        }
        Ok(())
    }

    /// Read the allocation back. Test and debugging aid.
    ///
    /// # Safety
    ///
    /// Same contract as [`write`](Self::write).
    pub unsafe fn read(&self, out: &mut [u8]) -> Result<()> {
        if out.len() as u64 > self.size {
            return Err(Error::InvalidParameter);
        }
        let src = self.cpu_address.ok_or(Error::MappingFailed)?;
        // SAFETY: see `write`
        unsafe {
            core::ptr::copy_nonoverlapping(src.as_ptr(), out.as_mut_ptr(), out.len());
        }
        Ok(())
    }
}

impl fmt::Debug for DynamicAllocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DynamicAllocation")
            .field("buffer", &self.buffer.id())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .field("gpu_address", &self.gpu_address)
            .finish()
    }
}

static_assertions::assert_impl_all!(DynamicPage: Send, Sync);
static_assertions::assert_not_impl_any!(DynamicAllocation: Clone);

#[cfg(test)]
mod tests {
    use super::*;
    use ember_core::EmulatedDevice;

    #[test]
    fn test_suballocation_addresses() {
        let backend: Arc<dyn DeviceBackend> = Arc::new(EmulatedDevice::new());
        let page = DynamicPage::create(&backend, 1024).unwrap();
        let alloc = page.suballocate(256, 64);
        assert_eq!(alloc.gpu_address().raw(), page.gpu_address(0).raw() + 256);
        let base = page.cpu_address(0).unwrap().as_ptr() as usize;
        assert_eq!(alloc.cpu_address().unwrap().as_ptr() as usize, base + 256);
    }

    #[test]
    fn test_write_and_read_back() {
        let backend: Arc<dyn DeviceBackend> = Arc::new(EmulatedDevice::new());
        let page = DynamicPage::create(&backend, 128).unwrap();
        let mut a = page.suballocate(0, 4);
        let mut b = page.suballocate(4, 4);
        let mut out = [0u8; 4];
        // SAFETY: disjoint ranges of a page no frame has finished with
        unsafe {
            a.write(&[1, 2, 3, 4]).unwrap();
            b.write(&[5, 6, 7, 8]).unwrap();

            a.read(&mut out).unwrap();
            assert_eq!(out, [1, 2, 3, 4]);
            b.read(&mut out).unwrap();
            assert_eq!(out, [5, 6, 7, 8]);

            assert_eq!(a.write(&[0; 5]).unwrap_err(), Error::InvalidParameter);
        }
    }
}
