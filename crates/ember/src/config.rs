//! # Device Configuration

use ember_core::{DescriptorHeapType, Error, Result, MAX_COMMAND_QUEUES};

// =============================================================================
// DEVICE CREATE INFO
// =============================================================================

/// Sizes of every device-owned pool
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DeviceCreateInfo {
    /// Descriptors per CPU heap, indexed by [`DescriptorHeapType::index`]
    pub cpu_descriptor_heap_allocation_size: [u32; DescriptorHeapType::COUNT],
    /// Static region of each shader-visible heap (CBV/SRV/UAV, sampler)
    pub gpu_descriptor_heap_size: [u32; DescriptorHeapType::SHADER_VISIBLE_COUNT],
    /// Dynamic region of each shader-visible heap
    pub gpu_descriptor_heap_dynamic_size: [u32; DescriptorHeapType::SHADER_VISIBLE_COUNT],
    /// Chunk size contexts request from the dynamic region
    pub dynamic_descriptor_allocation_chunk_size: [u32; DescriptorHeapType::SHADER_VISIBLE_COUNT],
    /// Dynamic memory pages created up front
    pub num_dynamic_heap_pages_to_reserve: u32,
    /// Dynamic memory page size (bytes)
    pub dynamic_heap_page_size: u64,
    /// First ring size of each context's upload heap (bytes)
    pub upload_heap_initial_size: u64,
    /// Hardware queues the device drives
    pub num_command_queues: usize,
}

impl DeviceCreateInfo {
    /// Standard preset
    pub fn standard() -> Self {
        Self {
            cpu_descriptor_heap_allocation_size: [8192, 2048, 1024, 1024],
            gpu_descriptor_heap_size: [16384, 1024],
            gpu_descriptor_heap_dynamic_size: [8192, 1024],
            dynamic_descriptor_allocation_chunk_size: [256, 32],
            num_dynamic_heap_pages_to_reserve: 4,
            dynamic_heap_page_size: 1024 * 1024,
            upload_heap_initial_size: 1024 * 1024,
            num_command_queues: 1,
        }
    }

    /// Small preset (tools, tests)
    pub fn small() -> Self {
        Self {
            cpu_descriptor_heap_allocation_size: [256, 64, 64, 64],
            gpu_descriptor_heap_size: [1024, 128],
            gpu_descriptor_heap_dynamic_size: [1024, 128],
            dynamic_descriptor_allocation_chunk_size: [64, 16],
            num_dynamic_heap_pages_to_reserve: 1,
            dynamic_heap_page_size: 64 * 1024,
            upload_heap_initial_size: 64 * 1024,
            num_command_queues: 1,
        }
    }

    /// Large preset
    pub fn large() -> Self {
        Self::standard()
            .with_cpu_heap_size(DescriptorHeapType::CbvSrvUav, 32768)
            .with_gpu_heap_size(DescriptorHeapType::CbvSrvUav, 65536, 32768)
            .with_gpu_heap_size(DescriptorHeapType::Sampler, 1024, 1024)
            .with_dynamic_heap_pages(16, 4 * 1024 * 1024)
            .with_upload_heap_size(8 * 1024 * 1024)
    }

    /// With CPU heap size for `heap_type`
    pub fn with_cpu_heap_size(mut self, heap_type: DescriptorHeapType, size: u32) -> Self {
        self.cpu_descriptor_heap_allocation_size[heap_type.index()] = size;
        self
    }

    /// With static and dynamic region sizes for a shader-visible heap type.
    /// Ignored for CPU-only types.
    pub fn with_gpu_heap_size(
        mut self,
        heap_type: DescriptorHeapType,
        static_size: u32,
        dynamic_size: u32,
    ) -> Self {
        if heap_type.can_be_shader_visible() {
            self.gpu_descriptor_heap_size[heap_type.index()] = static_size;
            self.gpu_descriptor_heap_dynamic_size[heap_type.index()] = dynamic_size;
        }
        self
    }

    /// With dynamic descriptor chunk size for a shader-visible heap type
    pub fn with_dynamic_chunk_size(mut self, heap_type: DescriptorHeapType, size: u32) -> Self {
        if heap_type.can_be_shader_visible() {
            self.dynamic_descriptor_allocation_chunk_size[heap_type.index()] = size;
        }
        self
    }

    /// With dynamic memory pages
    pub fn with_dynamic_heap_pages(mut self, num_to_reserve: u32, page_size: u64) -> Self {
        self.num_dynamic_heap_pages_to_reserve = num_to_reserve;
        self.dynamic_heap_page_size = page_size;
        self
    }

    /// With upload heap initial size
    pub fn with_upload_heap_size(mut self, size: u64) -> Self {
        self.upload_heap_initial_size = size;
        self
    }

    /// With command queue count
    pub fn with_command_queues(mut self, count: usize) -> Self {
        self.num_command_queues = count;
        self
    }

    /// Reject sizes no pool can be built with
    pub fn validate(&self) -> Result<()> {
        let descriptor_sizes = self
            .cpu_descriptor_heap_allocation_size
            .iter()
            .chain(&self.gpu_descriptor_heap_size)
            .chain(&self.gpu_descriptor_heap_dynamic_size)
            .chain(&self.dynamic_descriptor_allocation_chunk_size);
        for &size in descriptor_sizes {
            if size == 0 {
                return Err(Error::InvalidParameter);
            }
        }

        if self.dynamic_heap_page_size == 0
            || self.upload_heap_initial_size == 0
            || self.num_command_queues == 0
            || self.num_command_queues > MAX_COMMAND_QUEUES
        {
            return Err(Error::InvalidParameter);
        }

        Ok(())
    }
}

impl Default for DeviceCreateInfo {
    fn default() -> Self {
        Self::standard()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_presets_are_valid() {
        assert!(DeviceCreateInfo::standard().validate().is_ok());
        assert!(DeviceCreateInfo::small().validate().is_ok());
        assert!(DeviceCreateInfo::large().validate().is_ok());
        assert_eq!(DeviceCreateInfo::default(), DeviceCreateInfo::standard());
    }

    #[test]
    fn test_standard_sizes() {
        let info = DeviceCreateInfo::standard();
        assert_eq!(info.cpu_descriptor_heap_allocation_size, [8192, 2048, 1024, 1024]);
        assert_eq!(info.gpu_descriptor_heap_size, [16384, 1024]);
        assert_eq!(info.gpu_descriptor_heap_dynamic_size, [8192, 1024]);
        assert_eq!(info.dynamic_descriptor_allocation_chunk_size, [256, 32]);
        assert_eq!(info.num_dynamic_heap_pages_to_reserve, 4);
        assert_eq!(info.dynamic_heap_page_size, 1 << 20);
    }

    #[test]
    fn test_cpu_only_types_ignore_gpu_sizes() {
        let info = DeviceCreateInfo::standard().with_gpu_heap_size(DescriptorHeapType::Rtv, 1, 1);
        assert_eq!(info, DeviceCreateInfo::standard());
    }

    #[test]
    fn test_validate_rejects_zero_sizes() {
        let info = DeviceCreateInfo::standard().with_cpu_heap_size(DescriptorHeapType::Dsv, 0);
        assert_eq!(info.validate(), Err(Error::InvalidParameter));

        let info = DeviceCreateInfo::standard().with_command_queues(0);
        assert_eq!(info.validate(), Err(Error::InvalidParameter));

        let info = DeviceCreateInfo::standard().with_command_queues(MAX_COMMAND_QUEUES + 1);
        assert_eq!(info.validate(), Err(Error::InvalidParameter));

        let info = DeviceCreateInfo::standard().with_dynamic_heap_pages(0, 0);
        assert_eq!(info.validate(), Err(Error::InvalidParameter));
    }
}
