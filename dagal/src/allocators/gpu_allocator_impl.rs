/// Implements allocation through [`gpu_allocator`]
use std::sync::{Arc, Mutex};

use anyhow::Result;
use ash::vk;
use derivative::Derivative;

use super::MemoryLocation;

/// Shared handle to a [`gpu_allocator::vulkan::Allocator`]
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct GpuAllocator {
    #[derivative(Debug = "ignore")]
    handle: Arc<Mutex<gpu_allocator::vulkan::Allocator>>,
}

/// A live allocation which returns itself to the allocator on drop
#[derive(Derivative)]
#[derivative(Debug)]
pub struct GpuAllocation {
    #[derivative(Debug = "ignore")]
    allocator: GpuAllocator,
    handle: Option<gpu_allocator::vulkan::Allocation>,
}

impl GpuAllocator {
    pub fn new(
        instance: ash::Instance,
        device: ash::Device,
        physical_device: vk::PhysicalDevice,
    ) -> Result<Self> {
        let allocator =
            gpu_allocator::vulkan::Allocator::new(&gpu_allocator::vulkan::AllocatorCreateDesc {
                instance,
                device,
                physical_device,
                debug_settings: Default::default(),
                buffer_device_address: false,
                allocation_sizes: Default::default(),
            })?;
        Ok(Self {
            handle: Arc::new(Mutex::new(allocator)),
        })
    }

    pub fn allocate(
        &self,
        name: &str,
        requirements: vk::MemoryRequirements,
        location: MemoryLocation,
    ) -> Result<GpuAllocation> {
        let allocation = self
            .handle
            .lock()
            .map_err(|_| crate::DagalError::PoisonError)?
            .allocate(&gpu_allocator::vulkan::AllocationCreateDesc {
                name,
                requirements,
                location: gpu_allocator::MemoryLocation::from(location),
                linear: true,
                allocation_scheme: gpu_allocator::vulkan::AllocationScheme::GpuAllocatorManaged,
            })?;
        Ok(GpuAllocation {
            allocator: self.clone(),
            handle: Some(allocation),
        })
    }

    fn free_impl(&self, allocation: &mut GpuAllocation) -> Result<()> {
        if let Some(handle) = allocation.handle.take() {
            self.handle
                .lock()
                .map_err(|_| crate::DagalError::PoisonError)?
                .free(handle)?;
        }
        Ok(())
    }
}

impl GpuAllocation {
    /// Get the underlying [`vk::DeviceMemory`]
    pub fn memory(&self) -> Result<vk::DeviceMemory> {
        let handle = self
            .handle
            .as_ref()
            .ok_or(crate::DagalError::AllocationError)?;
        Ok(unsafe { handle.memory() })
    }

    /// Get the offset of the allocation inside its memory block
    pub fn offset(&self) -> Result<vk::DeviceSize> {
        Ok(self
            .handle
            .as_ref()
            .ok_or(crate::DagalError::AllocationError)?
            .offset())
    }

    /// Get the persistently mapped pointer, if the memory is host visible
    pub fn mapped_ptr(&self) -> Option<std::ptr::NonNull<u8>> {
        self.handle
            .as_ref()
            .and_then(|handle| handle.mapped_ptr())
            .map(|ptr| ptr.cast::<u8>())
    }
}

impl Drop for GpuAllocation {
    fn drop(&mut self) {
        let allocator = self.allocator.clone();
        if let Err(e) = allocator.free_impl(self) {
            tracing::error!("Failed to free allocation: {e}");
        }
    }
}

impl From<MemoryLocation> for gpu_allocator::MemoryLocation {
    fn from(value: MemoryLocation) -> Self {
        match value {
            MemoryLocation::GpuOnly => gpu_allocator::MemoryLocation::GpuOnly,
            MemoryLocation::CpuToGpu => gpu_allocator::MemoryLocation::CpuToGpu,
            MemoryLocation::GpuToCpu => gpu_allocator::MemoryLocation::GpuToCpu,
        }
    }
}

unsafe impl Send for GpuAllocator {}
unsafe impl Sync for GpuAllocator {}
unsafe impl Send for GpuAllocation {}
unsafe impl Sync for GpuAllocation {}
