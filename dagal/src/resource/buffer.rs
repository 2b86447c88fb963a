use std::ptr::NonNull;

use anyhow::Result;
use ash::vk;
use derivative::Derivative;
#[allow(unused_imports)]
use tracing::trace;

use crate::allocators::{GpuAllocation, GpuAllocator};
use crate::resource::{BufferCreateInfo, BufferUsage};
use crate::traits::Destructible;

/// A [`vk::Buffer`] bound to its own [`GpuAllocation`]
#[derive(Derivative)]
#[derivative(Debug)]
pub struct Buffer {
    handle: vk::Buffer,
    #[derivative(Debug = "ignore")]
    device: ash::Device,
    allocation: Option<GpuAllocation>,
    size: vk::DeviceSize,
}

impl Buffer {
    pub fn new(
        device: ash::Device,
        allocator: &GpuAllocator,
        create_info: BufferCreateInfo<'_>,
    ) -> Result<Self> {
        let handle = unsafe {
            device.create_buffer(
                &vk::BufferCreateInfo::default()
                    .size(create_info.size)
                    .usage(vk::BufferUsageFlags::from(create_info.usage))
                    .sharing_mode(vk::SharingMode::EXCLUSIVE),
                None,
            )?
        };
        let requirements = unsafe { device.get_buffer_memory_requirements(handle) };
        let allocation =
            match allocator.allocate(create_info.name, requirements, create_info.location) {
                Ok(allocation) => allocation,
                Err(e) => {
                    unsafe { device.destroy_buffer(handle, None) };
                    return Err(e);
                }
            };
        unsafe { device.bind_buffer_memory(handle, allocation.memory()?, allocation.offset()?)? };

        #[cfg(feature = "log-lifetimes")]
        trace!("Created VkBuffer {:p} ({})", handle, create_info.name);

        Ok(Self {
            handle,
            device,
            allocation: Some(allocation),
            size: create_info.size,
        })
    }

    pub fn handle(&self) -> vk::Buffer {
        self.handle
    }

    pub fn get_handle(&self) -> &vk::Buffer {
        &self.handle
    }

    pub fn size(&self) -> vk::DeviceSize {
        self.size
    }

    /// Acquire a mapped pointer to the buffer allocation
    pub fn mapped_ptr(&self) -> Option<NonNull<u8>> {
        self.allocation
            .as_ref()
            .and_then(|allocation| allocation.mapped_ptr())
    }
}

impl Destructible for Buffer {
    fn destroy(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkBuffer {:p}", self.handle);

        if self.handle != vk::Buffer::null() {
            unsafe {
                self.device.destroy_buffer(self.handle, None);
            }
            self.handle = vk::Buffer::null();
        }
        self.allocation.take();
    }
}

impl Drop for Buffer {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl From<BufferUsage> for vk::BufferUsageFlags {
    fn from(value: BufferUsage) -> Self {
        let mut flags = vk::BufferUsageFlags::empty();
        for (usage, vk_usage) in [
            (BufferUsage::TRANSFER_SRC, vk::BufferUsageFlags::TRANSFER_SRC),
            (BufferUsage::TRANSFER_DST, vk::BufferUsageFlags::TRANSFER_DST),
            (BufferUsage::UNIFORM, vk::BufferUsageFlags::UNIFORM_BUFFER),
            (BufferUsage::STORAGE, vk::BufferUsageFlags::STORAGE_BUFFER),
            (BufferUsage::INDEX, vk::BufferUsageFlags::INDEX_BUFFER),
            (BufferUsage::VERTEX, vk::BufferUsageFlags::VERTEX_BUFFER),
            (BufferUsage::INDIRECT, vk::BufferUsageFlags::INDIRECT_BUFFER),
        ] {
            if value.contains(usage) {
                flags |= vk_usage;
            }
        }
        flags
    }
}
