use std::ptr::NonNull;
use std::sync::Mutex;

use anyhow::Result;
use ash::vk;
use derivative::Derivative;

use crate::allocators::GpuAllocator;
use crate::command::{BufferCopy, CommandBuffer, CommandBufferLevel, CommandBufferUsage, CommandPool};
use crate::resource::{Buffer, BufferCreateInfo};
use crate::sync::{Fence, MemoryBarrier};
use crate::DagalError;

pub struct VulkanDeviceCreateInfo {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,
    /// Queue all submissions go to. It must support transfer operations.
    pub queue: vk::Queue,
    pub queue_family_index: u32,
}

/// [`Device`](super::Device) implemented on top of a Vulkan 1.3 logical device.
///
/// The logical device itself is borrowed: dropping a [`VulkanDevice`] does not destroy it, and
/// every resource created through this device must be dropped before the logical device is.
#[derive(Derivative)]
#[derivative(Debug)]
pub struct VulkanDevice {
    #[derivative(Debug = "ignore")]
    handle: ash::Device,
    queue: Mutex<vk::Queue>,
    queue_family_index: u32,
    allocator: GpuAllocator,
}

impl VulkanDevice {
    pub fn new(create_info: VulkanDeviceCreateInfo) -> Result<Self> {
        let allocator = GpuAllocator::new(
            create_info.instance,
            create_info.device.clone(),
            create_info.physical_device,
        )?;
        Ok(Self {
            handle: create_info.device,
            queue: Mutex::new(create_info.queue),
            queue_family_index: create_info.queue_family_index,
            allocator,
        })
    }

    pub fn get_handle(&self) -> &ash::Device {
        &self.handle
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family_index
    }
}

impl super::Device for VulkanDevice {
    type Buffer = Buffer;
    type CommandPool = CommandPool;
    type CommandBuffer = CommandBuffer;
    type Fence = Fence;

    fn create_buffer(&self, create_info: BufferCreateInfo<'_>) -> Result<Buffer> {
        Buffer::new(self.handle.clone(), &self.allocator, create_info)
    }

    fn map(&self, buffer: &Buffer) -> Result<NonNull<u8>> {
        Ok(buffer.mapped_ptr().ok_or(DagalError::NoMappedPointer)?)
    }

    fn buffer_size(&self, buffer: &Buffer) -> u64 {
        buffer.size()
    }

    fn create_command_pool(&self) -> Result<CommandPool> {
        CommandPool::new(
            self.handle.clone(),
            self.queue_family_index,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    fn allocate_command_buffer(
        &self,
        pool: &CommandPool,
        level: CommandBufferLevel,
    ) -> Result<CommandBuffer> {
        Ok(pool
            .allocate(1, level)?
            .pop()
            .ok_or(DagalError::AllocationError)?)
    }

    fn begin(&self, command_buffer: &CommandBuffer, usage: CommandBufferUsage) -> Result<()> {
        command_buffer.begin(usage)
    }

    fn end(&self, command_buffer: &CommandBuffer) -> Result<()> {
        command_buffer.end()
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: &CommandBuffer,
        src: &Buffer,
        dst: &Buffer,
        regions: &[BufferCopy],
    ) {
        command_buffer.copy_buffer(src, dst, regions);
    }

    fn cmd_pipeline_barrier(&self, command_buffer: &CommandBuffer, barrier: &MemoryBarrier) {
        command_buffer.pipeline_barrier(barrier);
    }

    fn cmd_execute_commands(&self, primary: &CommandBuffer, secondaries: &[&CommandBuffer]) {
        primary.execute_commands(secondaries);
    }

    fn create_fence(&self, signaled: bool) -> Result<Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        Fence::new(self.handle.clone(), flags)
    }

    fn submit(&self, command_buffer: &CommandBuffer, fence: &Fence) -> Result<()> {
        let command_buffer_infos = [command_buffer.submit_info()];
        let submit_infos =
            [vk::SubmitInfo2::default().command_buffer_infos(&command_buffer_infos)];
        let queue = self.queue.lock().map_err(|_| DagalError::PoisonError)?;
        unsafe {
            self.handle
                .queue_submit2(*queue, &submit_infos, fence.handle())?
        };
        Ok(())
    }

    fn fence_signaled(&self, fence: &Fence) -> Result<bool> {
        fence.signaled()
    }

    fn wait_fence(&self, fence: &Fence) -> Result<()> {
        fence.wait(u64::MAX)
    }

    fn reset_fence(&self, fence: &Fence) -> Result<()> {
        fence.reset()
    }
}
