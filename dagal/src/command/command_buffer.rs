//! Thin wrapper over a [`vk::CommandBuffer`].
//!
//! Unlike the pool it came from, a command buffer does not release anything on drop: it is
//! freed together with its [`CommandPool`](crate::command::CommandPool).
use anyhow::Result;
use ash::vk;
use derivative::Derivative;

use crate::command::{BufferCopy, CommandBufferLevel, CommandBufferUsage};
use crate::resource::Buffer;
use crate::sync::MemoryBarrier;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct CommandBuffer {
    handle: vk::CommandBuffer,
    #[derivative(Debug = "ignore")]
    device: ash::Device,
    level: CommandBufferLevel,
}

impl CommandBuffer {
    pub fn new(handle: vk::CommandBuffer, device: ash::Device, level: CommandBufferLevel) -> Self {
        Self {
            handle,
            device,
            level,
        }
    }

    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }

    pub fn get_handle(&self) -> &vk::CommandBuffer {
        &self.handle
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    /// Begins recording. The buffer's pool must allow individual resets, since beginning
    /// implicitly resets the buffer.
    pub fn begin(&self, usage: CommandBufferUsage) -> Result<()> {
        // Secondaries always carry inheritance info, even outside of a render pass
        let inheritance = vk::CommandBufferInheritanceInfo::default();
        let mut begin_info =
            vk::CommandBufferBeginInfo::default().flags(vk::CommandBufferUsageFlags::from(usage));
        if self.level == CommandBufferLevel::Secondary {
            begin_info = begin_info.inheritance_info(&inheritance);
        }
        unsafe { self.device.begin_command_buffer(self.handle, &begin_info)? };
        Ok(())
    }

    /// Ends recording into the command buffer
    pub fn end(&self) -> Result<()> {
        unsafe { self.device.end_command_buffer(self.handle)? };
        Ok(())
    }

    pub fn copy_buffer(&self, src: &Buffer, dst: &Buffer, regions: &[BufferCopy]) {
        let regions = regions
            .iter()
            .map(|region| {
                vk::BufferCopy2::default()
                    .src_offset(region.src_offset)
                    .dst_offset(region.dst_offset)
                    .size(region.size)
            })
            .collect::<Vec<vk::BufferCopy2>>();
        unsafe {
            self.device.cmd_copy_buffer2(
                self.handle,
                &vk::CopyBufferInfo2::default()
                    .src_buffer(src.handle())
                    .dst_buffer(dst.handle())
                    .regions(&regions),
            );
        }
    }

    pub fn pipeline_barrier(&self, barrier: &MemoryBarrier) {
        let barriers = [vk::MemoryBarrier2::from(barrier)];
        unsafe {
            self.device.cmd_pipeline_barrier2(
                self.handle,
                &vk::DependencyInfo::default().memory_barriers(&barriers),
            );
        }
    }

    pub fn execute_commands(&self, secondaries: &[&CommandBuffer]) {
        let handles = secondaries
            .iter()
            .map(|secondary| secondary.handle)
            .collect::<Vec<vk::CommandBuffer>>();
        unsafe {
            self.device.cmd_execute_commands(self.handle, &handles);
        }
    }

    /// Quickly acquire a [`VkCommandBufferSubmitInfo`](vk::CommandBufferSubmitInfo) for
    /// a single [`VkCommandBuffer`](vk::CommandBuffer).
    pub fn submit_info(&self) -> vk::CommandBufferSubmitInfo<'static> {
        vk::CommandBufferSubmitInfo::default().command_buffer(self.handle)
    }
}

impl From<CommandBufferUsage> for vk::CommandBufferUsageFlags {
    fn from(value: CommandBufferUsage) -> Self {
        let mut flags = vk::CommandBufferUsageFlags::empty();
        if value.contains(CommandBufferUsage::ONE_TIME_SUBMIT) {
            flags |= vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT;
        }
        if value.contains(CommandBufferUsage::SIMULTANEOUS_USE) {
            flags |= vk::CommandBufferUsageFlags::SIMULTANEOUS_USE;
        }
        flags
    }
}
