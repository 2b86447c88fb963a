use anyhow::Result;
use ash::vk;
use derivative::Derivative;
#[allow(unused_imports)]
use tracing::trace;

use crate::command::{CommandBuffer, CommandBufferLevel};
use crate::traits::Destructible;

#[derive(Derivative)]
#[derivative(Debug)]
pub struct CommandPool {
    handle: vk::CommandPool,
    #[derivative(Debug = "ignore")]
    device: ash::Device,
}

impl CommandPool {
    pub fn new(
        device: ash::Device,
        queue_family_index: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let handle = unsafe {
            device.create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .flags(flags)
                    .queue_family_index(queue_family_index),
                None,
            )?
        };

        #[cfg(feature = "log-lifetimes")]
        trace!("Created VkCommandPool {:p}", handle);

        Ok(Self { handle, device })
    }

    pub fn handle(&self) -> vk::CommandPool {
        self.handle
    }

    pub fn get_handle(&self) -> &vk::CommandPool {
        &self.handle
    }

    /// Allocate command buffers from a command pool
    pub fn allocate(&self, count: u32, level: CommandBufferLevel) -> Result<Vec<CommandBuffer>> {
        Ok(unsafe {
            self.device.allocate_command_buffers(
                &vk::CommandBufferAllocateInfo::default()
                    .command_pool(self.handle)
                    .level(vk::CommandBufferLevel::from(level))
                    .command_buffer_count(count),
            )
        }?
        .into_iter()
        .map(|buffer| CommandBuffer::new(buffer, self.device.clone(), level))
        .collect::<Vec<CommandBuffer>>())
    }
}

impl Destructible for CommandPool {
    fn destroy(&mut self) {
        #[cfg(feature = "log-lifetimes")]
        trace!("Destroying VkCommandPool {:p}", self.handle);

        unsafe {
            self.device.destroy_command_pool(self.handle, None);
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        self.destroy();
    }
}

impl From<CommandBufferLevel> for vk::CommandBufferLevel {
    fn from(value: CommandBufferLevel) -> Self {
        match value {
            CommandBufferLevel::Primary => vk::CommandBufferLevel::PRIMARY,
            CommandBufferLevel::Secondary => vk::CommandBufferLevel::SECONDARY,
        }
    }
}
