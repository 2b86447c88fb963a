//! The device interface consumed by everything above the graphics API.
//!
//! [`Device`] is deliberately small: buffers, command pools, command buffers and fences, plus
//! the handful of commands needed to move bytes around. Implementations are
//! [`VulkanDevice`](crate::device::VulkanDevice) and the in-memory [`TestDevice`].
use std::ptr::NonNull;

use anyhow::Result;

use crate::command::{BufferCopy, CommandBufferLevel, CommandBufferUsage};
use crate::resource::BufferCreateInfo;
use crate::sync::MemoryBarrier;

pub mod test_device;
#[cfg(feature = "vulkan")]
pub mod vulkan;

pub use test_device::{TestCommand, TestDevice, TestSubmission};
#[cfg(feature = "vulkan")]
pub use vulkan::{VulkanDevice, VulkanDeviceCreateInfo};

pub trait Device: Send + Sync + 'static {
    type Buffer: Send + Sync + 'static;
    type CommandPool: Send + Sync + 'static;
    type CommandBuffer: Send + Sync + 'static;
    type Fence: Send + Sync + 'static;

    /// Create a buffer of `size` bytes
    fn create_buffer(&self, create_info: BufferCreateInfo<'_>) -> Result<Self::Buffer>;

    /// Persistently mapped pointer to the start of a host visible buffer
    fn map(&self, buffer: &Self::Buffer) -> Result<NonNull<u8>>;

    fn buffer_size(&self, buffer: &Self::Buffer) -> u64;

    /// Create a command pool whose buffers may be reset individually
    fn create_command_pool(&self) -> Result<Self::CommandPool>;

    fn allocate_command_buffer(
        &self,
        pool: &Self::CommandPool,
        level: CommandBufferLevel,
    ) -> Result<Self::CommandBuffer>;

    /// Begin recording, implicitly resetting anything previously recorded
    fn begin(&self, command_buffer: &Self::CommandBuffer, usage: CommandBufferUsage) -> Result<()>;

    fn end(&self, command_buffer: &Self::CommandBuffer) -> Result<()>;

    fn cmd_copy_buffer(
        &self,
        command_buffer: &Self::CommandBuffer,
        src: &Self::Buffer,
        dst: &Self::Buffer,
        regions: &[BufferCopy],
    );

    fn cmd_pipeline_barrier(&self, command_buffer: &Self::CommandBuffer, barrier: &MemoryBarrier);

    fn cmd_execute_commands(
        &self,
        primary: &Self::CommandBuffer,
        secondaries: &[&Self::CommandBuffer],
    );

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence>;

    /// Submit a primary command buffer, signaling `fence` once the device is done with it
    fn submit(&self, command_buffer: &Self::CommandBuffer, fence: &Self::Fence) -> Result<()>;

    /// Non-blocking "try wait"
    fn fence_signaled(&self, fence: &Self::Fence) -> Result<bool>;

    /// Blocks until the fence signals. There is no deadline.
    fn wait_fence(&self, fence: &Self::Fence) -> Result<()>;

    fn reset_fence(&self, fence: &Self::Fence) -> Result<()>;
}
