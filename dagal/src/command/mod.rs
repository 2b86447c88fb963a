#[cfg(feature = "vulkan")]
pub mod command_buffer;
#[cfg(feature = "vulkan")]
pub mod command_pool;

#[cfg(feature = "vulkan")]
pub use command_buffer::CommandBuffer;
#[cfg(feature = "vulkan")]
pub use command_pool::CommandPool;

/// Whether a command buffer is submitted directly or executed from another command buffer
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum CommandBufferLevel {
    Primary,
    Secondary,
}

bitflags::bitflags! {
    /// Hints given when recording begins
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct CommandBufferUsage: u32 {
        const ONE_TIME_SUBMIT = 1 << 0;
        const SIMULTANEOUS_USE = 1 << 1;
    }
}

/// A single region of a buffer to buffer copy
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct BufferCopy {
    pub src_offset: u64,
    pub dst_offset: u64,
    pub size: u64,
}
