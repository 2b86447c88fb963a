use crate::allocators::MemoryLocation;

#[cfg(feature = "vulkan")]
pub mod buffer;
#[cfg(feature = "vulkan")]
pub use buffer::Buffer;

bitflags::bitflags! {
    /// API neutral buffer usage flags
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
    pub struct BufferUsage: u32 {
        const TRANSFER_SRC = 1 << 0;
        const TRANSFER_DST = 1 << 1;
        const UNIFORM = 1 << 2;
        const STORAGE = 1 << 3;
        const INDEX = 1 << 4;
        const VERTEX = 1 << 5;
        const INDIRECT = 1 << 6;
    }
}

/// Everything needed to create a buffer through a [`Device`](crate::Device)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BufferCreateInfo<'a> {
    /// Debug name of the buffer
    pub name: &'a str,
    pub size: u64,
    pub usage: BufferUsage,
    pub location: MemoryLocation,
}
