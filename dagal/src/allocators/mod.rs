/// Memory placement and the allocator backing Vulkan buffers
#[cfg(feature = "vulkan")]
pub mod gpu_allocator_impl;
#[cfg(feature = "vulkan")]
pub use gpu_allocator_impl::*;

pub mod memory_type;

pub use memory_type::*;
