/// Handles synchronization
#[cfg(feature = "vulkan")]
pub mod fence;
pub mod memory_barrier;

#[cfg(feature = "vulkan")]
pub use fence::Fence;
pub use memory_barrier::{AccessFlags, MemoryBarrier, PipelineStage};
