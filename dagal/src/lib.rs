pub mod allocators;
pub mod command;
pub mod device;
pub mod error;
pub mod resource;
pub mod sync;
pub mod traits;
pub mod util;

pub use device::Device;
pub use error::DagalError;

// Re-exports
#[cfg(feature = "vulkan")]
pub use {ash, gpu_allocator};
