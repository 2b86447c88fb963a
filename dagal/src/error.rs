use std::sync::PoisonError;

#[cfg(feature = "vulkan")]
use ash::vk;
/// Possible errors
use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq, Hash)]
pub enum DagalError {
    #[error("Poisoned mutex")]
    PoisonError,

    #[error("Resource does not have a mapped pointer. You're most likely using GPU only")]
    NoMappedPointer,

    #[error("Allocation error")]
    AllocationError,

    #[error("Command buffer is not in the expected state")]
    InvalidCommandBufferState,

    #[error("Fence must be unsignaled when it is submitted")]
    FenceSignaled,

    #[error("Queue submission failed")]
    SubmitFailed,

    #[cfg(feature = "vulkan")]
    #[error(transparent)]
    VkError(#[from] vk::Result),
}

impl<T> From<PoisonError<T>> for DagalError {
    fn from(_: PoisonError<T>) -> Self {
        DagalError::PoisonError
    }
}
