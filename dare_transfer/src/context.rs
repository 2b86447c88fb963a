use std::sync::Arc;

use dagal::Device;
use derivative::Derivative;

use crate::signal::{CompletionSignal, ResourceKeeper};

/// Everything needed to record transfer work.
///
/// Handed out by [`TransferScheduler::begin_transfer`](crate::TransferScheduler::begin_transfer).
/// Recording must be finished before the next
/// [`TransferScheduler::submit_transfers`](crate::TransferScheduler::submit_transfers).
#[derive(Derivative)]
#[derivative(Debug(bound = ""), Clone(bound = ""))]
pub struct TransferContext<D: Device> {
    #[derivative(Debug = "ignore")]
    command_buffer: Arc<D::CommandBuffer>,
    signal: CompletionSignal,
    keeper: ResourceKeeper,
}

impl<D: Device> TransferContext<D> {
    /// Wrap a command buffer that is already recording
    pub fn new(
        command_buffer: Arc<D::CommandBuffer>,
        signal: CompletionSignal,
        keeper: ResourceKeeper,
    ) -> Self {
        Self {
            command_buffer,
            signal,
            keeper,
        }
    }

    pub fn command_buffer(&self) -> &D::CommandBuffer {
        &self.command_buffer
    }

    /// Fired once the work recorded here has finished on the device
    pub fn signal(&self) -> &CompletionSignal {
        &self.signal
    }

    /// Resources kept alive until the work recorded here has finished on the device
    pub fn keeper(&self) -> &ResourceKeeper {
        &self.keeper
    }
}
