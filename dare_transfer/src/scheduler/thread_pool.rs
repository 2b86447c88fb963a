//! Secondary command buffers owned by one thread.
use std::sync::Arc;

use anyhow::Result;
use dagal::command::{CommandBufferLevel, CommandBufferUsage};
use dagal::Device;
use derivative::Derivative;

use crate::context::TransferContext;
use crate::signal::{Completion, CompletionSignal, ResourceKeeper};

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct SecondaryBuffer<D: Device> {
    #[derivative(Debug = "ignore")]
    command_buffer: Arc<D::CommandBuffer>,
    signal: CompletionSignal,
    keeper: ResourceKeeper,
    /// Primary buffer this was last executed from, until that primary retires
    parent: Option<usize>,
    recording: bool,
}

impl<D: Device> SecondaryBuffer<D> {
    fn is_idle(&self) -> bool {
        !self.recording && self.parent.is_none()
    }

    fn context(&self) -> TransferContext<D> {
        TransferContext::new(
            self.command_buffer.clone(),
            self.signal.clone(),
            self.keeper.clone(),
        )
    }
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct ThreadTransferPool<D: Device> {
    buffers: Vec<SecondaryBuffer<D>>,
    #[derivative(Debug = "ignore")]
    command_pool: D::CommandPool,
    /// The owning thread has exited
    pub(crate) exited: bool,
}

impl<D: Device> ThreadTransferPool<D> {
    pub(crate) fn new(device: &D) -> Result<Self> {
        Ok(Self {
            buffers: Vec::new(),
            command_pool: device.create_command_pool()?,
            exited: false,
        })
    }

    /// A buffer that is recording, starting one if needed
    pub(crate) fn acquire(&mut self, device: &D) -> Result<TransferContext<D>> {
        if let Some(buffer) = self.buffers.iter().find(|buffer| buffer.recording) {
            return Ok(buffer.context());
        }
        if let Some(buffer) = self.buffers.iter_mut().find(|buffer| buffer.is_idle()) {
            device.begin(&buffer.command_buffer, CommandBufferUsage::ONE_TIME_SUBMIT)?;
            buffer.recording = true;
            return Ok(buffer.context());
        }

        let command_buffer =
            device.allocate_command_buffer(&self.command_pool, CommandBufferLevel::Secondary)?;
        device.begin(&command_buffer, CommandBufferUsage::ONE_TIME_SUBMIT)?;
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Allocated secondary transfer buffer {}", self.buffers.len());
        let buffer = SecondaryBuffer {
            command_buffer: Arc::new(command_buffer),
            signal: CompletionSignal::new(),
            keeper: ResourceKeeper::new(),
            parent: None,
            recording: true,
        };
        let context = buffer.context();
        self.buffers.push(buffer);
        Ok(context)
    }

    pub(crate) fn is_recording(&self) -> bool {
        self.buffers.iter().any(|buffer| buffer.recording)
    }

    /// Any buffer recording or waiting on a primary
    pub(crate) fn in_use(&self) -> bool {
        self.buffers.iter().any(|buffer| !buffer.is_idle())
    }

    /// Ends every recording buffer and attaches it to primary `parent`
    pub(crate) fn end_recording(
        &mut self,
        device: &D,
        parent: usize,
        executed: &mut Vec<Arc<D::CommandBuffer>>,
    ) -> Result<()> {
        for buffer in self.buffers.iter_mut().filter(|buffer| buffer.recording) {
            device.end(&buffer.command_buffer)?;
            buffer.recording = false;
            buffer.parent = Some(parent);
            executed.push(buffer.command_buffer.clone());
        }
        Ok(())
    }

    /// Frees every buffer executed from primary `parent`, returning how many there were.
    ///
    /// Their callbacks and kept resources are pushed to `completed` for the caller to complete.
    pub(crate) fn retire(&mut self, parent: usize, completed: &mut Vec<Completion>) -> usize {
        let mut retired = 0;
        for buffer in self
            .buffers
            .iter_mut()
            .filter(|buffer| buffer.parent == Some(parent))
        {
            completed.push(Completion::take(&buffer.signal, &buffer.keeper));
            buffer.parent = None;
            retired += 1;
        }
        retired
    }

    pub(crate) fn buffer_count(&self) -> usize {
        self.buffers.len()
    }
}
