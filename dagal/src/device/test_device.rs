//! A [`Device`] that never touches a GPU.
//!
//! Every buffer is backed by host memory, commands are recorded into plain vectors and copy
//! commands are executed when the primary command buffer holding them is submitted. Fences either
//! signal at submission ([`TestDevice::new`]) or stay pending until
//! [`TestDevice::signal_all`] is called ([`TestDevice::manual`]), which lets tests hold GPU work
//! "in flight" for as long as they need.
use std::cell::UnsafeCell;
use std::fmt::{Debug, Formatter};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Result;

use super::Device;
use crate::allocators::MemoryLocation;
use crate::command::{BufferCopy, CommandBufferLevel, CommandBufferUsage};
use crate::resource::{BufferCreateInfo, BufferUsage};
use crate::sync::MemoryBarrier;
use crate::DagalError;

/// Host memory standing in for device memory
pub struct TestMemory {
    bytes: Box<[UnsafeCell<u8>]>,
}

unsafe impl Send for TestMemory {}
unsafe impl Sync for TestMemory {}

impl TestMemory {
    fn new(size: u64) -> Self {
        Self {
            bytes: std::iter::repeat_with(|| UnsafeCell::new(0u8))
                .take(size as usize)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        }
    }

    fn as_ptr(&self) -> *mut u8 {
        // UnsafeCell<u8> has the same layout as u8
        self.bytes.as_ptr() as *mut u8
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    fn read(&self, offset: u64, len: u64) -> Vec<u8> {
        assert!(offset + len <= self.len(), "read outside of test memory");
        let mut out = vec![0u8; len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.as_ptr().add(offset as usize),
                out.as_mut_ptr(),
                len as usize,
            );
        }
        out
    }

    fn copy_from(&self, src: &TestMemory, region: &BufferCopy) {
        assert!(
            region.src_offset + region.size <= src.len(),
            "copy source {:?} outside of {} bytes",
            region,
            src.len()
        );
        assert!(
            region.dst_offset + region.size <= self.len(),
            "copy destination {:?} outside of {} bytes",
            region,
            self.len()
        );
        unsafe {
            std::ptr::copy(
                src.as_ptr().add(region.src_offset as usize),
                self.as_ptr().add(region.dst_offset as usize),
                region.size as usize,
            );
        }
    }
}

impl Debug for TestMemory {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestMemory")
            .field("len", &self.bytes.len())
            .finish()
    }
}

#[derive(Debug)]
pub struct TestBuffer {
    id: u64,
    name: String,
    size: u64,
    usage: BufferUsage,
    location: MemoryLocation,
    memory: Arc<TestMemory>,
}

impl TestBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn location(&self) -> MemoryLocation {
        self.location
    }
}

/// A command as it was recorded
#[derive(Debug, Clone)]
pub enum TestCommand {
    CopyBuffer {
        src: u64,
        dst: u64,
        regions: Vec<BufferCopy>,
        src_memory: Arc<TestMemory>,
        dst_memory: Arc<TestMemory>,
    },
    PipelineBarrier(MemoryBarrier),
    /// Secondary command buffers, with their commands captured at record time
    ExecuteCommands {
        secondaries: Vec<u64>,
        commands: Vec<TestCommand>,
    },
}

impl TestCommand {
    pub fn is_copy(&self) -> bool {
        matches!(self, TestCommand::CopyBuffer { .. })
    }

    fn execute(&self) {
        match self {
            TestCommand::CopyBuffer {
                regions,
                src_memory,
                dst_memory,
                ..
            } => {
                for region in regions {
                    dst_memory.copy_from(src_memory, region);
                }
            }
            TestCommand::PipelineBarrier(_) => {}
            TestCommand::ExecuteCommands { commands, .. } => {
                for command in commands {
                    command.execute();
                }
            }
        }
    }
}

#[derive(Debug, Default)]
struct CommandBufferState {
    recording: bool,
    commands: Vec<TestCommand>,
}

#[derive(Debug)]
pub struct TestCommandBuffer {
    id: u64,
    level: CommandBufferLevel,
    state: Mutex<CommandBufferState>,
}

impl TestCommandBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn level(&self) -> CommandBufferLevel {
        self.level
    }

    pub fn is_recording(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .recording
    }

    /// Everything recorded since the last [`Device::begin`]
    pub fn commands(&self) -> Vec<TestCommand> {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .commands
            .clone()
    }

    pub fn copy_count(&self) -> usize {
        self.commands()
            .iter()
            .filter(|command| command.is_copy())
            .count()
    }

    fn record(&self, command: TestCommand) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        assert!(
            state.recording,
            "command recorded into command buffer {} which is not recording",
            self.id
        );
        state.commands.push(command);
    }
}

#[derive(Debug)]
pub struct TestCommandPool {
    id: u64,
}

impl TestCommandPool {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
pub struct TestFence {
    id: u64,
    signaled: Arc<AtomicBool>,
}

impl TestFence {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

/// A record of a single [`Device::submit`]
#[derive(Debug, Clone)]
pub struct TestSubmission {
    pub command_buffer: u64,
    pub fence: u64,
    pub commands: Vec<TestCommand>,
}

#[derive(Debug)]
pub struct TestDevice {
    auto_signal: bool,
    fail_next_submit: AtomicBool,
    next_id: AtomicU64,
    buffers_created: AtomicUsize,
    unsignaled: Mutex<Vec<Arc<AtomicBool>>>,
    submissions: Mutex<Vec<TestSubmission>>,
}

impl Default for TestDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl TestDevice {
    /// Fences signal as soon as their submission has executed
    pub fn new() -> Self {
        Self::with_auto_signal(true)
    }

    /// Fences stay unsignaled until [`Self::signal_all`]
    pub fn manual() -> Self {
        Self::with_auto_signal(false)
    }

    fn with_auto_signal(auto_signal: bool) -> Self {
        Self {
            auto_signal,
            fail_next_submit: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
            buffers_created: AtomicUsize::new(0),
            unsignaled: Mutex::new(Vec::new()),
            submissions: Mutex::new(Vec::new()),
        }
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Signals every fence submitted so far, returning how many were pending
    pub fn signal_all(&self) -> usize {
        let mut unsignaled = self.unsignaled.lock().unwrap_or_else(PoisonError::into_inner);
        let count = unsignaled.len();
        for fence in unsignaled.drain(..) {
            fence.store(true, Ordering::Release);
        }
        count
    }

    /// Makes the next submit return [`DagalError::SubmitFailed`] without executing anything
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::Relaxed);
    }

    pub fn submissions(&self) -> Vec<TestSubmission> {
        self.submissions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn buffers_created(&self) -> usize {
        self.buffers_created.load(Ordering::Relaxed)
    }

    /// Read back any buffer, host visible or not
    pub fn read_buffer(&self, buffer: &TestBuffer, offset: u64, len: u64) -> Vec<u8> {
        buffer.memory.read(offset, len)
    }
}

impl Device for TestDevice {
    type Buffer = TestBuffer;
    type CommandPool = TestCommandPool;
    type CommandBuffer = TestCommandBuffer;
    type Fence = TestFence;

    fn create_buffer(&self, create_info: BufferCreateInfo<'_>) -> Result<TestBuffer> {
        self.buffers_created.fetch_add(1, Ordering::Relaxed);
        Ok(TestBuffer {
            id: self.next_id(),
            name: create_info.name.to_string(),
            size: create_info.size,
            usage: create_info.usage,
            location: create_info.location,
            memory: Arc::new(TestMemory::new(create_info.size)),
        })
    }

    fn map(&self, buffer: &TestBuffer) -> Result<NonNull<u8>> {
        if !buffer.location.host_visible() {
            return Err(DagalError::NoMappedPointer.into());
        }
        Ok(NonNull::new(buffer.memory.as_ptr()).ok_or(DagalError::NoMappedPointer)?)
    }

    fn buffer_size(&self, buffer: &TestBuffer) -> u64 {
        buffer.size
    }

    fn create_command_pool(&self) -> Result<TestCommandPool> {
        Ok(TestCommandPool { id: self.next_id() })
    }

    fn allocate_command_buffer(
        &self,
        _pool: &TestCommandPool,
        level: CommandBufferLevel,
    ) -> Result<TestCommandBuffer> {
        Ok(TestCommandBuffer {
            id: self.next_id(),
            level,
            state: Mutex::new(CommandBufferState::default()),
        })
    }

    fn begin(&self, command_buffer: &TestCommandBuffer, _usage: CommandBufferUsage) -> Result<()> {
        let mut state = command_buffer
            .state
            .lock()
            .map_err(|_| DagalError::PoisonError)?;
        if state.recording {
            return Err(DagalError::InvalidCommandBufferState.into());
        }
        state.recording = true;
        state.commands.clear();
        Ok(())
    }

    fn end(&self, command_buffer: &TestCommandBuffer) -> Result<()> {
        let mut state = command_buffer
            .state
            .lock()
            .map_err(|_| DagalError::PoisonError)?;
        if !state.recording {
            return Err(DagalError::InvalidCommandBufferState.into());
        }
        state.recording = false;
        Ok(())
    }

    fn cmd_copy_buffer(
        &self,
        command_buffer: &TestCommandBuffer,
        src: &TestBuffer,
        dst: &TestBuffer,
        regions: &[BufferCopy],
    ) {
        command_buffer.record(TestCommand::CopyBuffer {
            src: src.id,
            dst: dst.id,
            regions: regions.to_vec(),
            src_memory: src.memory.clone(),
            dst_memory: dst.memory.clone(),
        });
    }

    fn cmd_pipeline_barrier(&self, command_buffer: &TestCommandBuffer, barrier: &MemoryBarrier) {
        command_buffer.record(TestCommand::PipelineBarrier(*barrier));
    }

    fn cmd_execute_commands(
        &self,
        primary: &TestCommandBuffer,
        secondaries: &[&TestCommandBuffer],
    ) {
        assert_eq!(primary.level, CommandBufferLevel::Primary);
        let mut commands = Vec::new();
        for secondary in secondaries {
            assert_eq!(secondary.level, CommandBufferLevel::Secondary);
            assert!(
                !secondary.is_recording(),
                "secondary command buffer {} executed while still recording",
                secondary.id
            );
            commands.extend(secondary.commands());
        }
        primary.record(TestCommand::ExecuteCommands {
            secondaries: secondaries.iter().map(|secondary| secondary.id).collect(),
            commands,
        });
    }

    fn create_fence(&self, signaled: bool) -> Result<TestFence> {
        Ok(TestFence {
            id: self.next_id(),
            signaled: Arc::new(AtomicBool::new(signaled)),
        })
    }

    fn submit(&self, command_buffer: &TestCommandBuffer, fence: &TestFence) -> Result<()> {
        if command_buffer.level != CommandBufferLevel::Primary || command_buffer.is_recording() {
            return Err(DagalError::InvalidCommandBufferState.into());
        }
        if fence.is_signaled() {
            return Err(DagalError::FenceSignaled.into());
        }
        if self.fail_next_submit.swap(false, Ordering::Relaxed) {
            return Err(DagalError::SubmitFailed.into());
        }
        let commands = command_buffer.commands();
        for command in commands.iter() {
            command.execute();
        }
        self.submissions
            .lock()
            .map_err(|_| DagalError::PoisonError)?
            .push(TestSubmission {
                command_buffer: command_buffer.id,
                fence: fence.id,
                commands,
            });
        if self.auto_signal {
            fence.signaled.store(true, Ordering::Release);
        } else {
            self.unsignaled
                .lock()
                .map_err(|_| DagalError::PoisonError)?
                .push(fence.signaled.clone());
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: &TestFence) -> Result<bool> {
        Ok(fence.is_signaled())
    }

    fn wait_fence(&self, fence: &TestFence) -> Result<()> {
        while !fence.is_signaled() {
            std::thread::yield_now();
        }
        Ok(())
    }

    fn reset_fence(&self, fence: &TestFence) -> Result<()> {
        fence.signaled.store(false, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(device: &TestDevice, size: u64, location: MemoryLocation) -> TestBuffer {
        device
            .create_buffer(BufferCreateInfo {
                name: "test",
                size,
                usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
                location,
            })
            .unwrap()
    }

    #[test]
    fn copies_run_on_submit() {
        let device = TestDevice::new();
        let src = buffer(&device, 16, MemoryLocation::CpuToGpu);
        let dst = buffer(&device, 16, MemoryLocation::GpuOnly);
        let ptr = device.map(&src).unwrap();
        unsafe { std::ptr::copy_nonoverlapping([1u8, 2, 3, 4].as_ptr(), ptr.as_ptr().add(4), 4) };

        let pool = device.create_command_pool().unwrap();
        let cmd = device
            .allocate_command_buffer(&pool, CommandBufferLevel::Primary)
            .unwrap();
        device.begin(&cmd, CommandBufferUsage::ONE_TIME_SUBMIT).unwrap();
        device.cmd_copy_buffer(
            &cmd,
            &src,
            &dst,
            &[BufferCopy {
                src_offset: 4,
                dst_offset: 8,
                size: 4,
            }],
        );
        device.end(&cmd).unwrap();
        // nothing moves until submission
        assert_eq!(device.read_buffer(&dst, 8, 4), vec![0, 0, 0, 0]);

        let fence = device.create_fence(false).unwrap();
        device.submit(&cmd, &fence).unwrap();
        assert!(fence.is_signaled());
        assert_eq!(device.read_buffer(&dst, 8, 4), vec![1, 2, 3, 4]);
        assert_eq!(device.submissions().len(), 1);
    }

    #[test]
    fn gpu_only_is_not_mappable() {
        let device = TestDevice::new();
        let dst = buffer(&device, 16, MemoryLocation::GpuOnly);
        assert!(device.map(&dst).is_err());
    }

    #[test]
    fn manual_fences_wait_for_signal_all() {
        let device = TestDevice::manual();
        let pool = device.create_command_pool().unwrap();
        let cmd = device
            .allocate_command_buffer(&pool, CommandBufferLevel::Primary)
            .unwrap();
        device.begin(&cmd, CommandBufferUsage::empty()).unwrap();
        device.end(&cmd).unwrap();
        let fence = device.create_fence(false).unwrap();
        device.submit(&cmd, &fence).unwrap();
        assert!(!device.fence_signaled(&fence).unwrap());
        assert_eq!(device.signal_all(), 1);
        assert!(device.fence_signaled(&fence).unwrap());
        device.wait_fence(&fence).unwrap();
    }

    #[test]
    fn injected_submit_failure() {
        let device = TestDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device
            .allocate_command_buffer(&pool, CommandBufferLevel::Primary)
            .unwrap();
        device.begin(&cmd, CommandBufferUsage::empty()).unwrap();
        device.end(&cmd).unwrap();
        let fence = device.create_fence(false).unwrap();
        device.fail_next_submit();
        let err = device.submit(&cmd, &fence).unwrap_err();
        assert_eq!(
            err.downcast_ref::<DagalError>(),
            Some(&DagalError::SubmitFailed)
        );
        assert!(device.submissions().is_empty());
        assert!(!fence.is_signaled());
        // only the next submit fails
        device.submit(&cmd, &fence).unwrap();
        assert!(fence.is_signaled());
    }

    #[test]
    fn recording_state_is_enforced() {
        let device = TestDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device
            .allocate_command_buffer(&pool, CommandBufferLevel::Primary)
            .unwrap();
        assert!(device.end(&cmd).is_err());
        device.begin(&cmd, CommandBufferUsage::empty()).unwrap();
        assert!(device.begin(&cmd, CommandBufferUsage::empty()).is_err());
        let fence = device.create_fence(false).unwrap();
        assert!(device.submit(&cmd, &fence).is_err());
    }

    #[test]
    fn signaled_fence_cannot_be_submitted() {
        let device = TestDevice::new();
        let pool = device.create_command_pool().unwrap();
        let cmd = device
            .allocate_command_buffer(&pool, CommandBufferLevel::Primary)
            .unwrap();
        device.begin(&cmd, CommandBufferUsage::empty()).unwrap();
        device.end(&cmd).unwrap();
        let fence = device.create_fence(true).unwrap();
        assert!(device.submit(&cmd, &fence).is_err());
        device.reset_fence(&fence).unwrap();
        device.submit(&cmd, &fence).unwrap();
    }
}
