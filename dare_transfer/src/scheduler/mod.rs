//! Multi-threaded transfer recording.
//!
//! Each thread records into secondary command buffers from its own
//! [`ThreadTransferPool`](thread_pool::ThreadTransferPool). Once per frame a single thread calls
//! [`TransferScheduler::submit_transfers`], which executes everything recorded since the last
//! submission from one primary command buffer.
//!
//! A secondary buffer goes `idle -> recording -> attached to primary -> idle`. It only returns to
//! idle once its primary's fence has signaled. Its completion signal then fires and its resource
//! keeper is cleared, after the scheduler lock is released so callbacks may use the scheduler.
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread::ThreadId;

use anyhow::Result;
use crossbeam_channel::{Receiver, Sender};
use dagal::command::{CommandBufferLevel, CommandBufferUsage};
use dagal::Device;
use derivative::Derivative;

use crate::context::TransferContext;
use crate::signal::Completion;
use crate::util::lock;

mod retire;
mod thread_pool;

use thread_pool::ThreadTransferPool;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerCreateInfo {
    pub name: String,
    /// Usage of primary command buffers when recording begins
    pub primary_usage: CommandBufferUsage,
}

impl Default for SchedulerCreateInfo {
    fn default() -> Self {
        Self {
            name: String::from("transfer scheduler"),
            primary_usage: CommandBufferUsage::ONE_TIME_SUBMIT,
        }
    }
}

struct PrimaryBuffer<D: Device> {
    command_buffer: D::CommandBuffer,
    fence: D::Fence,
    /// Submitted and not yet seen signaled
    in_flight: bool,
}

struct SchedulerInner<D: Device> {
    primaries: Vec<PrimaryBuffer<D>>,
    threads: HashMap<ThreadId, ThreadTransferPool<D>>,
    command_pool: D::CommandPool,
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct TransferScheduler<D: Device> {
    name: String,
    primary_usage: CommandBufferUsage,
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    #[derivative(Debug = "ignore")]
    inner: Mutex<SchedulerInner<D>>,
    retired_sender: Sender<ThreadId>,
    retired_receiver: Receiver<ThreadId>,
}

impl<D: Device> TransferScheduler<D> {
    pub fn new(device: Arc<D>, create_info: SchedulerCreateInfo) -> Result<Self> {
        let command_pool = device.create_command_pool()?;
        let (retired_sender, retired_receiver) = crossbeam_channel::unbounded();
        Ok(Self {
            name: create_info.name,
            primary_usage: create_info.primary_usage,
            device,
            inner: Mutex::new(SchedulerInner {
                primaries: Vec::new(),
                threads: HashMap::new(),
                command_pool,
            }),
            retired_sender,
            retired_receiver,
        })
    }

    /// Starts or continues recording on the calling thread
    pub fn begin_transfer(&self) -> Result<TransferContext<D>> {
        self.begin_transfer_for(std::thread::current().id())
    }

    /// Starts or continues recording for `thread`.
    ///
    /// Only pools created from their own thread notice when it exits. Pools created on behalf of
    /// another thread are released with [`Self::retire_thread`].
    pub fn begin_transfer_for(&self, thread: ThreadId) -> Result<TransferContext<D>> {
        let mut inner = lock(&self.inner);
        let pool = match inner.threads.entry(thread) {
            Entry::Occupied(entry) => entry.into_mut(),
            Entry::Vacant(entry) => {
                let pool = ThreadTransferPool::new(&*self.device)?;
                if thread == std::thread::current().id() {
                    retire::arm(&self.retired_sender);
                }
                tracing::debug!("{} created a transfer pool for {:?}", self.name, thread);
                entry.insert(pool)
            }
        };
        pool.acquire(&self.device)
    }

    /// Submits everything recorded since the last submission.
    ///
    /// Returns `false` without submitting when no thread recorded anything. If recording or
    /// submitting the primary fails, the secondary buffers ended for it are abandoned: their
    /// signals fire and their keepers are cleared, since none of their commands reach the device.
    pub fn submit_transfers(&self) -> Result<bool> {
        let mut completed = Vec::new();
        let submitted = self.submit_locked(&mut completed);
        complete(completed);
        submitted
    }

    /// Removes the pools of exited threads once none of their buffers are in use.
    ///
    /// Returns how many pools were removed.
    pub fn clean_threads(&self) -> Result<usize> {
        let mut completed = Vec::new();
        let removed = self.clean_locked(&mut completed);
        complete(completed);
        removed
    }

    /// Marks `thread` as exited, for pools created through [`Self::begin_transfer_for`].
    ///
    /// Returns whether the thread had a pool.
    pub fn retire_thread(&self, thread: ThreadId) -> bool {
        match lock(&self.inner).threads.get_mut(&thread) {
            Some(pool) => {
                pool.exited = true;
                true
            }
            None => false,
        }
    }

    /// Blocks until every submission has finished, then completes all attached buffers
    pub fn wait_idle(&self) -> Result<()> {
        let mut completed = Vec::new();
        let waited = self.wait_idle_locked(&mut completed);
        complete(completed);
        waited
    }

    pub fn thread_pool_count(&self) -> usize {
        lock(&self.inner).threads.len()
    }

    pub fn primary_count(&self) -> usize {
        lock(&self.inner).primaries.len()
    }

    fn submit_locked(&self, completed: &mut Vec<Completion>) -> Result<bool> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        if !inner.threads.values().any(ThreadTransferPool::is_recording) {
            return Ok(false);
        }

        let index = self.acquire_primary(inner, completed)?;
        match self.record_primary(inner, index) {
            Ok(count) => {
                inner.primaries[index].in_flight = true;
                tracing::trace!(
                    "{} submitted {} secondary buffers from primary {}",
                    self.name,
                    count,
                    index
                );
                Ok(true)
            }
            Err(e) => {
                let abandoned: usize = inner
                    .threads
                    .values_mut()
                    .map(|pool| pool.retire(index, completed))
                    .sum();
                tracing::error!(
                    "{} failed to submit primary {}, abandoning {} secondary buffers: {}",
                    self.name,
                    index,
                    abandoned,
                    e
                );
                Err(e)
            }
        }
    }

    /// Ends every recording secondary buffer and submits them all from primary `index`.
    ///
    /// Returns how many secondary buffers were submitted.
    fn record_primary(&self, inner: &mut SchedulerInner<D>, index: usize) -> Result<usize> {
        let mut executed = Vec::new();
        for pool in inner.threads.values_mut() {
            pool.end_recording(&self.device, index, &mut executed)?;
        }

        let primary = &inner.primaries[index];
        let secondaries: Vec<&D::CommandBuffer> = executed.iter().map(|buffer| &**buffer).collect();
        self.device.begin(&primary.command_buffer, self.primary_usage)?;
        self.device
            .cmd_execute_commands(&primary.command_buffer, &secondaries);
        self.device.end(&primary.command_buffer)?;
        self.device.reset_fence(&primary.fence)?;
        self.device.submit(&primary.command_buffer, &primary.fence)?;
        Ok(secondaries.len())
    }

    fn clean_locked(&self, completed: &mut Vec<Completion>) -> Result<usize> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        self.retire_completed(inner, completed)?;
        for thread in self.retired_receiver.try_iter() {
            if let Some(pool) = inner.threads.get_mut(&thread) {
                pool.exited = true;
            }
        }

        let before = inner.threads.len();
        inner.threads.retain(|thread, pool| {
            let keep = !pool.exited || pool.in_use();
            if !keep {
                tracing::debug!("{} removed the transfer pool of {:?}", self.name, thread);
            }
            keep
        });
        Ok(before - inner.threads.len())
    }

    fn wait_idle_locked(&self, completed: &mut Vec<Completion>) -> Result<()> {
        let mut guard = lock(&self.inner);
        let inner = &mut *guard;
        for primary in inner.primaries.iter().filter(|primary| primary.in_flight) {
            self.device.wait_fence(&primary.fence)?;
        }
        self.retire_completed(inner, completed)?;
        Ok(())
    }

    /// A primary that is not in flight, creating one if every primary is busy
    fn acquire_primary(
        &self,
        inner: &mut SchedulerInner<D>,
        completed: &mut Vec<Completion>,
    ) -> Result<usize> {
        self.retire_completed(inner, completed)?;
        if let Some(index) = inner.primaries.iter().position(|primary| !primary.in_flight) {
            return Ok(index);
        }

        let command_buffer = self
            .device
            .allocate_command_buffer(&inner.command_pool, CommandBufferLevel::Primary)?;
        let fence = self.device.create_fence(false)?;
        inner.primaries.push(PrimaryBuffer {
            command_buffer,
            fence,
            in_flight: false,
        });
        tracing::debug!(
            "{} created primary transfer buffer {}",
            self.name,
            inner.primaries.len() - 1
        );
        Ok(inner.primaries.len() - 1)
    }

    /// Frees the children of every primary whose fence has signaled.
    ///
    /// Their completions are pushed to `completed`, to be run once the lock is released.
    fn retire_completed(
        &self,
        inner: &mut SchedulerInner<D>,
        completed: &mut Vec<Completion>,
    ) -> Result<usize> {
        let SchedulerInner {
            primaries, threads, ..
        } = inner;
        let mut retired = 0;
        for (index, primary) in primaries.iter_mut().enumerate() {
            if !primary.in_flight || !self.device.fence_signaled(&primary.fence)? {
                continue;
            }
            primary.in_flight = false;
            for pool in threads.values_mut() {
                pool.retire(index, completed);
            }
            retired += 1;
        }
        Ok(retired)
    }
}

/// Runs retired callbacks and drops kept resources, outside the scheduler lock
fn complete(completed: Vec<Completion>) {
    for completion in completed {
        completion.complete();
    }
}

impl<D: Device> Drop for TransferScheduler<D> {
    fn drop(&mut self) {
        if let Err(e) = self.wait_idle() {
            tracing::error!("{} failed to wait for transfers: {}", self.name, e);
        }
    }
}
