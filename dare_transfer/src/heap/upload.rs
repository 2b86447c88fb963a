//! Two phase upload of dirty ranges: host mirror to staging, then staging to device.
//!
//! [`Heap::begin_upload`] returns an [`InFlightUpload`] which marks the heap busy until it is
//! handed back to [`Heap::end_upload`]. While busy, new registrations and uploads on the heap wait.
//! The token is [`Send`], so the two calls may come from different threads. Between them the
//! caller records a barrier making the first copy visible to the second;
//! [`Pool::upload`](crate::Pool::upload) does this once for all of its heaps.
use std::sync::{MutexGuard, PoisonError};

use anyhow::Result;
use dagal::command::BufferCopy;
use dagal::Device;
use derivative::Derivative;

use super::staging::{SlotMask, StagingBuffer};
use super::Heap;
use crate::context::TransferContext;
use crate::util::lock;

/// A dirty range waiting to be uploaded
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct UploadRange {
    /// Offset in the copy source
    pub src_offset: u64,
    /// Offset in the copy destination, assigned once staging space is reserved
    pub dst_offset: u64,
    pub size: u64,
}

impl UploadRange {
    fn src_end(&self) -> u64 {
        self.src_offset + self.size
    }

    fn reversed(&self) -> Self {
        Self {
            src_offset: self.dst_offset,
            dst_offset: self.src_offset,
            size: self.size,
        }
    }
}

impl From<UploadRange> for BufferCopy {
    fn from(value: UploadRange) -> Self {
        BufferCopy {
            src_offset: value.src_offset,
            dst_offset: value.dst_offset,
            size: value.size,
        }
    }
}

/// Sorts by source offset and merges ranges that overlap or touch
pub(crate) fn coalesce(ranges: &[UploadRange]) -> Vec<UploadRange> {
    let mut sorted = ranges.to_vec();
    sorted.sort_by_key(|range| range.src_offset);
    let mut merged: Vec<UploadRange> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if range.src_offset <= last.src_end() => {
                last.size = last.src_end().max(range.src_end()) - last.src_offset;
            }
            _ => merged.push(UploadRange {
                dst_offset: 0,
                ..range
            }),
        }
    }
    merged
}

#[derive(Derivative)]
#[derivative(Default(bound = ""))]
pub(crate) struct UploadState<D: Device> {
    pending: Vec<UploadRange>,
    /// Only grows, so indices held by in flight uploads stay valid
    staging: Vec<StagingBuffer<D>>,
    /// Set between begin_upload and end_upload
    busy: bool,
}

/// An upload between [`Heap::begin_upload`] and [`Heap::end_upload`].
///
/// No other upload can be registered on the heap while this exists.
#[must_use = "an upload must be finished with Heap::end_upload"]
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct InFlightUpload<'h, D: Device> {
    heap: &'h Heap<D>,
    ranges: Vec<UploadRange>,
    staging_index: usize,
    mask: SlotMask,
    finished: bool,
}

impl<D: Device> InFlightUpload<'_, D> {
    pub fn heap(&self) -> &Heap<D> {
        self.heap
    }

    /// Merged ranges, with destinations inside the staging buffer
    pub fn ranges(&self) -> &[UploadRange] {
        &self.ranges
    }

    /// Staging slots reserved for this upload
    pub fn mask(&self) -> SlotMask {
        self.mask
    }
}

impl<D: Device> Drop for InFlightUpload<'_, D> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.heap.release_upload(&mut lock(&self.heap.upload));
        if !std::thread::panicking() {
            tracing::warn!(
                "Upload on heap {} dropped without end_upload, staging slots {:#06b} stay reserved",
                self.heap.id(),
                self.mask.bits()
            );
            debug_assert!(self.finished, "InFlightUpload dropped without end_upload");
        }
    }
}

impl<D: Device> Heap<D> {
    /// Locks the upload state once no upload is in flight
    fn idle_upload_state(&self) -> MutexGuard<'_, UploadState<D>> {
        self.upload_idle
            .wait_while(lock(&self.upload), |state| state.busy)
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn release_upload(&self, state: &mut UploadState<D>) {
        state.busy = false;
        self.upload_idle.notify_all();
    }

    /// Marks `size` bytes at `offset` in the heap as dirty.
    ///
    /// Waits for an in flight upload on this heap to end first.
    pub fn register_upload(&self, offset: u64, size: u64) {
        assert!(
            offset.checked_add(size).is_some_and(|end| end <= self.size()),
            "upload of {} bytes at {} is outside of heap {}",
            size,
            offset,
            self.id()
        );
        if size == 0 {
            return;
        }
        self.idle_upload_state().pending.push(UploadRange {
            src_offset: offset,
            dst_offset: 0,
            size,
        });
    }

    /// Records the host mirror to staging copy for every dirty range.
    ///
    /// Returns [`None`] when nothing is dirty. Waits for an in flight upload on this heap to end
    /// first, so a thread must not begin a second upload on a heap before ending its first.
    pub fn begin_upload(&self, command_buffer: &D::CommandBuffer) -> Result<Option<InFlightUpload<'_, D>>> {
        let mut state = self.idle_upload_state();
        if state.pending.is_empty() {
            return Ok(None);
        }
        let mut ranges = coalesce(&state.pending);
        let total: u64 = ranges.iter().map(|range| range.size).sum();
        let quarter = self.quarter_size();
        let count = total.div_ceil(quarter);
        // Merged ranges are disjoint parts of the heap, and four quarters cover all of it
        assert!(count <= SlotMask::SLOTS as u64);
        let count = count as u32;

        let reserved = state
            .staging
            .iter()
            .enumerate()
            .find_map(|(index, staging)| staging.try_reserve(count).map(|mask| (index, mask)));
        let (staging_index, mask) = match reserved {
            Some(reserved) => reserved,
            None => {
                let staging = StagingBuffer::new(
                    self.device(),
                    &format!("{} staging {}", self.name(), state.staging.len()),
                    quarter * SlotMask::SLOTS as u64,
                )?;
                let mask = staging
                    .try_reserve(count)
                    .unwrap_or_else(|| SlotMask::run(count));
                tracing::debug!(
                    "Heap {} created staging buffer {}",
                    self.id(),
                    state.staging.len()
                );
                state.staging.push(staging);
                (state.staging.len() - 1, mask)
            }
        };

        let mut cursor = mask.first_slot().unwrap_or(0) as u64 * quarter;
        for range in ranges.iter_mut() {
            range.dst_offset = cursor;
            cursor += range.size;
        }
        let regions: Vec<BufferCopy> = ranges.iter().copied().map(BufferCopy::from).collect();
        self.device().cmd_copy_buffer(
            command_buffer,
            self.host_buffer(),
            state.staging[staging_index].buffer(),
            &regions,
        );
        state.busy = true;

        Ok(Some(InFlightUpload {
            heap: self,
            ranges,
            staging_index,
            mask,
            finished: false,
        }))
    }

    /// Records the staging to device copy and clears the dirty ranges.
    ///
    /// The reserved staging slots are released when the transfer's signal fires, and the staging
    /// buffer is kept alive by the transfer's keeper until then.
    pub fn end_upload(&self, mut upload: InFlightUpload<'_, D>, transfer: &TransferContext<D>) {
        assert!(
            std::ptr::eq(upload.heap, self),
            "upload from heap {} ended on heap {}",
            upload.heap.id(),
            self.id()
        );
        let regions: Vec<BufferCopy> = upload
            .ranges
            .iter()
            .map(|range| BufferCopy::from(range.reversed()))
            .collect();
        let mut state = lock(&self.upload);
        let staging = &state.staging[upload.staging_index];
        self.device().cmd_copy_buffer(
            transfer.command_buffer(),
            staging.buffer(),
            self.device_buffer(),
            &regions,
        );
        transfer.signal().connect(staging.releaser(upload.mask));
        transfer.keeper().keep(staging.buffer().clone());
        state.pending.clear();
        self.release_upload(&mut state);
        upload.finished = true;
    }

    pub fn pending_upload_count(&self) -> usize {
        lock(&self.upload).pending.len()
    }

    /// Snapshot of the dirty ranges in registration order
    pub fn pending_uploads(&self) -> Vec<UploadRange> {
        lock(&self.upload).pending.clone()
    }

    pub fn staging_buffer_count(&self) -> usize {
        lock(&self.upload).staging.len()
    }

    /// Occupied slots of every staging buffer
    pub fn staging_occupancy(&self) -> Vec<SlotMask> {
        lock(&self.upload)
            .staging
            .iter()
            .map(StagingBuffer::occupancy)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dagal::command::{CommandBufferLevel, CommandBufferUsage};
    use dagal::device::{TestCommand, TestDevice};
    use dagal::resource::BufferUsage;

    use super::*;
    use crate::signal::{CompletionSignal, ResourceKeeper};

    fn src(offset: u64, size: u64) -> UploadRange {
        UploadRange {
            src_offset: offset,
            dst_offset: 0,
            size,
        }
    }

    fn transfer(device: &TestDevice) -> TransferContext<TestDevice> {
        let pool = device.create_command_pool().unwrap();
        let command_buffer = device
            .allocate_command_buffer(&pool, CommandBufferLevel::Primary)
            .unwrap();
        device
            .begin(&command_buffer, CommandBufferUsage::ONE_TIME_SUBMIT)
            .unwrap();
        TransferContext::new(
            Arc::new(command_buffer),
            CompletionSignal::new(),
            ResourceKeeper::new(),
        )
    }

    #[test]
    fn coalesce_overlapping_and_touching() {
        let merged = coalesce(&[src(200, 10), src(50, 100), src(0, 100)]);
        assert_eq!(merged, vec![src(0, 150), src(200, 10)]);
        assert_eq!(coalesce(&[src(0, 10), src(10, 10)]), vec![src(0, 20)]);
        assert_eq!(coalesce(&[src(0, 100), src(10, 10)]), vec![src(0, 100)]);
        assert_eq!(coalesce(&[src(0, 10), src(11, 1)]), vec![src(0, 10), src(11, 1)]);
        assert!(coalesce(&[]).is_empty());
    }

    #[test]
    fn nothing_pending() {
        let device = Arc::new(TestDevice::new());
        let heap = Heap::new(device.clone(), 0, "heap", 1024, BufferUsage::STORAGE).unwrap();
        let transfer = transfer(&device);
        assert!(heap.begin_upload(transfer.command_buffer()).unwrap().is_none());
        assert_eq!(heap.staging_buffer_count(), 0);
    }

    #[test]
    fn staged_ranges_pack_into_the_reserved_slot() {
        let device = Arc::new(TestDevice::new());
        let heap = Heap::new(device.clone(), 0, "heap", 1024, BufferUsage::STORAGE).unwrap();
        heap.register_upload(600, 50);
        heap.register_upload(0, 100);
        heap.register_upload(50, 100);
        let transfer = transfer(&device);

        let upload = heap.begin_upload(transfer.command_buffer()).unwrap().unwrap();
        assert_eq!(upload.mask().bits(), 0b0001);
        assert_eq!(
            upload.ranges(),
            &[
                UploadRange {
                    src_offset: 0,
                    dst_offset: 0,
                    size: 150
                },
                UploadRange {
                    src_offset: 600,
                    dst_offset: 150,
                    size: 50
                },
            ]
        );
        heap.end_upload(upload, &transfer);

        let commands = transfer.command_buffer().commands();
        assert_eq!(commands.len(), 2);
        match &commands[1] {
            TestCommand::CopyBuffer { regions, .. } => assert_eq!(
                regions,
                &vec![
                    BufferCopy {
                        src_offset: 0,
                        dst_offset: 0,
                        size: 150
                    },
                    BufferCopy {
                        src_offset: 150,
                        dst_offset: 600,
                        size: 50
                    },
                ]
            ),
            other => panic!("expected a copy, got {:?}", other),
        }
        assert_eq!(heap.pending_upload_count(), 0);
        assert_eq!(transfer.keeper().len(), 1);
        assert_eq!(transfer.signal().pending(), 1);
    }

    #[test]
    fn slots_return_after_signal() {
        let device = Arc::new(TestDevice::new());
        let heap = Heap::new(device.clone(), 0, "heap", 1024, BufferUsage::STORAGE).unwrap();

        heap.register_upload(0, 300);
        let first = transfer(&device);
        let upload = heap.begin_upload(first.command_buffer()).unwrap().unwrap();
        heap.end_upload(upload, &first);
        assert_eq!(heap.staging_occupancy(), vec![SlotMask::from_bits(0b0011)]);

        heap.register_upload(0, 100);
        let second = transfer(&device);
        let upload = heap.begin_upload(second.command_buffer()).unwrap().unwrap();
        assert_eq!(upload.mask().bits(), 0b0100);
        assert_eq!(upload.ranges()[0].dst_offset, 512);
        heap.end_upload(upload, &second);

        // a full heap upload does not fit next to the others
        heap.register_upload(0, 1024);
        let third = transfer(&device);
        let upload = heap.begin_upload(third.command_buffer()).unwrap().unwrap();
        assert_eq!(upload.mask(), SlotMask::FULL);
        heap.end_upload(upload, &third);
        assert_eq!(heap.staging_buffer_count(), 2);

        first.signal().fire();
        second.signal().fire();
        third.signal().fire();
        assert_eq!(
            heap.staging_occupancy(),
            vec![SlotMask::EMPTY, SlotMask::EMPTY]
        );

        heap.register_upload(0, 1024);
        let fourth = transfer(&device);
        let upload = heap.begin_upload(fourth.command_buffer()).unwrap().unwrap();
        heap.end_upload(upload, &fourth);
        assert_eq!(heap.staging_buffer_count(), 2);
        assert_eq!(
            heap.staging_occupancy(),
            vec![SlotMask::FULL, SlotMask::EMPTY]
        );
    }

    #[test]
    fn odd_heap_sizes_round_slots_up() {
        let device = Arc::new(TestDevice::new());
        let heap = Heap::new(device.clone(), 0, "heap", 1001, BufferUsage::STORAGE).unwrap();
        assert_eq!(heap.quarter_size(), 251);
        heap.register_upload(0, 1001);
        let transfer = transfer(&device);
        let upload = heap.begin_upload(transfer.command_buffer()).unwrap().unwrap();
        assert_eq!(upload.mask(), SlotMask::FULL);
        heap.end_upload(upload, &transfer);
    }

    #[test]
    fn upload_ends_on_another_thread() {
        fn assert_send<T: Send>() {}
        assert_send::<InFlightUpload<'static, TestDevice>>();

        let device = Arc::new(TestDevice::new());
        let heap = Heap::new(device.clone(), 0, "heap", 1024, BufferUsage::STORAGE).unwrap();
        heap.register_upload(0, 10);
        let transfer = transfer(&device);

        let upload = heap.begin_upload(transfer.command_buffer()).unwrap().unwrap();
        std::thread::scope(|scope| {
            scope.spawn(|| heap.end_upload(upload, &transfer));
        });
        assert_eq!(heap.pending_upload_count(), 0);
        assert_eq!(transfer.command_buffer().copy_count(), 2);

        // the heap is usable again
        heap.register_upload(20, 10);
        let upload = heap.begin_upload(transfer.command_buffer()).unwrap().unwrap();
        heap.end_upload(upload, &transfer);
    }

    #[test]
    fn registration_waits_for_upload_to_end() {
        let device = Arc::new(TestDevice::new());
        let heap = Heap::new(device.clone(), 0, "heap", 1024, BufferUsage::STORAGE).unwrap();
        heap.register_upload(0, 10);
        let transfer = transfer(&device);

        let upload = heap.begin_upload(transfer.command_buffer()).unwrap().unwrap();
        std::thread::scope(|scope| {
            let registering = scope.spawn(|| heap.register_upload(100, 10));
            std::thread::sleep(std::time::Duration::from_millis(50));
            assert_eq!(heap.pending_uploads(), vec![src(0, 10)]);
            heap.end_upload(upload, &transfer);
            registering.join().unwrap();
        });
        // the late registration belongs to the next upload
        assert_eq!(heap.pending_uploads(), vec![src(100, 10)]);
    }

    #[test]
    #[should_panic]
    fn register_outside_heap() {
        let device = Arc::new(TestDevice::new());
        let heap = Heap::new(device, 0, "heap", 64, BufferUsage::STORAGE).unwrap();
        heap.register_upload(60, 8);
    }
}
