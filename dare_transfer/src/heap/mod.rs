//! A single fixed size device buffer and its sub-allocator.
//!
//! Every heap owns three buffers:
//! - a host visible mirror that [`Chunk`]s write into
//! - the device only buffer that chunks actually refer to on the GPU
//! - zero or more staging buffers that uploads pass through
//!
//! Allocated ranges are kept sorted by offset. Free space is never stored; it is whatever lies
//! between two neighbouring ranges, so freeing a range merges the gaps around it for free.
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};

use anyhow::Result;
use dagal::allocators::MemoryLocation;
use dagal::resource::{BufferCreateInfo, BufferUsage};
use dagal::util::align::checked_align;
use dagal::Device;
use derivative::Derivative;

use crate::util::lock;

mod chunk;
mod staging;
mod upload;

pub use chunk::Chunk;
pub use staging::SlotMask;
pub use upload::{InFlightUpload, UploadRange};

use upload::UploadState;

/// A live allocation inside a heap
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct AllocatedRange {
    pub offset: u64,
    pub size: u64,
}

impl AllocatedRange {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Finds where an allocation of `size` bytes goes in `ranges`.
///
/// Returns the index the new range is inserted at and its offset. Tried in order: offset 0 of
/// an empty heap, the tail after the last range, then every gap from the lowest address up.
pub(crate) fn find_placement(
    ranges: &[AllocatedRange],
    heap_size: u64,
    size: u64,
    alignment: u64,
) -> Option<(usize, u64)> {
    let fits_before = |offset: u64, limit: u64| matches!(offset.checked_add(size), Some(end) if end <= limit);

    let last = match ranges.last() {
        None => return (size <= heap_size).then_some((0, 0)),
        Some(last) => last,
    };

    if let Some(offset) = checked_align(last.end(), alignment) {
        if fits_before(offset, heap_size) {
            return Some((ranges.len(), offset));
        }
    }

    // Offset 0 satisfies every alignment
    if fits_before(0, ranges[0].offset) {
        return Some((0, 0));
    }
    ranges.windows(2).enumerate().find_map(|(index, pair)| {
        let offset = checked_align(pair[0].end(), alignment)?;
        fits_before(offset, pair[1].offset).then_some((index + 1, offset))
    })
}

/// One device buffer sub-allocated into [`Chunk`]s
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Heap<D: Device> {
    id: u64,
    name: String,
    size: u64,
    usage: BufferUsage,
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    #[derivative(Debug = "ignore")]
    host_buffer: D::Buffer,
    host_ptr: NonNull<u8>,
    #[derivative(Debug = "ignore")]
    device_buffer: D::Buffer,
    ranges: Mutex<Vec<AllocatedRange>>,
    free_space: AtomicU64,
    allocation_count: AtomicUsize,
    /// Kept apart from `ranges` so uploads never wait on allocation
    #[derivative(Debug = "ignore")]
    upload: Mutex<UploadState<D>>,
    /// Notified when an in flight upload ends
    #[derivative(Debug = "ignore")]
    upload_idle: Condvar,
}

// SAFETY: `host_ptr` points into `host_buffer`, which lives exactly as long as the heap. Writes
// through it come from chunks, whose callers keep concurrent writes to the same bytes apart.
unsafe impl<D: Device> Send for Heap<D> {}
unsafe impl<D: Device> Sync for Heap<D> {}

impl<D: Device> Heap<D> {
    /// Creates the host mirror and device buffer, both `size` bytes
    pub fn new(device: Arc<D>, id: u64, name: &str, size: u64, usage: BufferUsage) -> Result<Self> {
        let host_buffer = device.create_buffer(BufferCreateInfo {
            name: &format!("{name} host mirror"),
            size,
            usage: BufferUsage::TRANSFER_SRC,
            location: MemoryLocation::CpuToGpu,
        })?;
        let host_ptr = device.map(&host_buffer)?;
        let device_buffer = device.create_buffer(BufferCreateInfo {
            name,
            size,
            usage: usage | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        })?;
        tracing::debug!("Created heap {} ({}) of {} bytes", id, name, size);

        Ok(Self {
            id,
            name: name.to_string(),
            size,
            usage,
            device,
            host_buffer,
            host_ptr,
            device_buffer,
            ranges: Mutex::new(Vec::new()),
            free_space: AtomicU64::new(size),
            allocation_count: AtomicUsize::new(0),
            upload: Mutex::new(UploadState::default()),
            upload_idle: Condvar::new(),
        })
    }

    /// First fit allocation, [`None`] if the heap has no room
    pub fn try_allocate(&self, size: u64, alignment: u64) -> Option<Chunk<'_, D>> {
        if size == 0 {
            return None;
        }
        let mut ranges = lock(&self.ranges);
        let (index, offset) = find_placement(&ranges, self.size, size, alignment)?;
        ranges.insert(index, AllocatedRange { offset, size });
        self.free_space.fetch_sub(size, Ordering::AcqRel);
        self.allocation_count.fetch_add(1, Ordering::AcqRel);
        Some(Chunk::new(self, offset, size))
    }

    /// Places the only allocation of a fresh heap at offset 0
    pub fn allocate_first(&self, size: u64) -> Chunk<'_, D> {
        let mut ranges = lock(&self.ranges);
        assert!(ranges.is_empty(), "allocate_first on a heap that is in use");
        assert!(
            size <= self.size,
            "{} bytes do not fit a heap of {} bytes",
            size,
            self.size
        );
        ranges.push(AllocatedRange { offset: 0, size });
        self.free_space.fetch_sub(size, Ordering::AcqRel);
        self.allocation_count.fetch_add(1, Ordering::AcqRel);
        Chunk::new(self, 0, size)
    }

    /// Releases the range starting at `offset`
    pub(crate) fn free(&self, offset: u64) {
        let mut ranges = lock(&self.ranges);
        let index = match ranges.binary_search_by_key(&offset, |range| range.offset) {
            Ok(index) => index,
            Err(_) => panic!("no allocation at offset {} in heap {}", offset, self.id),
        };
        let range = ranges.remove(index);
        self.free_space.fetch_add(range.size, Ordering::AcqRel);
        self.allocation_count.fetch_sub(1, Ordering::AcqRel);
    }

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

    /// Unallocated bytes. May be stale by the time it is read.
    pub fn free_space(&self) -> u64 {
        self.free_space.load(Ordering::Acquire)
    }

    pub fn allocation_count(&self) -> usize {
        self.allocation_count.load(Ordering::Acquire)
    }

    /// Snapshot of the live ranges, sorted by offset
    pub fn ranges(&self) -> Vec<AllocatedRange> {
        lock(&self.ranges).clone()
    }

    pub fn device_buffer(&self) -> &D::Buffer {
        &self.device_buffer
    }

    pub fn host_buffer(&self) -> &D::Buffer {
        &self.host_buffer
    }

    /// Size of a single staging slot
    pub fn quarter_size(&self) -> u64 {
        self.size.div_ceil(SlotMask::SLOTS as u64)
    }

    pub(crate) fn host_ptr(&self) -> NonNull<u8> {
        self.host_ptr
    }

    pub(crate) fn device(&self) -> &D {
        &self.device
    }
}

impl<D: Device> Drop for Heap<D> {
    fn drop(&mut self) {
        if !std::thread::panicking() {
            debug_assert_eq!(
                self.allocation_count(),
                0,
                "heap {} dropped with live chunks",
                self.id
            );
        }
        #[cfg(feature = "log-lifetimes")]
        tracing::trace!("Destroyed heap {}", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagal::device::TestDevice;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};

    fn range(offset: u64, size: u64) -> AllocatedRange {
        AllocatedRange { offset, size }
    }

    fn heap(size: u64) -> Heap<TestDevice> {
        Heap::new(
            Arc::new(TestDevice::new()),
            0,
            "test heap",
            size,
            BufferUsage::STORAGE,
        )
        .unwrap()
    }

    fn check_invariants(heap: &Heap<TestDevice>) {
        let ranges = heap.ranges();
        for pair in ranges.windows(2) {
            assert!(pair[0].offset < pair[1].offset, "ranges out of order");
            assert!(pair[0].end() <= pair[1].offset, "ranges overlap");
        }
        if let Some(last) = ranges.last() {
            assert!(last.end() <= heap.size());
        }
        let used: u64 = ranges.iter().map(|range| range.size).sum();
        assert_eq!(heap.free_space() + used, heap.size());
        assert_eq!(heap.allocation_count(), ranges.len());
    }

    #[test]
    fn placement_empty() {
        assert_eq!(find_placement(&[], 100, 100, 16), Some((0, 0)));
        assert_eq!(find_placement(&[], 100, 101, 16), None);
    }

    #[test]
    fn placement_prefers_tail() {
        let ranges = [range(40, 10), range(60, 10)];
        // room at the front too, but the tail wins
        assert_eq!(find_placement(&ranges, 100, 10, 1), Some((2, 70)));
        assert_eq!(find_placement(&ranges, 100, 10, 16), Some((2, 80)));
    }

    #[test]
    fn placement_falls_back_to_gaps() {
        let ranges = [range(0, 10), range(40, 10), range(90, 10)];
        assert_eq!(find_placement(&ranges, 100, 20, 1), Some((1, 10)));
        assert_eq!(find_placement(&ranges, 100, 20, 16), Some((1, 16)));
        assert_eq!(find_placement(&ranges, 100, 30, 1), Some((1, 10)));
        assert_eq!(find_placement(&ranges, 100, 40, 1), Some((2, 50)));
        assert_eq!(find_placement(&ranges, 100, 41, 1), None);
    }

    #[test]
    fn placement_leading_gap() {
        let ranges = [range(50, 50)];
        assert_eq!(find_placement(&ranges, 100, 50, 64), Some((0, 0)));
        assert_eq!(find_placement(&ranges, 100, 51, 1), None);
    }

    #[test]
    fn placement_does_not_overflow() {
        let ranges = [range(0, 10)];
        assert_eq!(find_placement(&ranges, u64::MAX, u64::MAX, 1), None);
        assert_eq!(find_placement(&ranges, u64::MAX, 1, u64::MAX), None);
    }

    #[test]
    fn sequential_allocations() {
        let heap = heap(256);
        let a = heap.try_allocate(10, 1).unwrap();
        let b = heap.try_allocate(10, 16).unwrap();
        let c = heap.try_allocate(100, 64).unwrap();
        assert_eq!((a.offset(), b.offset(), c.offset()), (0, 16, 64));
        assert_eq!(heap.free_space(), 256 - 120);
        check_invariants(&heap);
    }

    #[test]
    fn freed_space_is_reused() {
        let heap = heap(100);
        let a = heap.try_allocate(40, 1).unwrap();
        let b = heap.try_allocate(40, 1).unwrap();
        let c = heap.try_allocate(20, 1).unwrap();
        assert!(heap.try_allocate(1, 1).is_none());
        drop(b);
        check_invariants(&heap);
        let d = heap.try_allocate(40, 1).unwrap();
        assert_eq!(d.offset(), 40);
        check_invariants(&heap);
        drop((a, c, d));
        assert_eq!(heap.free_space(), 100);
        assert_eq!(heap.allocation_count(), 0);
    }

    #[test]
    fn zero_sized() {
        let heap = heap(100);
        assert!(heap.try_allocate(0, 1).is_none());
        assert_eq!(heap.allocation_count(), 0);
    }

    #[test]
    fn allocate_first_takes_offset_zero() {
        let heap = heap(100);
        let chunk = heap.allocate_first(100);
        assert_eq!(chunk.offset(), 0);
        assert_eq!(heap.free_space(), 0);
    }

    #[test]
    #[should_panic]
    fn allocate_first_on_used_heap() {
        let heap = heap(100);
        let _a = heap.try_allocate(10, 1).unwrap();
        let _b = heap.allocate_first(10);
    }

    #[test]
    fn random_allocations_keep_invariants() {
        let heap = heap(4096);
        let mut rng = StdRng::seed_from_u64(0xDA2E);
        let mut live = Vec::new();
        for _ in 0..2000 {
            if live.is_empty() || rng.random_bool(0.6) {
                let size = rng.random_range(1..=256);
                let alignment = 1 << rng.random_range(0..=6);
                if let Some(chunk) = heap.try_allocate(size, alignment) {
                    assert_eq!(chunk.offset() % alignment, 0);
                    live.push(chunk);
                }
            } else {
                let index = rng.random_range(0..live.len());
                live.swap_remove(index);
            }
            check_invariants(&heap);
        }
        live.clear();
        assert_eq!(heap.free_space(), heap.size());
    }

    #[test]
    fn allocation_is_deterministic() {
        let run = || {
            let heap = heap(1 << 16);
            let mut rng = StdRng::seed_from_u64(7);
            let mut chunks = Vec::new();
            let mut offsets = Vec::new();
            for step in 0..500 {
                let size = rng.random_range(1..=512);
                let alignment = 1 << rng.random_range(0..=8);
                if let Some(chunk) = heap.try_allocate(size, alignment) {
                    offsets.push(chunk.offset());
                    chunks.push(chunk);
                }
                if step % 3 == 0 && !chunks.is_empty() {
                    chunks.remove(step % chunks.len());
                }
            }
            offsets
        };
        assert_eq!(run(), run());
    }
}
