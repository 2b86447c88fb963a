//! Growable collection of [`Heap`]s sharing one usage.
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use anyhow::Result;
use dagal::resource::BufferUsage;
use dagal::sync::MemoryBarrier;
use dagal::util::align;
use dagal::Device;
use derivative::Derivative;

use crate::context::TransferContext;
use crate::error::TransferError;
use crate::heap::{Chunk, Heap};
use crate::util::lock;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolCreateInfo {
    /// Debug name, heaps are named after it
    pub name: String,
    /// Usage of every heap's device buffer
    pub usage: BufferUsage,
    /// Size of heaps created for allocations that are not larger than it
    pub default_heap_size: u64,
}

impl Default for PoolCreateInfo {
    fn default() -> Self {
        Self {
            name: String::from("pool"),
            usage: BufferUsage::STORAGE,
            default_heap_size: 64 * 1024 * 1024,
        }
    }
}

/// Occupancy of one heap at the time it was read
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct HeapStats {
    pub id: u64,
    pub size: u64,
    pub free_space: u64,
    pub allocation_count: usize,
}

/// Indices of the heaps that can hold `size` bytes, tightest fit first
pub(crate) fn best_fit_order<I: IntoIterator<Item = u64>>(free_spaces: I, size: u64) -> Vec<usize> {
    let mut candidates: Vec<(usize, u64)> = free_spaces
        .into_iter()
        .enumerate()
        // an exact fit is still a fit
        .filter(|(_, free_space)| *free_space >= size)
        .collect();
    candidates.sort_by_key(|(_, free_space)| *free_space);
    candidates.into_iter().map(|(index, _)| index).collect()
}

#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub struct Pool<D: Device> {
    name: String,
    usage: BufferUsage,
    default_heap_size: u64,
    #[derivative(Debug = "ignore")]
    device: Arc<D>,
    /// Boxed so a heap's address survives the vector growing
    heaps: Mutex<Vec<Box<Heap<D>>>>,
    next_heap_id: AtomicU64,
}

impl<D: Device> Pool<D> {
    /// Creates an empty pool. Heaps are created by the first allocations.
    pub fn new(device: Arc<D>, create_info: PoolCreateInfo) -> Self {
        assert!(create_info.default_heap_size > 0);
        Self {
            name: create_info.name,
            usage: create_info.usage,
            default_heap_size: create_info.default_heap_size,
            device,
            heaps: Mutex::new(Vec::new()),
            next_heap_id: AtomicU64::new(0),
        }
    }

    /// Finds room for `size` bytes, creating a heap when no existing one has it
    pub fn allocate(&self, size: u64, alignment: u64) -> Result<Chunk<'_, D>> {
        if size == 0 {
            return Err(TransferError::ZeroSizedAllocation.into());
        }
        let mut heaps = lock(&self.heaps);

        if size <= self.default_heap_size {
            let needed = align(size, alignment);
            let order = best_fit_order(heaps.iter().map(|heap| heap.free_space()), needed);
            for index in order {
                // The free space read was only a hint
                if let Some(chunk) = self.detach(&heaps[index]).try_allocate(size, alignment) {
                    return Ok(chunk);
                }
            }
        }

        let heap = Box::new(self.create_heap(size.max(self.default_heap_size))?);
        let chunk = self.detach(&heap).allocate_first(size);
        heaps.push(heap);
        Ok(chunk)
    }

    /// Uploads every dirty range of every heap into `transfer`.
    ///
    /// All host to staging copies are recorded first, followed by a single barrier and then all
    /// staging to device copies. Returns whether anything was recorded.
    pub fn upload(&self, transfer: &TransferContext<D>) -> Result<bool> {
        let heaps = lock(&self.heaps);
        let mut started = Vec::new();
        let mut failure = None;
        for heap in heaps.iter() {
            match heap.begin_upload(transfer.command_buffer()) {
                Ok(Some(upload)) => started.push((heap, upload)),
                Ok(None) => {}
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            }
        }

        // Uploads already begun are finished even if a later heap failed
        let recorded = !started.is_empty();
        if recorded {
            self.device.cmd_pipeline_barrier(
                transfer.command_buffer(),
                &MemoryBarrier::TRANSFER_WRITE_TO_READ,
            );
            for (heap, upload) in started {
                heap.end_upload(upload, transfer);
            }
        }
        match failure {
            Some(e) => Err(e),
            None => Ok(recorded),
        }
    }

    /// Destroys every heap without allocations, returning how many were destroyed.
    ///
    /// No transfer recorded from a destroyed heap may still be pending on the device.
    pub fn clean(&self) -> usize {
        let mut heaps = lock(&self.heaps);
        let before = heaps.len();
        heaps.retain(|heap| {
            let keep = heap.allocation_count() > 0;
            if !keep {
                tracing::debug!("Pool {} reclaimed heap {}", self.name, heap.id());
            }
            keep
        });
        before - heaps.len()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn usage(&self) -> BufferUsage {
        self.usage
    }

    pub fn default_heap_size(&self) -> u64 {
        self.default_heap_size
    }

    pub fn heap_count(&self) -> usize {
        lock(&self.heaps).len()
    }

    pub fn total_free_space(&self) -> u64 {
        lock(&self.heaps).iter().map(|heap| heap.free_space()).sum()
    }

    pub fn heap_stats(&self) -> Vec<HeapStats> {
        lock(&self.heaps)
            .iter()
            .map(|heap| HeapStats {
                id: heap.id(),
                size: heap.size(),
                free_space: heap.free_space(),
                allocation_count: heap.allocation_count(),
            })
            .collect()
    }

    fn create_heap(&self, size: u64) -> Result<Heap<D>> {
        let id = self.next_heap_id.fetch_add(1, Ordering::Relaxed);
        Heap::new(
            self.device.clone(),
            id,
            &format!("{} heap {}", self.name, id),
            size,
            self.usage,
        )
    }

    /// Borrows a heap for as long as the pool rather than the lock guard
    fn detach(&self, heap: &Heap<D>) -> &Heap<D> {
        // SAFETY: heaps are boxed and only dropped by `clean` or by dropping the pool. `clean`
        // skips heaps with live chunks and runs under the same lock as `allocate`, so a heap
        // handed out here stays alive for as long as a chunk borrows it. Dropping the pool
        // needs every borrow of it, including every chunk, to be gone.
        unsafe { &*(heap as *const Heap<D>) }
    }
}
