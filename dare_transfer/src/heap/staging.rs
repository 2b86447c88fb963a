//! Staging buffers split into four reservable quarter slots.
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use anyhow::Result;
use dagal::allocators::MemoryLocation;
use dagal::resource::{BufferCreateInfo, BufferUsage};
use dagal::Device;
use derivative::Derivative;

/// Set of quarter slots in a staging buffer, one bit per slot
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
pub struct SlotMask(u8);

impl SlotMask {
    /// Number of slots per staging buffer
    pub const SLOTS: u32 = 4;
    pub const EMPTY: SlotMask = SlotMask(0);
    pub const FULL: SlotMask = SlotMask(0b1111);

    /// `count` contiguous slots starting at slot 0
    pub fn run(count: u32) -> Self {
        assert!(
            count <= Self::SLOTS,
            "a staging buffer only has {} slots, {} requested",
            Self::SLOTS,
            count
        );
        SlotMask(((1u16 << count) - 1) as u8)
    }

    /// Discards bits outside of the four slots
    pub fn from_bits(bits: u8) -> Self {
        SlotMask(bits & Self::FULL.0)
    }

    pub fn bits(self) -> u8 {
        self.0
    }

    /// Moves every slot up by `shift`, or [`None`] if any would fall off the end
    pub fn shifted(self, shift: u32) -> Option<Self> {
        let bits = (self.0 as u16).checked_shl(shift)?;
        (bits <= Self::FULL.0 as u16).then_some(SlotMask(bits as u8))
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn count(self) -> u32 {
        self.0.count_ones()
    }

    /// Lowest reserved slot
    pub fn first_slot(self) -> Option<u32> {
        (!self.is_empty()).then(|| self.0.trailing_zeros())
    }

    pub fn overlaps(self, other: SlotMask) -> bool {
        self.0 & other.0 != 0
    }

    pub fn union(self, other: SlotMask) -> Self {
        SlotMask(self.0 | other.0)
    }

    /// Lowest placement of `count` contiguous slots that avoids everything in `occupied`
    pub fn find_free_run(occupied: SlotMask, count: u32) -> Option<SlotMask> {
        assert!(count > 0);
        let run = Self::run(count);
        (0..Self::SLOTS)
            .filter_map(|shift| run.shifted(shift))
            .find(|candidate| !candidate.overlaps(occupied))
    }
}

/// One staging buffer and the occupancy of its slots.
///
/// Occupancy lives behind an [`Arc`] so completion callbacks can release slots without a
/// reference to the owning heap.
#[derive(Derivative)]
#[derivative(Debug(bound = ""))]
pub(crate) struct StagingBuffer<D: Device> {
    #[derivative(Debug = "ignore")]
    buffer: Arc<D::Buffer>,
    occupancy: Arc<AtomicU8>,
}

impl<D: Device> StagingBuffer<D> {
    pub(crate) fn new(device: &D, name: &str, size: u64) -> Result<Self> {
        let buffer = device.create_buffer(BufferCreateInfo {
            name,
            size,
            usage: BufferUsage::TRANSFER_SRC | BufferUsage::TRANSFER_DST,
            location: MemoryLocation::GpuOnly,
        })?;
        Ok(Self {
            buffer: Arc::new(buffer),
            occupancy: Arc::new(AtomicU8::new(0)),
        })
    }

    pub(crate) fn buffer(&self) -> &Arc<D::Buffer> {
        &self.buffer
    }

    pub(crate) fn occupancy(&self) -> SlotMask {
        SlotMask::from_bits(self.occupancy.load(Ordering::Acquire))
    }

    /// Reserves `count` contiguous free slots, if there are any
    pub(crate) fn try_reserve(&self, count: u32) -> Option<SlotMask> {
        let mut current = self.occupancy.load(Ordering::Acquire);
        loop {
            let mask = SlotMask::find_free_run(SlotMask::from_bits(current), count)?;
            match self.occupancy.compare_exchange_weak(
                current,
                current | mask.bits(),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Some(mask),
                Err(actual) => current = actual,
            }
        }
    }

    /// Callback returning `mask` to the free slots. Releasing twice is harmless.
    pub(crate) fn releaser(&self, mask: SlotMask) -> impl FnOnce() + Send + 'static {
        let occupancy = self.occupancy.clone();
        move || {
            occupancy.fetch_and(!mask.bits(), Ordering::AcqRel);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dagal::device::TestDevice;

    #[test]
    fn runs() {
        assert_eq!(SlotMask::run(0), SlotMask::EMPTY);
        assert_eq!(SlotMask::run(1).bits(), 0b0001);
        assert_eq!(SlotMask::run(3).bits(), 0b0111);
        assert_eq!(SlotMask::run(4), SlotMask::FULL);
    }

    #[test]
    #[should_panic]
    fn run_past_four_slots() {
        SlotMask::run(5);
    }

    #[test]
    fn shifting_stops_at_the_last_slot() {
        let run = SlotMask::run(2);
        assert_eq!(run.shifted(2).map(SlotMask::bits), Some(0b1100));
        assert_eq!(run.shifted(3), None);
        assert_eq!(SlotMask::run(1).shifted(3).map(SlotMask::bits), Some(0b1000));
    }

    #[test]
    fn free_run_search() {
        let occupied = SlotMask::from_bits(0b0101);
        assert_eq!(
            SlotMask::find_free_run(occupied, 1).map(SlotMask::bits),
            Some(0b0010)
        );
        assert_eq!(SlotMask::find_free_run(occupied, 2), None);
        assert_eq!(
            SlotMask::find_free_run(SlotMask::from_bits(0b0011), 2).map(SlotMask::bits),
            Some(0b1100)
        );
        assert_eq!(SlotMask::find_free_run(SlotMask::FULL, 1), None);
    }

    #[test]
    fn first_slot() {
        assert_eq!(SlotMask::EMPTY.first_slot(), None);
        assert_eq!(SlotMask::from_bits(0b1100).first_slot(), Some(2));
        assert_eq!(SlotMask::from_bits(0b1100).count(), 2);
    }

    #[test]
    fn reserve_and_release() {
        let device = TestDevice::new();
        let staging = StagingBuffer::<TestDevice>::new(&device, "staging", 64).unwrap();
        let first = staging.try_reserve(2).unwrap();
        let second = staging.try_reserve(2).unwrap();
        assert_eq!(first.bits(), 0b0011);
        assert_eq!(second.bits(), 0b1100);
        assert_eq!(staging.try_reserve(1), None);

        let release = staging.releaser(first);
        release();
        assert_eq!(staging.occupancy().bits(), 0b1100);
        // a second release of the same mask changes nothing
        staging.releaser(first)();
        assert_eq!(staging.occupancy().bits(), 0b1100);
        assert_eq!(staging.try_reserve(1).map(SlotMask::bits), Some(0b0001));
    }
}
