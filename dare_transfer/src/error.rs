use thiserror::Error;

#[derive(Debug, Error, Copy, Clone, PartialEq, Eq, Hash)]
pub enum TransferError {
    #[error("Range of {size} bytes at offset {offset} does not fit in {capacity} bytes")]
    OutOfBounds { offset: u64, size: u64, capacity: u64 },

    #[error("Allocations must be at least one byte")]
    ZeroSizedAllocation,
}

impl TransferError {
    /// Checks `offset..offset + size` against `capacity`
    pub(crate) fn check_bounds(offset: u64, size: u64, capacity: u64) -> Result<(), Self> {
        match offset.checked_add(size) {
            Some(end) if end <= capacity => Ok(()),
            _ => Err(TransferError::OutOfBounds {
                offset,
                size,
                capacity,
            }),
        }
    }
}
