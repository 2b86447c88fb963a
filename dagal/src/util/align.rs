/// Deals with aligning data
///
/// Rounds `current` up to the next multiple of `alignment`. An alignment of `0` or `1` leaves
/// the value untouched.
pub fn align(current: u64, alignment: u64) -> u64 {
    if alignment <= 1 || current % alignment == 0 {
        current
    } else {
        let remainder = current % alignment;
        current + alignment - remainder
    }
}

/// Same as [`align`], but returns [`None`] instead of wrapping around near [`u64::MAX`]
pub fn checked_align(current: u64, alignment: u64) -> Option<u64> {
    if alignment <= 1 || current % alignment == 0 {
        Some(current)
    } else {
        current.checked_add(alignment - current % alignment)
    }
}
