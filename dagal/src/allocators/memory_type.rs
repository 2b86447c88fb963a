/// Where a buffer's memory lives
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum MemoryLocation {
    /// Memory useful in device accessible memory
    GpuOnly,
    /// Memory useful for uploading data to the device
    CpuToGpu,
    /// Memory useful for read back of data
    GpuToCpu,
}

impl MemoryLocation {
    /// Whether the host can map memory at this location
    pub fn host_visible(&self) -> bool {
        !matches!(self, MemoryLocation::GpuOnly)
    }
}
