use std::fmt::{Debug, Formatter};

use anyhow::Result;
use dagal::Device;

use super::Heap;
use crate::error::TransferError;

/// A range of a [`Heap`], returned to it on drop.
///
/// Chunks only borrow their heap. Writes land in the heap's host mirror and reach the device
/// buffer after [`Chunk::upload`] and the next [`Pool::upload`](crate::Pool::upload).
pub struct Chunk<'h, D: Device> {
    heap: &'h Heap<D>,
    offset: u64,
    size: u64,
}

impl<'h, D: Device> Chunk<'h, D> {
    pub(super) fn new(heap: &'h Heap<D>, offset: u64, size: u64) -> Self {
        Self { heap, offset, size }
    }

    /// Offset of the chunk inside its heap
    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// The heap this chunk lives in, borrowed no longer than the chunk itself
    pub fn heap(&self) -> &Heap<D> {
        self.heap
    }

    /// Device buffer holding this chunk at [`Self::offset`]
    pub fn device_buffer(&self) -> &D::Buffer {
        self.heap.device_buffer()
    }

    /// Copies `data` into the host mirror at `offset` bytes into the chunk.
    ///
    /// Nothing reaches the device until the range is passed to [`Self::upload`].
    pub fn write(&self, offset: u64, data: &[u8]) -> Result<()> {
        TransferError::check_bounds(offset, data.len() as u64, self.size)?;
        unsafe {
            std::ptr::copy_nonoverlapping(
                data.as_ptr(),
                self.heap
                    .host_ptr()
                    .as_ptr()
                    .add((self.offset + offset) as usize),
                data.len(),
            );
        }
        Ok(())
    }

    /// Reads back the host mirror
    pub fn read(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        TransferError::check_bounds(offset, len, self.size)?;
        let mut out = vec![0u8; len as usize];
        unsafe {
            std::ptr::copy_nonoverlapping(
                self.heap
                    .host_ptr()
                    .as_ptr()
                    .add((self.offset + offset) as usize),
                out.as_mut_ptr(),
                len as usize,
            );
        }
        Ok(out)
    }

    /// Marks `size` bytes at `offset` into the chunk as dirty
    pub fn upload(&self, offset: u64, size: u64) -> Result<()> {
        TransferError::check_bounds(offset, size, self.size)?;
        self.heap.register_upload(self.offset + offset, size);
        Ok(())
    }

    pub fn write_and_upload(&self, offset: u64, data: &[u8]) -> Result<()> {
        self.write(offset, data)?;
        self.upload(offset, data.len() as u64)
    }
}

impl<D: Device> Debug for Chunk<'_, D> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Chunk")
            .field("heap", &self.heap.id())
            .field("offset", &self.offset)
            .field("size", &self.size)
            .finish()
    }
}

impl<D: Device> Drop for Chunk<'_, D> {
    fn drop(&mut self) {
        self.heap.free(self.offset);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use dagal::device::TestDevice;
    use dagal::resource::BufferUsage;

    use super::*;

    fn heap() -> Heap<TestDevice> {
        Heap::new(Arc::new(TestDevice::new()), 3, "chunk heap", 256, BufferUsage::VERTEX).unwrap()
    }

    #[test]
    fn write_then_read() {
        let heap = heap();
        let _pad = heap.try_allocate(32, 1).unwrap();
        let chunk = heap.try_allocate(16, 16).unwrap();
        chunk.write(4, &[9, 8, 7]).unwrap();
        assert_eq!(chunk.read(3, 5).unwrap(), vec![0, 9, 8, 7, 0]);
        assert_eq!(chunk.heap().id(), 3);
    }

    #[test]
    fn out_of_bounds_access() {
        let heap = heap();
        let chunk = heap.try_allocate(16, 1).unwrap();
        let err = chunk.write(10, &[0; 7]).unwrap_err();
        assert_eq!(
            err.downcast_ref::<TransferError>(),
            Some(&TransferError::OutOfBounds {
                offset: 10,
                size: 7,
                capacity: 16
            })
        );
        assert!(chunk.read(17, 0).is_err());
        assert!(chunk.upload(u64::MAX, 2).is_err());
        assert_eq!(heap.pending_upload_count(), 0);
    }

    #[test]
    fn upload_registers_heap_offsets() {
        let heap = heap();
        let _pad = heap.try_allocate(64, 1).unwrap();
        let chunk = heap.try_allocate(32, 1).unwrap();
        chunk.write_and_upload(8, &[1; 8]).unwrap();
        assert_eq!(heap.pending_upload_count(), 1);
        assert_eq!(
            heap.pending_uploads(),
            vec![crate::heap::UploadRange {
                src_offset: 72,
                dst_offset: 0,
                size: 8
            }]
        );
    }

    #[test]
    fn drop_frees() {
        let heap = heap();
        let chunk = heap.try_allocate(100, 1).unwrap();
        assert_eq!(heap.allocation_count(), 1);
        drop(chunk);
        assert_eq!(heap.allocation_count(), 0);
        assert_eq!(heap.free_space(), 256);
    }
}
