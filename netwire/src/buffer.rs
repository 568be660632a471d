//! Pooled byte buffers for receive and send paths.
//!
//! Hot paths allocate one buffer per received chunk, so pool-block-sized
//! buffers are recycled instead of returned to the allocator. Each thread
//! keeps a small local tier; overflow spills into a mutex-protected global
//! tier, and anything beyond the global cap is freed. Buffers larger than the
//! pool block bypass the pool entirely.

use std::cell::RefCell;
use std::mem;

use bytes::BytesMut;
use parking_lot::Mutex;

/// Fixed block size of pooled buffers. Also the capacity of every
/// per-endpoint receive buffer.
pub const POOL_BLOCK_SIZE: usize = 4096;

const POOL_LOCAL_MAX: usize = 32;
const POOL_GLOBAL_MAX: usize = 1024;

static GLOBAL_POOL: Mutex<Vec<BytesMut>> = Mutex::new(Vec::new());

thread_local! {
    static LOCAL_POOL: RefCell<Vec<BytesMut>> = const { RefCell::new(Vec::new()) };
}

/// A contiguous byte container with size tracked separately from capacity.
///
/// Payloads move through the library as owned `DataBuffer` values: the buffer
/// handed to a receive callback is private to that callback and is never
/// touched by a later read iteration.
pub struct DataBuffer {
    data: BytesMut,
}

impl DataBuffer {
    /// Create an empty buffer with at least `capacity` bytes reserved.
    pub fn new(capacity: usize) -> Self {
        DataBuffer {
            data: BytesMut::with_capacity(capacity),
        }
    }

    /// Allocate a buffer of at least `len` capacity, recycling a pooled
    /// instance when `len` fits in the pool block size.
    ///
    /// Recycled buffers come back with size reset to zero.
    pub fn pool_alloc(len: usize) -> Self {
        if len > POOL_BLOCK_SIZE {
            return DataBuffer {
                data: BytesMut::with_capacity(len),
            };
        }

        let recycled = LOCAL_POOL
            .try_with(|pool| pool.borrow_mut().pop())
            .ok()
            .flatten()
            .or_else(|| GLOBAL_POOL.lock().pop());

        let mut data = recycled.unwrap_or_else(|| BytesMut::with_capacity(POOL_BLOCK_SIZE));
        data.clear();
        DataBuffer { data }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn capacity(&self) -> usize {
        self.data.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Replace the contents with `bytes`.
    pub fn assign(&mut self, bytes: &[u8]) {
        self.data.clear();
        self.data.extend_from_slice(bytes);
    }

    pub fn append(&mut self, bytes: &[u8]) {
        self.data.extend_from_slice(bytes);
    }

    pub fn append_buffer(&mut self, other: &DataBuffer) {
        self.data.extend_from_slice(other.data());
    }

    /// Set the size directly, zero-filling any extension.
    pub fn set_size(&mut self, len: usize) {
        self.data.resize(len, 0);
    }

    pub fn clear(&mut self) {
        self.data.clear();
    }
}

impl Default for DataBuffer {
    fn default() -> Self {
        DataBuffer {
            data: BytesMut::new(),
        }
    }
}

impl Clone for DataBuffer {
    fn clone(&self) -> Self {
        let mut copy = DataBuffer::pool_alloc(self.size());
        copy.assign(self.data());
        copy
    }
}

impl std::fmt::Debug for DataBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBuffer")
            .field("size", &self.size())
            .field("capacity", &self.capacity())
            .finish()
    }
}

impl Drop for DataBuffer {
    fn drop(&mut self) {
        // Only exact pool-block storage is recycled; anything that grew past
        // the block (or was allocated larger up front) goes back to the
        // allocator.
        if self.data.capacity() != POOL_BLOCK_SIZE {
            return;
        }
        release(mem::take(&mut self.data));
    }
}

fn release(mut data: BytesMut) {
    data.clear();

    let mut slot = Some(data);
    // try_with: the thread-local tier may already be gone during thread
    // teardown, in which case the buffer falls through to the global tier.
    let _ = LOCAL_POOL.try_with(|pool| {
        let mut pool = pool.borrow_mut();
        if pool.len() < POOL_LOCAL_MAX
            && let Some(data) = slot.take()
        {
            pool.push(data);
        }
    });

    if let Some(data) = slot {
        let mut global = GLOBAL_POOL.lock();
        if global.len() < POOL_GLOBAL_MAX {
            global.push(data);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_assign_round_trip() {
        let mut buf = DataBuffer::new(16);
        buf.assign(b"hello");
        assert_eq!(buf.data(), b"hello");
        assert_eq!(buf.size(), 5);

        buf.assign(b"world!");
        assert_eq!(buf.data(), b"world!");
    }

    #[test]
    fn test_append() {
        let mut buf = DataBuffer::default();
        buf.append(b"hello ");
        buf.append(b"world");
        assert_eq!(buf.data(), b"hello world");

        let mut other = DataBuffer::default();
        other.assign(b"!");
        buf.append_buffer(&other);
        assert_eq!(buf.data(), b"hello world!");
    }

    #[test]
    fn test_clear_keeps_capacity() {
        let mut buf = DataBuffer::pool_alloc(64);
        buf.assign(b"data");
        let cap = buf.capacity();
        buf.clear();
        assert!(buf.is_empty());
        assert_eq!(buf.capacity(), cap);
    }

    #[test]
    fn test_pool_alloc_small_uses_block_capacity() {
        let buf = DataBuffer::pool_alloc(100);
        assert_eq!(buf.capacity(), POOL_BLOCK_SIZE);
        assert_eq!(buf.size(), 0);
    }

    #[test]
    fn test_pool_alloc_large_bypasses_pool() {
        let buf = DataBuffer::pool_alloc(POOL_BLOCK_SIZE + 1);
        assert!(buf.capacity() > POOL_BLOCK_SIZE);
    }

    #[test]
    fn test_recycled_buffer_size_reset() {
        {
            let mut buf = DataBuffer::pool_alloc(32);
            buf.assign(b"leftover bytes");
        }
        // The next pool allocation on this thread reuses the released block.
        let buf = DataBuffer::pool_alloc(32);
        assert_eq!(buf.size(), 0);
        assert_eq!(buf.capacity(), POOL_BLOCK_SIZE);
    }

    #[test]
    fn test_set_size_zero_fills() {
        let mut buf = DataBuffer::pool_alloc(16);
        buf.set_size(8);
        assert_eq!(buf.size(), 8);
        assert_eq!(buf.data(), &[0u8; 8]);
    }

    #[test]
    fn test_clone_copies_payload() {
        let mut buf = DataBuffer::pool_alloc(16);
        buf.assign(b"payload");
        let copy = buf.clone();
        buf.assign(b"changed");
        assert_eq!(copy.data(), b"payload");
    }
}
