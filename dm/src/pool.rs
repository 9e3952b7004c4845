//! Fixed-size arena for device private and platform data.
//!
//! Device data is carved from a buddy heap over one region reserved up front, the way firmware
//! serves it from its early malloc arena. Buffers go back to the pool when dropped.

use alloc::{sync::Arc, vec, vec::Vec};
use buddy_system_allocator::LockedHeap;
use core::{alloc::Layout, fmt, ptr::NonNull, slice};
use utils::num::AlignableTo;

use crate::error::DmError;

/// Alignment of every buffer handed out by the pool.
pub const POOL_ALIGN: usize = 16;

pub struct DataPool {
    heap: LockedHeap<32>,
    size: usize,
    // Backing storage of `heap`; only accessed through the heap.
    _region: Vec<u64>,
}

impl DataPool {
    /// Reserve a pool of `size` bytes (rounded up to whole words).
    pub fn new(size: usize) -> Arc<DataPool> {
        let size = size.align_up(size_of::<u64>());
        let mut region = vec![0u64; size / size_of::<u64>()];
        let heap = LockedHeap::<32>::empty();
        if size > 0 {
            // SAFETY: `region` is owned by the pool, outlives the heap and is never touched directly.
            unsafe {
                heap.lock().init(region.as_mut_ptr() as usize, size);
            }
        }
        Arc::new(DataPool {
            heap,
            size,
            _region: region,
        })
    }

    /// Allocate a zeroed buffer of `size` bytes.
    pub fn alloc(self: &Arc<Self>, size: usize) -> Result<PoolBuf, DmError> {
        let layout = Layout::from_size_align(size.max(1), POOL_ALIGN).map_err(|_| DmError::OutOfMemory)?;
        let ptr = self.heap.lock().alloc(layout).map_err(|_| {
            log::error!("Data pool exhausted allocating {} bytes.", size);
            DmError::OutOfMemory
        })?;
        // SAFETY: the allocation is at least `layout.size()` bytes and exclusively ours.
        unsafe { ptr.as_ptr().write_bytes(0, layout.size()) };
        Ok(PoolBuf {
            ptr,
            len: size,
            layout,
            pool: self.clone(),
        })
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Bytes not currently handed out.
    pub fn free_bytes(&self) -> usize {
        let heap = self.heap.lock();
        heap.stats_total_bytes() - heap.stats_alloc_actual()
    }
}

impl fmt::Debug for DataPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DataPool")
            .field("size", &self.size)
            .field("free", &self.free_bytes())
            .finish()
    }
}

/// A zeroed buffer owned by a [DataPool].
pub struct PoolBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
    pool: Arc<DataPool>,
}

// SAFETY: the buffer is uniquely owned; the pool heap is behind a lock.
unsafe impl Send for PoolBuf {}
unsafe impl Sync for PoolBuf {}

impl PoolBuf {
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        // SAFETY: `ptr` is valid for `len` initialised bytes for the lifetime of `self`.
        unsafe { slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for PoolBuf {
    fn drop(&mut self) {
        self.pool.heap.lock().dealloc(self.ptr, self.layout);
    }
}

impl fmt::Debug for PoolBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolBuf({} bytes)", self.len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_return_to_pool() {
        let pool = DataPool::new(4096);
        let free = pool.free_bytes();
        assert_eq!(free, 4096);
        let mut buf = pool.alloc(24).unwrap();
        assert!(buf.as_slice().iter().all(|b| *b == 0));
        buf.as_mut_slice()[0] = 0xaa;
        assert!(pool.free_bytes() < free);
        drop(buf);
        assert_eq!(pool.free_bytes(), free);
        let again = pool.alloc(24).unwrap();
        assert_eq!(again.as_slice()[0], 0);
    }

    #[test]
    fn exhaustion_is_reported() {
        let pool = DataPool::new(256);
        assert_eq!(pool.alloc(1024).unwrap_err(), DmError::OutOfMemory);
        let empty = DataPool::new(0);
        assert_eq!(empty.alloc(8).unwrap_err(), DmError::OutOfMemory);
    }
}
