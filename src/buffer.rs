//! Request payload buffer and per-worker object pools
//! Pre-allocated so the hot send path never touches the allocator

use crossbeam::queue::ArrayQueue;

/// Pre-allocated send payload, reused across all sends. The first eight
/// bytes carry the requested download length for the peer.
pub struct RequestBuffer {
    data: Box<[u8]>,
}

impl RequestBuffer {
    pub fn new(io_size: u32, download_request: u64) -> Self {
        let mut data = vec![0u8; io_size as usize];
        data[..8].copy_from_slice(&download_request.to_le_bytes());
        Self {
            data: data.into_boxed_slice(),
        }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// The download length encoded in the payload header.
    pub fn download_request(&self) -> u64 {
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&self.data[..8]);
        u64::from_le_bytes(raw)
    }
}

/// Lock-free free-list of reusable objects. Each worker owns its own pool so
/// the handshake path never contends on a shared allocator.
pub struct ObjectPool<T> {
    items: ArrayQueue<T>,
}

impl<T: Default> ObjectPool<T> {
    pub fn new(capacity: usize) -> Self {
        let items = ArrayQueue::new(capacity);
        for _ in 0..capacity {
            let _ = items.push(T::default());
        }
        Self { items }
    }

    /// Take an object from the pool, falling back to a fresh allocation when
    /// the free-list is drained.
    pub fn acquire(&self) -> T {
        self.items.pop().unwrap_or_default()
    }

    pub fn release(&self, value: T) {
        let _ = self.items.push(value);
    }

    pub fn available(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.items.capacity()
    }
}
