//! Fixed-capacity sample buffers and the pool that owns them.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::EchoError;

/// A fixed-capacity byte buffer tagged with how much of it holds audio.
///
/// `filled_size` never exceeds `capacity`. Buffers are created once by a
/// [`BufferPool`] and then circulate between queues by handle; the bytes
/// themselves are never copied or reallocated while the pipeline runs.
///
/// # Example
///
/// ```
/// use audio_echo::SampleBuffer;
///
/// let buf = SampleBuffer::new(0, 4);
/// assert_eq!(buf.write(&[1, 2, 3, 4, 5, 6]), 4); // truncated to capacity
/// assert_eq!(buf.filled_size(), 4);
/// assert_eq!(buf.to_vec(), vec![1, 2, 3, 4]);
/// ```
pub struct SampleBuffer {
    id: usize,
    capacity: usize,
    filled: AtomicUsize,
    // Touched only by whichever context currently owns the handle
    storage: Mutex<Box<[u8]>>,
}

/// Shared handle to a pooled [`SampleBuffer`].
///
/// Queues hold handles, never the storage itself; the pool keeps a handle
/// to every buffer for the engine's whole life.
pub type BufferHandle = Arc<SampleBuffer>;

impl SampleBuffer {
    /// Creates a zeroed, empty buffer.
    pub fn new(id: usize, capacity: usize) -> Self {
        Self::from_storage(id, vec![0u8; capacity].into_boxed_slice())
    }

    /// Creates a zeroed buffer that reports itself as completely filled.
    ///
    /// Used for the silence a player submits when it has nothing to play.
    pub fn silent(capacity: usize) -> Self {
        let buf = Self::new(usize::MAX, capacity);
        buf.mark_full();
        buf
    }

    fn from_storage(id: usize, storage: Box<[u8]>) -> Self {
        Self {
            id,
            capacity: storage.len(),
            filled: AtomicUsize::new(0),
            storage: Mutex::new(storage),
        }
    }

    /// Position of this buffer inside its pool.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Fixed byte capacity.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of valid bytes.
    pub fn filled_size(&self) -> usize {
        self.filled.load(Ordering::Acquire)
    }

    /// Sets the number of valid bytes, clamped to the capacity.
    pub fn set_filled_size(&self, size: usize) {
        self.filled.store(size.min(self.capacity), Ordering::Release);
    }

    /// Marks the whole buffer as valid; devices only complete full buffers.
    pub fn mark_full(&self) {
        self.filled.store(self.capacity, Ordering::Release);
    }

    /// Empties the buffer. Only done when it re-enters the free pool.
    pub(crate) fn reset(&self) {
        self.filled.store(0, Ordering::Release);
    }

    /// Copies `bytes` into the buffer and sets the filled size.
    ///
    /// Returns the number of bytes copied (at most the capacity).
    pub fn write(&self, bytes: &[u8]) -> usize {
        let len = bytes.len().min(self.capacity);
        self.storage.lock()[..len].copy_from_slice(&bytes[..len]);
        self.set_filled_size(len);
        len
    }

    /// Runs `f` over the filled portion of the buffer.
    pub fn with_data<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        let filled = self.filled_size();
        let storage = self.storage.lock();
        f(&storage[..filled])
    }

    /// Runs `f` over the full storage, e.g. for a device filling it.
    pub fn with_storage_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        let mut storage = self.storage.lock();
        f(&mut storage)
    }

    /// Copies the filled portion out.
    pub fn to_vec(&self) -> Vec<u8> {
        self.with_data(<[u8]>::to_vec)
    }
}

impl std::fmt::Debug for SampleBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SampleBuffer")
            .field("id", &self.id)
            .field("capacity", &self.capacity)
            .field("filled", &self.filled_size())
            .finish()
    }
}

/// Owner of every buffer's backing storage.
///
/// Allocated once when the engine is initialized and released once at
/// teardown. All buffers are sized identically.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Vec<BufferHandle>,
    buffer_capacity: usize,
}

impl BufferPool {
    /// Allocates `count` zeroed buffers of `capacity` bytes each.
    ///
    /// # Errors
    ///
    /// Returns [`EchoError::AllocationFailed`] if either size is zero or the
    /// memory cannot be reserved. This is a configuration error; callers
    /// should not retry.
    pub fn allocate(count: usize, capacity: usize) -> Result<Self, EchoError> {
        let failed = || EchoError::AllocationFailed { count, capacity };

        if count == 0 || capacity == 0 {
            return Err(failed());
        }

        let mut buffers = Vec::new();
        buffers.try_reserve_exact(count).map_err(|_| failed())?;

        for id in 0..count {
            let mut storage = Vec::new();
            storage.try_reserve_exact(capacity).map_err(|_| failed())?;
            storage.resize(capacity, 0u8);
            buffers.push(Arc::new(SampleBuffer::from_storage(
                id,
                storage.into_boxed_slice(),
            )));
        }

        tracing::debug!(count, capacity, "allocated sample buffer pool");

        Ok(Self {
            buffers,
            buffer_capacity: capacity,
        })
    }

    /// Number of buffers in the pool.
    pub fn len(&self) -> usize {
        self.buffers.len()
    }

    /// Always `false` for a successfully allocated pool.
    pub fn is_empty(&self) -> bool {
        self.buffers.is_empty()
    }

    /// Capacity of every buffer in bytes.
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    /// Iterates over handles to every buffer.
    pub fn handles(&self) -> impl Iterator<Item = &BufferHandle> {
        self.buffers.iter()
    }

    /// Releases the pool's storage.
    ///
    /// Any handles still held by queues stay valid until those queues are
    /// dropped; the pool simply gives up its own references.
    pub fn release(self) {
        let outstanding = self
            .buffers
            .iter()
            .filter(|buf| Arc::strong_count(buf) > 1)
            .count();
        tracing::debug!(
            count = self.buffers.len(),
            outstanding,
            "released sample buffer pool"
        );
    }
}
