//! Bounded FIFO of buffer handles.

use std::sync::Arc;

use parking_lot::Mutex;
use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;

use crate::buffer::BufferHandle;

/// A bounded, non-blocking FIFO of [`BufferHandle`]s.
///
/// Used in three roles: the free pool, the ready queue between source and
/// player, and each endpoint's shadow queue of in-flight buffers. The queue
/// never owns buffer storage; it only holds handles.
///
/// Every operation takes the internal lock for a constant-time ring update
/// and returns immediately, so it is safe to call from completion callbacks.
/// Callers test the return values; nothing here waits.
///
/// # Example
///
/// ```
/// use std::sync::Arc;
/// use audio_echo::{AudioQueue, SampleBuffer};
///
/// let queue = AudioQueue::new(1);
/// assert!(queue.push(Arc::new(SampleBuffer::new(0, 4))));
/// assert!(!queue.push(Arc::new(SampleBuffer::new(1, 4)))); // full
/// assert_eq!(queue.pop().map(|b| b.id()), Some(0));
/// assert!(queue.pop().is_none());
/// ```
pub struct AudioQueue {
    ring: Mutex<HeapRb<BufferHandle>>,
    capacity: usize,
}

impl AudioQueue {
    /// Creates an empty queue holding at most `capacity` handles.
    ///
    /// A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: Mutex::new(HeapRb::new(capacity)),
            capacity,
        }
    }

    /// Appends a buffer. Returns `false` and leaves the queue unchanged if full.
    pub fn push(&self, buffer: BufferHandle) -> bool {
        self.ring.lock().try_push(buffer).is_ok()
    }

    /// Removes and returns the oldest buffer, or `None` if empty.
    pub fn pop(&self) -> Option<BufferHandle> {
        self.ring.lock().try_pop()
    }

    /// Returns the oldest buffer without removing it, or `None` if empty.
    pub fn front(&self) -> Option<BufferHandle> {
        self.ring.lock().iter().next().cloned()
    }

    /// Number of buffers currently queued.
    pub fn size(&self) -> usize {
        self.ring.lock().occupied_len()
    }

    /// Alias of [`size()`](Self::size).
    pub fn len(&self) -> usize {
        self.size()
    }

    /// Returns `true` if nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.ring.lock().is_empty()
    }

    /// Returns `true` if no more buffers fit.
    pub fn is_full(&self) -> bool {
        self.ring.lock().is_full()
    }

    /// Maximum number of buffers the queue holds.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Room left before the queue is full.
    pub fn vacant(&self) -> usize {
        self.ring.lock().vacant_len()
    }
}

impl std::fmt::Debug for AudioQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AudioQueue")
            .field("size", &self.size())
            .field("capacity", &self.capacity)
            .finish()
    }
}

/// The two pool-wide queues a component is wired to.
///
/// Components borrow these from the engine; they never own them.
#[derive(Debug, Clone)]
pub(crate) struct BufferQueues {
    pub free: Arc<AudioQueue>,
    pub ready: Arc<AudioQueue>,
}

impl BufferQueues {
    /// Returns `buffer` to the free pool, emptied.
    pub fn recycle(&self, buffer: BufferHandle) {
        buffer.reset();
        let id = buffer.id();
        if !self.free.push(buffer) {
            tracing::error!(buffer = id, "free queue overflow, buffer dropped");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::SampleBuffer;

    fn buf(id: usize) -> BufferHandle {
        Arc::new(SampleBuffer::new(id, 8))
    }

    #[test]
    fn test_fifo_order() {
        let queue = AudioQueue::new(4);
        for id in [10, 11, 12] {
            assert!(queue.push(buf(id)));
        }

        let order: Vec<usize> = std::iter::from_fn(|| queue.pop()).map(|b| b.id()).collect();
        assert_eq!(order, vec![10, 11, 12]);
    }

    #[test]
    fn test_push_on_full_queue_is_rejected() {
        let queue = AudioQueue::new(2);
        assert!(queue.push(buf(0)));
        assert!(queue.push(buf(1)));
        assert!(queue.is_full());

        assert!(!queue.push(buf(2)));
        assert_eq!(queue.size(), 2);
        assert_eq!(queue.front().map(|b| b.id()), Some(0));
    }

    #[test]
    fn test_pop_and_front_on_empty_queue() {
        let queue = AudioQueue::new(2);
        assert!(queue.pop().is_none());
        assert!(queue.front().is_none());
        assert_eq!(queue.size(), 0);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_front_does_not_remove() {
        let queue = AudioQueue::new(2);
        queue.push(buf(7));
        assert_eq!(queue.front().map(|b| b.id()), Some(7));
        assert_eq!(queue.front().map(|b| b.id()), Some(7));
        assert_eq!(queue.size(), 1);
    }

    #[test]
    fn test_wraps_around_ring() {
        let queue = AudioQueue::new(2);
        for round in 0..5 {
            assert!(queue.push(buf(round)));
            assert_eq!(queue.pop().map(|b| b.id()), Some(round));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_raised() {
        let queue = AudioQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.push(buf(0)));
        assert_eq!(queue.vacant(), 0);
    }

    #[test]
    fn test_concurrent_producer_consumer_loses_nothing() {
        let queue = Arc::new(AudioQueue::new(4));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                let mut next = 0;
                while next < 1000 {
                    if queue.push(buf(next)) {
                        next += 1;
                    } else {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut received = Vec::with_capacity(1000);
        while received.len() < 1000 {
            match queue.pop() {
                Some(b) => received.push(b.id()),
                None => std::thread::yield_now(),
            }
        }
        producer.join().unwrap();

        assert_eq!(received, (0..1000).collect::<Vec<_>>());
    }
}
