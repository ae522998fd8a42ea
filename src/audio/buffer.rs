//! Growable sample queue used for every buffering need
//!
//! Data always occupies `[0, enqueue_position)` of a contiguous backing
//! store. Enqueueing past the end grows the store, dequeueing shifts the
//! remainder to the front. Each queue has exactly one producer and one
//! consumer, both driven from the same tick sequence, so no locking is done.

use crate::error::QueueError;

/// Contiguous FIFO queue with an explicit enqueue cursor
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    data: Vec<T>,
    enqueue_position: usize,
}

impl<T: Copy + Default> RingBuffer<T> {
    /// Create a new queue with the given starting capacity
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![T::default(); capacity],
            enqueue_position: 0,
        }
    }

    /// Copy `items` onto the tail of the queue, growing it if needed
    pub fn enqueue(&mut self, items: &[T]) {
        self.resize_if_needed(items.len());
        let end = self.enqueue_position + items.len();
        self.data[self.enqueue_position..end].copy_from_slice(items);
        self.enqueue_position = end;
    }

    /// Remove `count` elements from the front of the queue
    pub fn dequeue(&mut self, count: usize) -> Result<(), QueueError> {
        if count > self.enqueue_position {
            return Err(QueueError::OutOfRange {
                requested: count,
                available: self.enqueue_position,
            });
        }

        // Nothing to shift when the whole queue is drained
        if count != self.enqueue_position {
            self.data.copy_within(count..self.enqueue_position, 0);
        }
        self.enqueue_position -= count;
        Ok(())
    }

    /// Grow the backing store so `additional` more elements fit.
    ///
    /// New capacity is `max(capacity * 2, position + additional)`.
    pub fn resize_if_needed(&mut self, additional: usize) {
        if self.data.len() - self.enqueue_position >= additional {
            return;
        }
        let new_capacity = (self.data.len() * 2).max(self.enqueue_position + additional);
        self.data.resize(new_capacity, T::default());
    }

    /// Declare how many elements were written directly into the backing
    /// store past the enqueue position (see [`RingBuffer::spare_mut`]).
    ///
    /// The queue is left untouched on failure.
    pub fn modify_write_position(&mut self, delta: isize) -> Result<(), QueueError> {
        let position = self.enqueue_position as isize + delta;
        if position < 0 || position > self.data.len() as isize {
            return Err(QueueError::WritePositionOutOfRange {
                position,
                capacity: self.data.len(),
            });
        }
        self.enqueue_position = position as usize;
        Ok(())
    }

    /// Reserve room for `additional` elements and return the writable
    /// region that follows the enqueue position.
    pub fn spare_mut(&mut self, additional: usize) -> &mut [T] {
        self.resize_if_needed(additional);
        &mut self.data[self.enqueue_position..self.enqueue_position + additional]
    }

    /// Queued elements, oldest first
    pub fn as_slice(&self) -> &[T] {
        &self.data[..self.enqueue_position]
    }

    /// The whole backing store, including the unused tail
    pub fn data(&self) -> &[T] {
        &self.data
    }

    /// Current enqueue position (queue length)
    pub fn enqueue_position(&self) -> usize {
        self.enqueue_position
    }

    pub fn len(&self) -> usize {
        self.enqueue_position
    }

    pub fn is_empty(&self) -> bool {
        self.enqueue_position == 0
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Drop everything queued without shrinking the backing store
    pub fn clear(&mut self) {
        self.enqueue_position = 0;
    }
}
