#![allow(clippy::len_without_is_empty)]
use crate::error::{Error, Result};

/// A fixed-size ringbuffer
///
/// Slots are filled in order until `capacity` is reached, after which the write cursor wraps
/// and the oldest element is overwritten.
#[derive(Debug, Clone)]
pub struct RingBuffer<T> {
    buffer: Vec<T>,
    ix: usize,
    capacity: usize,
    writes: u64,
}

impl<T> RingBuffer<T> {
    /// Fails with [`Error::Capacity`] for a zero capacity
    pub fn new(capacity: usize) -> Result<Self> {
        if capacity == 0 {
            return Err(Error::Capacity(capacity));
        }
        Ok(Self {
            buffer: Vec::<T>::with_capacity(capacity),
            ix: 0,
            capacity,
            writes: 0,
        })
    }

    /// Returns the number of occupied slots
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Total number of elements ever pushed
    pub fn writes(&self) -> u64 {
        self.writes
    }

    /// Insert an element into the buffer, overwriting the oldest element, and return the write index
    pub fn push(&mut self, item: T) -> usize {
        let ix = self.ix;
        if ix >= self.len() {
            self.buffer.push(item);
        } else {
            self.buffer[ix] = item;
        }
        self.ix = (ix + 1) % self.capacity;
        self.writes += 1;
        ix
    }

    /// Get the element at a slot, `None` if the slot was never written
    pub fn get(&self, ix: usize) -> Option<&T> {
        self.buffer.get(ix)
    }
}
