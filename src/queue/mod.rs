//! Fixed-capacity FIFO ring of owned records.
//!
//! The queue never blocks and never overwrites: an insert into a full queue
//! is rejected and the record is handed back to the caller. It is used both
//! as the per-node summary buffer and as the coordinator's merge inbox.

use std::fmt;

use thiserror::Error;

/// Smallest capacity a queue may be created with.
pub const MIN_CAPACITY: usize = 2;

/// Default capacity when none is configured.
pub const DEFAULT_CAPACITY: usize = 10_000;

/// Errors raised when constructing a queue.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum QueueError {
    #[error("queue capacity must be at least {MIN_CAPACITY}, not {capacity}")]
    CapacityTooSmall { capacity: usize },
}

/// Rejected insert. Carries the record back so the caller decides what to
/// do with it.
#[derive(Error)]
#[error("queue is full ({capacity} records)")]
pub struct QueueFull<T> {
    pub record: T,
    pub capacity: usize,
}

impl<T> fmt::Debug for QueueFull<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueFull")
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}

/// Bounded circular record queue.
///
/// Slots between `head` and `tail` (modulo capacity) are occupied; `len`
/// disambiguates full from empty when `head == tail`.
pub struct RecordQueue<T> {
    slots: Box<[Option<T>]>,
    head: usize,
    tail: usize,
    len: usize,
}

impl<T> RecordQueue<T> {
    /// Creates an empty queue holding at most `capacity` records.
    pub fn new(capacity: usize) -> Result<Self, QueueError> {
        if capacity < MIN_CAPACITY {
            return Err(QueueError::CapacityTooSmall { capacity });
        }

        let slots: Box<[Option<T>]> = std::iter::repeat_with(|| None).take(capacity).collect();

        Ok(Self {
            slots,
            head: 0,
            tail: 0,
            len: 0,
        })
    }

    /// Appends a record at the tail, or returns it inside [`QueueFull`].
    pub fn try_insert(&mut self, record: T) -> Result<(), QueueFull<T>> {
        if self.is_full() {
            return Err(QueueFull {
                record,
                capacity: self.capacity(),
            });
        }

        if let Some(slot) = self.slots.get_mut(self.tail) {
            *slot = Some(record);
        }
        self.tail = (self.tail + 1) % self.capacity();
        self.len += 1;

        Ok(())
    }

    /// Returns the head record without removing it.
    pub fn peek(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.slots.get(self.head).and_then(Option::as_ref)
    }

    /// Removes and returns the head record. No-op on an empty queue.
    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }

        let record = self.slots.get_mut(self.head).and_then(Option::take);
        self.head = (self.head + 1) % self.capacity();
        self.len -= 1;

        record
    }

    /// Removes every record, yielding them in FIFO order.
    pub fn drain(&mut self) -> Drain<'_, T> {
        Drain { queue: self }
    }

    /// Number of records currently held.
    pub fn len(&self) -> usize {
        self.len
    }

    /// Maximum number of records the queue can hold.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of inserts that would currently succeed.
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }
}

impl<T> fmt::Debug for RecordQueue<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordQueue")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .field("head", &self.head)
            .field("tail", &self.tail)
            .finish()
    }
}

/// Draining iterator returned by [`RecordQueue::drain`].
///
/// Records not consumed before the iterator is dropped are released.
pub struct Drain<'a, T> {
    queue: &'a mut RecordQueue<T>,
}

impl<T> Iterator for Drain<'_, T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.queue.pop()
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (self.queue.len(), Some(self.queue.len()))
    }
}

impl<T> Drop for Drain<'_, T> {
    fn drop(&mut self) {
        while self.queue.pop().is_some() {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capacity_below_minimum_rejected() {
        assert_eq!(
            RecordQueue::<u32>::new(1).unwrap_err(),
            QueueError::CapacityTooSmall { capacity: 1 }
        );
        assert!(RecordQueue::<u32>::new(0).is_err());
        assert!(RecordQueue::<u32>::new(2).is_ok());
    }

    #[test]
    fn test_insert_until_full() {
        let mut q = RecordQueue::new(3).unwrap();
        for i in 0..3 {
            assert!(q.try_insert(i).is_ok());
        }
        assert!(q.is_full());

        let rejected = q.try_insert(99).unwrap_err();
        assert_eq!(rejected.record, 99);
        assert_eq!(rejected.capacity, 3);
        assert_eq!(q.len(), 3);
        assert_eq!(q.peek(), Some(&0));
    }

    #[test]
    fn test_pop_reclaims_space() {
        let mut q = RecordQueue::new(2).unwrap();
        q.try_insert("a").unwrap();
        q.try_insert("b").unwrap();
        assert!(q.try_insert("c").is_err());

        assert_eq!(q.pop(), Some("a"));
        assert!(q.try_insert("c").is_ok());
        assert_eq!(q.drain().collect::<Vec<_>>(), vec!["b", "c"]);
    }

    #[test]
    fn test_empty_peek_and_pop_are_silent() {
        let mut q: RecordQueue<String> = RecordQueue::new(4).unwrap();
        assert!(q.peek().is_none());
        assert!(q.pop().is_none());
        assert!(q.is_empty());
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn test_fifo_order_across_wraparound() {
        let mut q = RecordQueue::new(3).unwrap();
        let mut next = 0;
        let mut expected = 0;

        for _ in 0..10 {
            while q.try_insert(next).is_ok() {
                next += 1;
            }
            assert_eq!(q.pop(), Some(expected));
            expected += 1;
        }

        assert_eq!(q.len(), 2);
        assert_eq!(q.peek(), Some(&expected));
    }

    #[test]
    fn test_partial_drain_releases_rest() {
        let mut q = RecordQueue::new(4).unwrap();
        for i in 0..4 {
            q.try_insert(i).unwrap();
        }

        let first = q.drain().next();
        assert_eq!(first, Some(0));
        assert!(q.is_empty());
        assert_eq!(q.free(), 4);
    }
}
