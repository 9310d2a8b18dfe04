use std::collections::VecDeque;

/// Bounded FIFO used for sample history, loss windows and recent-error logs.
///
/// Pushing into a full buffer evicts the oldest entry. Capacity 0 stores nothing.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CircularBuffer<T> {
    buffer: VecDeque<T>,
    capacity: usize,
}

impl<T> CircularBuffer<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            buffer: VecDeque::with_capacity(capacity.min(4096)),
            capacity,
        }
    }

    /// Append `item`, returning the entry evicted to make room (if any).
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.capacity == 0 {
            return None;
        }

        let evicted = if self.buffer.len() >= self.capacity {
            self.buffer.pop_front()
        } else {
            None
        };
        self.buffer.push_back(item);
        evicted
    }

    /// Remove entries from the oldest end while `pred` holds. Returns how many were removed.
    pub fn drain_front_while<F>(&mut self, mut pred: F) -> usize
    where
        F: FnMut(&T) -> bool,
    {
        let mut removed = 0;
        while self.buffer.front().is_some_and(&mut pred) {
            self.buffer.pop_front();
            removed += 1;
        }
        removed
    }

    /// Change capacity, keeping the newest entries when shrinking.
    pub fn resize(&mut self, capacity: usize) {
        while self.buffer.len() > capacity {
            self.buffer.pop_front();
        }
        self.capacity = capacity;
    }

    pub fn iter(&self) -> impl DoubleEndedIterator<Item = &T> + ExactSizeIterator {
        self.buffer.iter()
    }

    pub fn front(&self) -> Option<&T> {
        self.buffer.front()
    }

    pub fn back(&self) -> Option<&T> {
        self.buffer.back()
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.buffer.len() == self.capacity
    }

    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl<'a, T> IntoIterator for &'a CircularBuffer<T> {
    type Item = &'a T;
    type IntoIter = std::collections::vec_deque::Iter<'a, T>;

    fn into_iter(self) -> Self::IntoIter {
        self.buffer.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_evicts_oldest_when_full() {
        let mut buf = CircularBuffer::new(3);
        assert_eq!(buf.push(1), None);
        assert_eq!(buf.push(2), None);
        assert_eq!(buf.push(3), None);
        assert!(buf.is_full());

        assert_eq!(buf.push(4), Some(1));
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
        assert_eq!(buf.front(), Some(&2));
        assert_eq!(buf.back(), Some(&4));
    }

    #[test]
    fn zero_capacity_stores_nothing() {
        let mut buf = CircularBuffer::new(0);
        assert_eq!(buf.push(1), None);
        assert!(buf.is_empty());
    }

    #[test]
    fn drain_front_while_stops_at_first_kept_entry() {
        let mut buf = CircularBuffer::new(8);
        for v in [1, 2, 10, 3, 11] {
            buf.push(v);
        }

        let removed = buf.drain_front_while(|v| *v < 5);
        assert_eq!(removed, 2);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![10, 3, 11]);
    }

    #[test]
    fn shrinking_keeps_newest_entries() {
        let mut buf = CircularBuffer::new(5);
        for v in 0..5 {
            buf.push(v);
        }
        buf.resize(2);
        assert_eq!(buf.capacity(), 2);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![3, 4]);

        buf.push(5);
        assert_eq!(buf.iter().copied().collect::<Vec<_>>(), vec![4, 5]);
    }
}
