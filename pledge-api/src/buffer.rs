use ringbuf::traits::{Consumer, Observer, RingBuffer};
use ringbuf::HeapRb;

/// Default number of resolved values a promise keeps around.
pub const DEFAULT_BUFFER_CAPACITY: usize = 100;

/// Observable result of a promise.
///
/// A promise that resolved once exposes `One`; a streaming promise that
/// resolved several times exposes every buffered value, oldest first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolved<T> {
    One(T),
    Many(Vec<T>),
}

impl<T> Resolved<T> {
    /// The most recently resolved value.
    pub fn last(&self) -> Option<&T> {
        match self {
            Self::One(value) => Some(value),
            Self::Many(values) => values.last(),
        }
    }

    pub fn len(&self) -> usize {
        match self {
            Self::One(_) => 1,
            Self::Many(values) => values.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn into_vec(self) -> Vec<T> {
        match self {
            Self::One(value) => vec![value],
            Self::Many(values) => values,
        }
    }
}

/// Bounded ring of resolved values. Oldest entries are evicted first.
pub struct ResultBuffer<T> {
    ring: HeapRb<T>,
    capacity: usize,
    total: usize,
}

impl<T> ResultBuffer<T> {
    /// Create a buffer holding at most `capacity` values (at least one).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            ring: HeapRb::new(capacity),
            capacity,
            total: 0,
        }
    }

    pub fn push(&mut self, value: T) {
        self.ring.push_overwrite(value);
        self.total += 1;
    }

    pub fn last(&self) -> Option<&T> {
        self.ring.iter().last()
    }

    /// Number of values currently held.
    pub fn len(&self) -> usize {
        self.ring.occupied_len()
    }

    pub fn is_empty(&self) -> bool {
        self.ring.is_empty()
    }

    /// Number of values ever pushed, evicted ones included.
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<T: Clone> ResultBuffer<T> {
    /// Snapshot of the observable result.
    pub fn snapshot(&self) -> Option<Resolved<T>> {
        match self.total {
            0 => None,
            1 => self.last().cloned().map(Resolved::One),
            _ => Some(Resolved::Many(self.ring.iter().cloned().collect())),
        }
    }
}

impl<T> std::fmt::Debug for ResultBuffer<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultBuffer")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("total", &self.total)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_oldest_values_past_capacity() {
        let mut buffer = ResultBuffer::new(3);
        for value in 1..=5 {
            buffer.push(value);
        }

        assert_eq!(buffer.len(), 3);
        assert_eq!(buffer.total(), 5);
        assert_eq!(buffer.last(), Some(&5));
        assert_eq!(buffer.snapshot(), Some(Resolved::Many(vec![3, 4, 5])));
    }

    #[test]
    fn single_value_is_not_wrapped_in_a_sequence() {
        let mut buffer = ResultBuffer::new(DEFAULT_BUFFER_CAPACITY);
        assert_eq!(buffer.snapshot(), None);

        buffer.push("only");
        assert_eq!(buffer.snapshot(), Some(Resolved::One("only")));
    }

    #[test]
    fn zero_capacity_is_clamped_to_one() {
        let mut buffer = ResultBuffer::new(0);
        buffer.push(1);
        buffer.push(2);

        assert_eq!(buffer.capacity(), 1);
        assert_eq!(buffer.snapshot(), Some(Resolved::Many(vec![2])));
    }
}
