//! The window of unacknowledged AppendEntries batches to one peer.

use std::error::Error;

use validit::less_equal;
use validit::Validate;

/// A fixed-capacity ring of the last log index of each in-flight batch, in
/// send order. `full()` gates whether the leader may send another batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Inflights {
    start: usize,
    count: usize,
    buffer: Vec<u64>,
}

impl Inflights {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            start: 0,
            count: 0,
            buffer: vec![0; capacity],
        }
    }

    pub(crate) fn full(&self) -> bool {
        self.count == self.buffer.len()
    }

    pub(crate) fn count(&self) -> usize {
        self.count
    }

    /// Record a batch whose last index is `last`. Batches are added in
    /// ascending order of `last`.
    pub(crate) fn add(&mut self, last: u64) {
        assert!(!self.full(), "adding to a full inflight window");

        let mut next = self.start + self.count;
        if next >= self.buffer.len() {
            next -= self.buffer.len();
        }
        self.buffer[next] = last;
        self.count += 1;
    }

    /// Release every batch acknowledged through `index`.
    pub(crate) fn free_to(&mut self, index: u64) {
        while self.count > 0 && self.buffer[self.start] <= index {
            self.start += 1;
            if self.start >= self.buffer.len() {
                self.start = 0;
            }
            self.count -= 1;
        }
        if self.count == 0 {
            self.start = 0;
        }
    }

    /// Drop the whole window; a reject invalidates everything behind it.
    pub(crate) fn reset(&mut self) {
        self.start = 0;
        self.count = 0;
    }
}

impl Validate for Inflights {
    fn validate(&self) -> Result<(), Box<dyn Error>> {
        less_equal!(self.count, self.buffer.len());
        less_equal!(self.start, self.buffer.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_until_full() {
        let mut inf = Inflights::new(3);
        inf.add(1);
        inf.add(5);
        assert!(!inf.full());
        inf.add(9);
        assert!(inf.full());
        assert_eq!(3, inf.count());
        inf.validate().unwrap();
    }

    #[test]
    #[should_panic(expected = "adding to a full inflight window")]
    fn test_add_beyond_capacity_panics() {
        let mut inf = Inflights::new(1);
        inf.add(1);
        inf.add(2);
    }

    #[test]
    fn test_free_to() {
        let mut inf = Inflights::new(4);
        for last in [2, 4, 6, 8] {
            inf.add(last);
        }

        inf.free_to(5);
        assert_eq!(2, inf.count());

        // Acks below the head release nothing.
        inf.free_to(5);
        assert_eq!(2, inf.count());

        inf.free_to(8);
        assert_eq!(0, inf.count());

        // The ring wraps cleanly after draining.
        inf.add(10);
        inf.add(12);
        inf.free_to(10);
        assert_eq!(1, inf.count());
    }

    #[test]
    fn test_reset() {
        let mut inf = Inflights::new(2);
        inf.add(1);
        inf.add(2);
        inf.reset();
        assert_eq!(0, inf.count());
        assert!(!inf.full());
    }
}
