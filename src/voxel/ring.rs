//! Fixed-capacity queue of updated regions.
//!
//! Single producer, single consumer, overwrite-oldest on overflow. LOD
//! regeneration is idempotent, so a consumer that falls behind loses only
//! redundant work, never correctness.

use crate::math::Rect3;

/// Number of `(level, rect)` entries the ring retains
pub const UPDATE_RING_CAPACITY: usize = 128;

/// Ring of `(level, rect)` pairs describing edited regions
pub struct UpdateRing {
    slots: Vec<(u32, Rect3)>,
    first: usize,
    len: usize,
}

impl UpdateRing {
    pub fn new() -> Self {
        Self {
            slots: vec![(0, Rect3::default()); UPDATE_RING_CAPACITY],
            first: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append an entry, overwriting the oldest one when full
    pub fn push(&mut self, level: u32, rect: Rect3) {
        let cap = self.slots.len();
        if self.len == cap {
            self.first = (self.first + 1) % cap;
            self.len -= 1;
        }
        self.slots[(self.first + self.len) % cap] = (level, rect);
        self.len += 1;
    }

    /// Pop the oldest entry, `None` when drained
    pub fn pop(&mut self) -> Option<(u32, Rect3)> {
        if self.len == 0 {
            return None;
        }
        let entry = self.slots[self.first];
        self.first = (self.first + 1) % self.slots.len();
        self.len -= 1;
        Some(entry)
    }
}

impl Default for UpdateRing {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use glam::IVec3;

    fn rect(i: i32) -> Rect3 {
        Rect3::new(IVec3::splat(i), IVec3::splat(i + 1))
    }

    #[test]
    fn test_fifo_order() {
        let mut ring = UpdateRing::new();
        for i in 0..5 {
            ring.push(0, rect(i));
        }
        for i in 0..5 {
            assert_eq!(ring.pop(), Some((0, rect(i))));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_overflow_drops_oldest() {
        let mut ring = UpdateRing::new();
        let cap = ring.capacity() as i32;
        for i in 0..cap + 3 {
            ring.push(1, rect(i));
        }
        assert_eq!(ring.len(), cap as usize);
        for i in 3..cap + 3 {
            assert_eq!(ring.pop(), Some((1, rect(i))));
        }
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn test_interleaved_push_pop() {
        let mut ring = UpdateRing::new();
        ring.push(0, rect(0));
        ring.push(2, rect(1));
        assert_eq!(ring.pop(), Some((0, rect(0))));
        ring.push(3, rect(2));
        assert_eq!(ring.pop(), Some((2, rect(1))));
        assert_eq!(ring.pop(), Some((3, rect(2))));
        assert!(ring.is_empty());
    }
}
