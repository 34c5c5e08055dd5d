//! Bitset id allocator that always hands out the lowest free id.

const WORD_BITS: u64 = u64::BITS as u64;

/// Tracks used ids in a growable bitset.
#[derive(Debug, Clone, Default)]
pub struct IdAllocator {
    words: Vec<u64>,
}

impl IdAllocator {
    /// Ids at or above this cannot be reserved explicitly. Keeps the bitset
    /// from growing to the size of an arbitrary caller-supplied number.
    pub const MAX_EXPLICIT_ID: u64 = 1 << 20;

    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve and return the lowest free id.
    pub fn allocate(&mut self) -> u64 {
        for (index, word) in self.words.iter_mut().enumerate() {
            if *word != u64::MAX {
                let bit = u64::from(word.trailing_ones());
                *word |= 1 << bit;
                return index as u64 * WORD_BITS + bit;
            }
        }
        self.words.push(1);
        (self.words.len() as u64 - 1) * WORD_BITS
    }

    /// Mark an id as used or free. Returns `false`, changing nothing, when
    /// asked to reserve an id at or above [`Self::MAX_EXPLICIT_ID`].
    pub fn set(&mut self, id: u64, used: bool) -> bool {
        let index = (id / WORD_BITS) as usize;
        let mask = 1u64 << (id % WORD_BITS);
        if used {
            if id >= Self::MAX_EXPLICIT_ID {
                return false;
            }
            if index >= self.words.len() {
                self.words.resize(index + 1, 0);
            }
            self.words[index] |= mask;
        } else if let Some(word) = self.words.get_mut(index) {
            *word &= !mask;
            while self.words.last() == Some(&0) {
                self.words.pop();
            }
        }
        true
    }

    pub fn free(&mut self, id: u64) {
        self.set(id, false);
    }

    pub fn is_used(&self, id: u64) -> bool {
        let index = (id / WORD_BITS) as usize;
        self.words
            .get(index)
            .is_some_and(|word| word & (1u64 << (id % WORD_BITS)) != 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequential_allocation() {
        let mut ids = IdAllocator::new();
        assert_eq!(ids.allocate(), 0);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 2);
    }

    #[test]
    fn test_reuses_lowest_free() {
        let mut ids = IdAllocator::new();
        for _ in 0..5 {
            ids.allocate();
        }
        ids.free(3);
        ids.free(1);
        assert_eq!(ids.allocate(), 1);
        assert_eq!(ids.allocate(), 3);
        assert_eq!(ids.allocate(), 5);
    }

    #[test]
    fn test_crosses_word_boundary() {
        let mut ids = IdAllocator::new();
        for expected in 0..130 {
            assert_eq!(ids.allocate(), expected);
        }
        ids.free(64);
        assert!(!ids.is_used(64));
        assert_eq!(ids.allocate(), 64);
    }

    #[test]
    fn test_explicit_set_skipped_by_allocate() {
        let mut ids = IdAllocator::new();
        ids.set(0, true);
        ids.set(7, true);
        assert!(ids.is_used(7));
        assert_eq!(ids.allocate(), 1);
        ids.set(7, false);
        assert!(!ids.is_used(7));
        assert!(!ids.is_used(10_000));
    }

    #[test]
    fn test_huge_explicit_id_rejected() {
        let mut ids = IdAllocator::new();
        assert!(!ids.set(u64::MAX, true));
        assert!(!ids.set(IdAllocator::MAX_EXPLICIT_ID, true));
        assert!(!ids.is_used(u64::MAX));
        ids.free(u64::MAX);
        assert_eq!(ids.allocate(), 0);
        assert!(ids.set(IdAllocator::MAX_EXPLICIT_ID - 1, true));
    }
}
