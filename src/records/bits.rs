//! Dense bit planes for dirty and presence tracking.
//!
//! Each record carries a presence plane (bit = "field currently holds a
//! value") and each undo frame carries a diff plane (bit = "field changed
//! since this frame was entered") plus a presence snapshot. Bit 0 is
//! reserved for the row-level EXISTS flag; field ordinal `i` maps to bit
//! `i + 1`.

use serde::{Deserialize, Serialize};

const WORD_BITS: usize = 64;

/// Row-level "this row is currently live" bit.
pub const EXISTS_BIT: usize = 0;

/// Bit position for a field ordinal.
#[inline]
pub fn field_bit(ordinal: usize) -> usize {
    ordinal + 1
}

/// Fixed-size bit set backed by 64-bit words, sized at schema load.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BitPlane {
    words: Vec<u64>,
}

impl BitPlane {
    /// A plane holding at least `bits` bits, all clear.
    pub fn with_bits(bits: usize) -> Self {
        Self {
            words: vec![0; bits.div_ceil(WORD_BITS)],
        }
    }

    pub fn capacity(&self) -> usize {
        self.words.len() * WORD_BITS
    }

    pub fn set(&mut self, bit: usize) {
        self.words[bit / WORD_BITS] |= 1u64 << (bit % WORD_BITS);
    }

    pub fn clear(&mut self, bit: usize) {
        self.words[bit / WORD_BITS] &= !(1u64 << (bit % WORD_BITS));
    }

    pub fn assign(&mut self, bit: usize, on: bool) {
        if on {
            self.set(bit);
        } else {
            self.clear(bit);
        }
    }

    pub fn test(&self, bit: usize) -> bool {
        self.words[bit / WORD_BITS] & (1u64 << (bit % WORD_BITS)) != 0
    }

    /// OR every bit of `other` into this plane. Widths must match.
    pub fn union(&mut self, other: &BitPlane) {
        debug_assert_eq!(self.words.len(), other.words.len());
        for (w, o) in self.words.iter_mut().zip(&other.words) {
            *w |= o;
        }
    }

    pub fn any(&self) -> bool {
        self.words.iter().any(|w| *w != 0)
    }

    pub fn clear_all(&mut self) {
        self.words.iter_mut().for_each(|w| *w = 0);
    }

    /// Resize to hold `bits` bits, clearing everything.
    pub fn reset_to(&mut self, bits: usize) {
        self.words.clear();
        self.words.resize(bits.div_ceil(WORD_BITS), 0);
    }

    /// Positions of set bits, ascending.
    pub fn ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i, &word)| {
            (0..WORD_BITS)
                .filter(move |b| word & (1u64 << b) != 0)
                .map(move |b| i * WORD_BITS + b)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_set_clear_test() {
        let mut plane = BitPlane::with_bits(130);
        plane.set(0);
        plane.set(65);
        plane.set(129);

        assert!(plane.test(0));
        assert!(plane.test(65));
        assert!(plane.test(129));
        assert!(!plane.test(1));

        plane.clear(65);
        assert!(!plane.test(65));
    }

    #[test]
    fn test_ones_ascending() {
        let mut plane = BitPlane::with_bits(70);
        plane.set(3);
        plane.set(64);
        plane.set(69);

        let ones: Vec<usize> = plane.ones().collect();
        assert_eq!(ones, vec![3, 64, 69]);
    }

    #[test]
    fn test_union() {
        let mut a = BitPlane::with_bits(10);
        let mut b = BitPlane::with_bits(10);
        a.set(1);
        b.set(2);

        a.union(&b);
        assert!(a.test(1));
        assert!(a.test(2));
    }

    #[test]
    fn test_any_and_clear_all() {
        let mut plane = BitPlane::with_bits(8);
        assert!(!plane.any());

        plane.set(7);
        assert!(plane.any());

        plane.clear_all();
        assert!(!plane.any());
    }

    #[test]
    fn test_field_bit_reserves_exists() {
        assert_eq!(EXISTS_BIT, 0);
        assert_eq!(field_bit(0), 1);
        assert_eq!(field_bit(5), 6);
    }
}
