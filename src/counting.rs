//! Integer counting vector supporting `+=`/`-=` against a bit-vector (C2).

use crate::bitvector::BitVector;
use std::ops::{AddAssign, SubAssign};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

/// An integer counter array that can be incremented/decremented in bulk by
/// the set bits of a [`BitVector`].
///
/// May be longer than the bit-vector it is combined with; excess entries are
/// left untouched.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct CountingVector<T> {
    data: Vec<T>,
}

/// Element types usable as counters. A small fixed set of widths is enough
/// in practice (see the original spec's design notes).
pub trait Counter: Copy + Default + AddAssign + SubAssign + From<u8> {
    /// Widens this counter to `u64`, used by the HIBF query agents to
    /// accumulate counts across recursion levels regardless of `Self`'s
    /// width. Counts are never negative in practice.
    fn as_u64(self) -> u64;

    /// Narrows a `u64` total back down to `Self`, used by the HIBF counting
    /// agent to deposit a recursion-wide sum into a caller-chosen counter
    /// width. Truncates like a plain `as` cast if `value` overflows `Self`.
    fn from_u64(value: u64) -> Self;
}
macro_rules! impl_counter {
    ($($t:ty),*) => {
        $(impl Counter for $t {
            fn as_u64(self) -> u64 { self as u64 }
            fn from_u64(value: u64) -> Self { value as $t }
        })*
    };
}
impl_counter!(u8, u16, u32, u64, i8, i16, i32, i64);

impl<T: Counter> CountingVector<T> {
    /// Creates a counting vector of `len` zeroed counters.
    pub fn with_len(len: usize) -> Self {
        Self {
            data: vec![T::default(); len],
        }
    }

    /// Number of counters.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether there are no counters.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Raw slice access.
    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Raw mutable slice access.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.data
    }

    /// Resets every counter to zero.
    pub fn fill_zero(&mut self) {
        for v in &mut self.data {
            *v = T::default();
        }
    }

    fn combine_with_bits(&mut self, bits: &BitVector, increment: bool) {
        assert!(
            bits.len() <= self.data.len(),
            "bit-vector ({}) longer than counting vector ({})",
            bits.len(),
            self.data.len()
        );

        #[cfg(not(feature = "simd"))]
        self.combine_scalar(bits, increment);
        #[cfg(feature = "simd")]
        self.combine_wide(bits, increment);
    }

    /// Scalar path: skip runs of zero bits via count_trailing_zeros, touching
    /// only set-bit positions.
    #[cfg(not(feature = "simd"))]
    fn combine_scalar(&mut self, bits: &BitVector, increment: bool) {
        let words = bits.words();
        let full_words = bits.len() / 64;
        for (word_idx, &word) in words.iter().enumerate().take(full_words + 1) {
            let base = word_idx * 64;
            let mut remaining = word;
            // Mask off any bits beyond bits.len() in the final partial word.
            let bits_in_word = if base + 64 > bits.len() {
                bits.len().saturating_sub(base)
            } else {
                64
            };
            if bits_in_word == 0 {
                continue;
            }
            if bits_in_word < 64 {
                remaining &= (1u64 << bits_in_word) - 1;
            }
            while remaining != 0 {
                let tz = remaining.trailing_zeros() as usize;
                let pos = base + tz;
                if increment {
                    self.data[pos] += T::from(1u8);
                } else {
                    self.data[pos] -= T::from(1u8);
                }
                remaining &= remaining - 1; // clear lowest set bit
            }
        }
    }

    /// Wide path: expands each word's 64 bit positions 8 at a time into a
    /// lane of `0/1` contributions and adds/subtracts them unconditionally
    /// (no trailing-zero skip), the shape a portable SIMD add/sub over
    /// 8-lane chunks would take. Capacity is rounded up to the next multiple
    /// of 64 counters by [`CountingVector::with_len`] so every lane read in
    /// the tail word stays in-bounds even when `bits.len()` isn't itself a
    /// multiple of 64.
    #[cfg(feature = "simd")]
    fn combine_wide(&mut self, bits: &BitVector, increment: bool) {
        let words = bits.words();
        let bits_len = bits.len();
        for (word_idx, &word) in words.iter().enumerate() {
            let base = word_idx * 64;
            if base >= bits_len {
                break;
            }
            for lane_group in 0..8usize {
                let group_base = base + lane_group * 8;
                if group_base >= bits_len {
                    break;
                }
                let mut lanes = [0u8; 8];
                for (lane, slot) in lanes.iter_mut().enumerate() {
                    let pos = group_base + lane;
                    if pos < bits_len {
                        *slot = ((word >> (lane_group * 8 + lane)) & 1) as u8;
                    }
                }
                for (lane, &contribution) in lanes.iter().enumerate() {
                    if contribution == 0 {
                        continue;
                    }
                    let pos = group_base + lane;
                    if increment {
                        self.data[pos] += T::from(contribution);
                    } else {
                        self.data[pos] -= T::from(contribution);
                    }
                }
            }
        }
    }
}

impl<T: Counter> AddAssign<&BitVector> for CountingVector<T> {
    fn add_assign(&mut self, rhs: &BitVector) {
        self.combine_with_bits(rhs, true);
    }
}

impl<T: Counter> SubAssign<&BitVector> for CountingVector<T> {
    fn sub_assign(&mut self, rhs: &BitVector) {
        self.combine_with_bits(rhs, false);
    }
}

impl<T: Counter> AddAssign<&CountingVector<T>> for CountingVector<T> {
    fn add_assign(&mut self, rhs: &CountingVector<T>) {
        assert!(rhs.data.len() <= self.data.len());
        for (a, b) in self.data.iter_mut().zip(rhs.data.iter()) {
            *a += *b;
        }
    }
}

impl<T: Counter> SubAssign<&CountingVector<T>> for CountingVector<T> {
    fn sub_assign(&mut self, rhs: &CountingVector<T>) {
        assert!(rhs.data.len() <= self.data.len());
        for (a, b) in self.data.iter_mut().zip(rhs.data.iter()) {
            *a -= *b;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_bits_increments_set_positions_only() {
        let mut bits = BitVector::with_len(10);
        bits.set(0, true);
        bits.set(3, true);
        bits.set(9, true);

        let mut counts = CountingVector::<u16>::with_len(10);
        counts += &bits;

        assert_eq!(counts.as_slice(), &[1, 0, 0, 1, 0, 0, 0, 0, 0, 1]);

        counts += &bits;
        assert_eq!(counts.as_slice(), &[2, 0, 0, 2, 0, 0, 0, 0, 0, 2]);

        counts -= &bits;
        assert_eq!(counts.as_slice(), &[1, 0, 0, 1, 0, 0, 0, 0, 0, 1]);
    }

    #[test]
    fn counting_vector_may_exceed_bitvector_length() {
        let bits = BitVector::new_with(5, true);
        let mut counts = CountingVector::<u32>::with_len(20);
        counts += &bits;
        assert_eq!(&counts.as_slice()[..5], &[1, 1, 1, 1, 1]);
        assert_eq!(&counts.as_slice()[5..], &[0u32; 15]);
    }

    #[cfg(feature = "simd")]
    #[test]
    fn wide_path_agrees_with_scalar_semantics_across_word_boundaries() {
        let mut bits = BitVector::with_len(130);
        for i in [0usize, 7, 8, 63, 64, 65, 127, 129] {
            bits.set(i, true);
        }

        let mut counts = CountingVector::<u32>::with_len(130);
        counts += &bits;
        for i in [0usize, 7, 8, 63, 64, 65, 127, 129] {
            assert_eq!(counts.as_slice()[i], 1, "bit {i} should have incremented its counter");
        }
        let set: std::collections::HashSet<usize> = [0, 7, 8, 63, 64, 65, 127, 129].into_iter().collect();
        for i in 0..130 {
            if !set.contains(&i) {
                assert_eq!(counts.as_slice()[i], 0, "bit {i} should not have been touched");
            }
        }

        counts -= &bits;
        assert!(counts.as_slice().iter().all(|&c| c == 0));
    }

    #[test]
    fn monotonic_counting_vector_addition() {
        let mut a = CountingVector::<u32>::with_len(4);
        a.as_mut_slice().copy_from_slice(&[1, 2, 3, 4]);
        let mut b = CountingVector::<u32>::with_len(4);
        b.as_mut_slice().copy_from_slice(&[10, 20, 30, 40]);
        a += &b;
        assert_eq!(a.as_slice(), &[11, 22, 33, 44]);
    }
}
