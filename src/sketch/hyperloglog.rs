//! HyperLogLog cardinality sketch.
//!
//! Treated by the original spec as an opaque external collaborator, but a
//! concrete implementation is required to make the layout DP and build
//! procedure testable end to end. The algorithm here follows the reference
//! implementation exactly: same hash mixing, same bias-correction constants,
//! same small-range linear-counting fallback.

use crate::error::{HibfError, Result};

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const MIN_BITS: u8 = 5;
const MAX_BITS: u8 = 32;

/// `1 / 2^i` for `i` in `0..61`, used to weight each register's rank during
/// estimation.
fn expectation_values() -> [f64; 61] {
    let mut values = [0.0f64; 61];
    for (i, v) in values.iter_mut().enumerate() {
        *v = 1.0 / ((1u64 << i) as f64);
    }
    values
}

/// A HyperLogLog cardinality estimator.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
pub struct Hyperloglog {
    bits: u8,
    size: u64,
    rank_mask: u64,
    normalization_factor: f64,
    data: Vec<u8>,
}

impl Default for Hyperloglog {
    fn default() -> Self {
        Self::new(5).expect("5 is a valid bit width")
    }
}

impl Hyperloglog {
    /// Creates a sketch with `num_bits` register-index bits (precision),
    /// allocating `2^num_bits` registers. Must be in `[5, 32]`.
    pub fn new(num_bits: u8) -> Result<Self> {
        if !(MIN_BITS..=MAX_BITS).contains(&num_bits) {
            return Err(HibfError::InvalidConfig(format!(
                "hyperloglog num_bits must be in [{MIN_BITS},{MAX_BITS}], got {num_bits}"
            )));
        }
        let size = 1u64 << num_bits;
        let correction_factor = if size == 32 {
            0.697
        } else if size == 64 {
            0.709
        } else {
            0.7213 / (1.0 + 1.079 / (size as f64))
        };
        let normalization_factor = correction_factor * (size as f64) * (size as f64);
        let rank_mask = (1u64 << num_bits) - 1;

        Ok(Self {
            bits: num_bits,
            size,
            rank_mask,
            normalization_factor,
            data: vec![0u8; size as usize],
        })
    }

    /// `wyhash`-style mixing used to derive a well-distributed 64-bit hash
    /// from an input value: `result = value * C; low64(result) xor high64(result)`.
    #[inline]
    fn wyhash(value: u64) -> u64 {
        let result = (value as u128).wrapping_mul(0x9E3779B97F4A7C15);
        (result as u64) ^ ((result >> 64) as u64)
    }

    /// Adds a value to the sketch.
    pub fn add(&mut self, value: u64) {
        let hash = Self::wyhash(value);
        let index = (hash >> (64 - self.bits)) as usize;
        let rank = ((hash << self.bits) | self.rank_mask).leading_zeros() as u8 + 1;
        if rank > self.data[index] {
            self.data[index] = rank;
        }
    }

    /// Estimates the cardinality of all values added so far.
    pub fn estimate(&self) -> f64 {
        let exp = expectation_values();
        let mut sum = 0.0f64;
        for &r in &self.data {
            sum += exp[r as usize];
        }

        let mut estimate = self.normalization_factor / sum;

        if estimate <= 2.5 * (self.size as f64) {
            let zeros = self.data.iter().filter(|&&r| r == 0).count();
            if zeros != 0 {
                estimate = (self.size as f64) * ((self.size as f64) / (zeros as f64)).ln();
            }
        }

        estimate
    }

    /// Merges `other` into `self` (element-wise max of registers), as if
    /// every value added to `other` had also been added to `self`.
    ///
    /// Merging sketches with differing `bits` is a logic error (debug
    /// assertion; release behaviour is undefined).
    pub fn merge(&mut self, other: &Hyperloglog) {
        debug_assert_eq!(self.bits, other.bits, "cannot merge hyperloglog sketches of differing precision");
        for (a, b) in self.data.iter_mut().zip(other.data.iter()) {
            if *b > *a {
                *a = *b;
            }
        }
    }

    /// Merges `other` into `self` and returns the new estimate.
    pub fn merge_and_estimate(&mut self, other: &Hyperloglog) -> f64 {
        self.merge(other);
        self.estimate()
    }

    /// Clears all added values without changing the sketch's size.
    pub fn reset(&mut self) {
        for r in &mut self.data {
            *r = 0;
        }
    }

    /// Size of the internal register array, `2^bits`.
    pub fn data_size(&self) -> u64 {
        self.size
    }

    /// Bit width (precision) the sketch was constructed with.
    pub fn bits(&self) -> u8 {
        self.bits
    }

    /// Writes `bits` then the raw register array.
    pub fn store<W: std::io::Write>(&self, w: &mut W) -> std::io::Result<()> {
        w.write_all(&[self.bits])?;
        w.write_all(&self.data)?;
        Ok(())
    }

    /// Reads a sketch previously written by [`Self::store`].
    pub fn load<R: std::io::Read>(r: &mut R) -> Result<Self> {
        let mut bits_buf = [0u8; 1];
        r.read_exact(&mut bits_buf)?;
        let mut sketch = Self::new(bits_buf[0])?;
        r.read_exact(&mut sketch.data)?;
        Ok(sketch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_out_of_range_bits() {
        assert!(Hyperloglog::new(4).is_err());
        assert!(Hyperloglog::new(33).is_err());
        assert!(Hyperloglog::new(12).is_ok());
    }

    #[test]
    fn estimate_is_roughly_correct_for_distinct_values() {
        let mut sketch = Hyperloglog::new(12).unwrap();
        for v in 0..10_000u64 {
            sketch.add(v * 0x9E3779B97F4A7C15 ^ v);
        }
        let est = sketch.estimate();
        let relative_error = (est - 10_000.0).abs() / 10_000.0;
        assert!(relative_error < 0.1, "estimate {est} too far from 10000");
    }

    #[test]
    fn merge_matches_union_of_added_values() {
        let mut a = Hyperloglog::new(12).unwrap();
        let mut b = Hyperloglog::new(12).unwrap();
        for v in 0..5000u64 {
            a.add(v);
        }
        for v in 3000..8000u64 {
            b.add(v);
        }
        a.merge(&b);
        let est = a.estimate();
        let relative_error = (est - 8000.0).abs() / 8000.0;
        assert!(relative_error < 0.15, "merged estimate {est} too far from 8000");
    }

    #[test]
    fn store_load_roundtrip() {
        let mut sketch = Hyperloglog::new(10).unwrap();
        for v in 0..1000u64 {
            sketch.add(v);
        }
        let mut buf = Vec::new();
        sketch.store(&mut buf).unwrap();
        let mut cursor = std::io::Cursor::new(buf);
        let loaded = Hyperloglog::load(&mut cursor).unwrap();
        assert_eq!(sketch, loaded);
    }

    #[test]
    fn reset_clears_estimate_to_near_zero() {
        let mut sketch = Hyperloglog::new(10).unwrap();
        for v in 0..1000u64 {
            sketch.add(v);
        }
        sketch.reset();
        assert!(sketch.estimate() < 50.0);
    }
}
