//! Bounded minimum-hash sketch keeping the `k` smallest distinct hashes ever inserted.
//!
//! Conceptually the sketch always holds exactly `capacity` ascending slots, where slots
//! not yet filled by a real hash hold a sentinel larger than any 64-bit value (`2^64`).
//! Only real values are stored; unfilled slots are implied by `capacity - len`.
//! Inserting a hash smaller than the current maximum slot evicts that maximum.

use std::iter;

use crate::error::SketchError;

/// Minhash capacity used when none is chosen explicitly.
pub const DEFAULT_MINHASH_CAPACITY: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MinHashSketch {
    /// Number of slots `k`
    capacity: usize,
    /// Strictly ascending real hashes, at most `capacity` of them
    values: Vec<u64>,
}

impl MinHashSketch {
    /// Create empty sketch with `capacity` sentinel slots.
    pub fn new(capacity: usize) -> Result<Self, SketchError> {
        if capacity == 0 {
            return Err(SketchError::configuration(
                "minhash capacity must be positive",
            ));
        }
        Ok(Self {
            capacity,
            values: Vec::with_capacity(capacity.min(DEFAULT_MINHASH_CAPACITY)),
        })
    }

    /// Rebuild sketch from previously exported values, validating the invariants.
    pub fn from_values(capacity: usize, values: Vec<u64>) -> Result<Self, SketchError> {
        if capacity == 0 {
            return Err(SketchError::corrupt("minhash capacity must be positive"));
        }
        if values.len() > capacity {
            return Err(SketchError::corrupt(format!(
                "minhash holds {} values, capacity is {capacity}",
                values.len()
            )));
        }
        if !values.windows(2).all(|w| w[0] < w[1]) {
            return Err(SketchError::corrupt(
                "minhash values must be strictly ascending",
            ));
        }
        Ok(Self { capacity, values })
    }

    /// Insert hash `x`, evicting the current maximum slot.
    /// Returns whether the sketch changed.
    #[inline]
    pub fn insert(&mut self, x: u64) -> bool {
        if self.is_full() && self.values.last().is_some_and(|&max| x >= max) {
            return false;
        }
        match self.values.binary_search(&x) {
            Ok(_) => false,
            Err(pos) => {
                self.values.insert(pos, x);
                if self.values.len() > self.capacity {
                    self.values.pop();
                }
                true
            }
        }
    }

    /// Merge other sketches: keep the `capacity` smallest real values of the union.
    pub fn merge<'a, I>(&mut self, others: I)
    where
        I: IntoIterator<Item = &'a MinHashSketch>,
    {
        let mut union = std::mem::take(&mut self.values);
        for other in others {
            union.extend_from_slice(&other.values);
        }
        union.sort_unstable();
        union.dedup();
        union.truncate(self.capacity);
        self.values = union;
    }

    /// Current maximum slot, `None` while an unfilled sentinel slot remains.
    #[inline]
    pub fn current_max(&self) -> Option<u64> {
        if self.is_full() {
            self.values.last().copied()
        } else {
            None
        }
    }

    /// Real (non-sentinel) values in ascending order
    #[inline]
    pub fn values(&self) -> &[u64] {
        &self.values
    }

    /// All `capacity` slots in ascending order, unfilled slots as `None`
    pub fn slots(&self) -> impl Iterator<Item = Option<u64>> + '_ {
        self.values
            .iter()
            .copied()
            .map(Some)
            .chain(iter::repeat(None).take(self.capacity - self.values.len()))
    }

    /// Number of slots
    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of real values
    #[inline]
    pub fn len(&self) -> usize {
        self.values.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Whether every slot holds a real value
    #[inline]
    pub fn is_full(&self) -> bool {
        self.values.len() == self.capacity
    }

    /// Drop all real values, restoring sentinel slots.
    pub fn clear(&mut self) {
        self.values.clear();
    }
}
