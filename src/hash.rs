//! Hash and rank utilities shared by the plain and sliding estimators.
//!
//! A 64-bit hash `x` is split into:
//! - `j = x & (m - 1)`: register index taken from the low `p` bits,
//! - `w = x >> p`: the remaining `64 - p` bits used for rank computation.
//!
//! Rank of `w` is `max_width - bit_length(w) + 1`, so an all-zero suffix
//! yields the largest rank `max_width + 1`.

use std::hash::{BuildHasher, BuildHasherDefault, Hash, Hasher};

use crate::error::SketchError;
use crate::precision::Precision;

/// Hash an item with a default-constructed hasher `H`.
#[inline]
pub(crate) fn hash_item<T, H>(build_hasher: &BuildHasherDefault<H>, item: &T) -> u64
where
    T: Hash + ?Sized,
    H: Hasher + Default,
{
    let mut hasher = build_hasher.build_hasher();
    item.hash(&mut hasher);
    hasher.finish()
}

/// Position of the highest set bit plus one, 0 for `w = 0`.
#[inline]
pub fn bit_length(w: u64) -> u32 {
    u64::BITS - w.leading_zeros()
}

/// Rank of `w` within `max_width` bits.
///
/// Fails with [`SketchError::Overflow`] when `w` has more significant bits than `max_width`,
/// which means the hash width and the precision disagree.
#[inline]
pub fn rank(w: u64, max_width: u32) -> Result<u8, SketchError> {
    let bit_length = bit_length(w);
    if bit_length > max_width {
        return Err(SketchError::Overflow {
            bit_length,
            max_width,
        });
    }
    Ok((max_width - bit_length + 1) as u8)
}

/// Split hash `x` into register index and rank for precision `p`.
///
/// # Panics
///
/// Never under a 64-bit hash: `x >> p` always fits into `64 - p` bits.
/// A rank overflow here is a broken internal contract and is treated as fatal.
#[inline]
pub fn bucket_and_rank(x: u64, p: Precision) -> (usize, u8) {
    let j = (x & (p.register_count() as u64 - 1)) as usize;
    let w = x >> p.get();
    match rank(w, p.max_width()) {
        Ok(rank) => (j, rank),
        Err(err) => panic!("{err}"),
    }
}
