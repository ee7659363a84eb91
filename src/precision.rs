//! Precision parameter shared by the plain and sliding estimators.
//!
//! Precision `p` is derived once from the target relative error `e`:
//! `p = ceil(log2((1.04 / e)^2))`, and must fall into `[4..16]` range.
//! It defines number of registers `m = 2^p`, register index width (`p` low bits
//! of a hash) and rank width (`64 - p` remaining bits).
//!
//! Expected error:
//!   p = 9:  1.04 / sqrt(2^9)  = 4.60%
//!   p = 12: 1.04 / sqrt(2^12) = 1.62%
//!   p = 14: 1.04 / sqrt(2^14) = 0.81%
//!   p = 16: 1.04 / sqrt(2^16) = 0.41%

use serde::{Deserialize, Serialize};

use crate::error::SketchError;

/// Smallest supported precision.
pub const MIN_PRECISION: u8 = 4;
/// Largest supported precision.
pub const MAX_PRECISION: u8 = 16;
/// Width of hashes fed into the estimators.
pub const HASH_BITS: u32 = 64;

/// Validated precision `p` in `[MIN_PRECISION..MAX_PRECISION]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Precision(u8);

impl Precision {
    /// Create precision from raw `p`, failing if it is out of range.
    pub fn new(p: u8) -> Result<Self, SketchError> {
        if !(MIN_PRECISION..=MAX_PRECISION).contains(&p) {
            return Err(SketchError::configuration(format!(
                "p={p} should be in range [{MIN_PRECISION} : {MAX_PRECISION}]"
            )));
        }
        Ok(Self(p))
    }

    /// Derive precision from target relative error `error_rate = 1.04 / sqrt(m)`.
    pub fn from_error_rate(error_rate: f64) -> Result<Self, SketchError> {
        if !(error_rate > 0.0 && error_rate < 1.0) {
            return Err(SketchError::configuration(format!(
                "error rate {error_rate} must be between 0 and 1"
            )));
        }
        let p = (1.04 / error_rate).powi(2).log2().ceil();
        if !(f64::from(MIN_PRECISION)..=f64::from(MAX_PRECISION)).contains(&p) {
            return Err(SketchError::configuration(format!(
                "error rate {error_rate} requires precision {p}, \
                 supported range is [{MIN_PRECISION} : {MAX_PRECISION}]"
            )));
        }
        Self::new(p as u8)
    }

    /// Raw `p` value
    #[inline]
    pub fn get(self) -> u8 {
        self.0
    }

    /// Number of registers `m = 2^p`
    #[inline]
    pub fn register_count(self) -> usize {
        1 << self.0
    }

    /// Number of hash bits left for rank computation, `64 - p`.
    #[inline]
    pub fn max_width(self) -> u32 {
        HASH_BITS - u32::from(self.0)
    }

    /// Largest rank a register can hold, `64 - p + 1`.
    #[inline]
    pub fn max_rank(self) -> u8 {
        (self.max_width() + 1) as u8
    }

    /// Bias correction constant of the raw harmonic-mean estimate.
    #[inline]
    pub fn alpha(self) -> f64 {
        match self.0 {
            4 => 0.673,
            5 => 0.697,
            6 => 0.709,
            _ => 0.7213 / (1.0 + 1.079 / (self.register_count() as f64)),
        }
    }

    /// Expected relative standard error `1.04 / sqrt(m)`.
    #[inline]
    pub fn relative_error(self) -> f64 {
        1.04 / (self.register_count() as f64).sqrt()
    }

    /// Index into per-precision tables.
    #[inline]
    pub(crate) fn table_index(self) -> usize {
        usize::from(self.0 - MIN_PRECISION)
    }

    /// Iterate over all supported precisions in ascending order.
    pub fn all() -> impl Iterator<Item = Precision> {
        (MIN_PRECISION..=MAX_PRECISION).map(Precision)
    }
}

impl TryFrom<u8> for Precision {
    type Error = SketchError;

    fn try_from(p: u8) -> Result<Self, Self::Error> {
        Self::new(p)
    }
}

impl From<Precision> for u8 {
    fn from(p: Precision) -> Self {
        p.0
    }
}

/// Ensure two precisions agree, reporting `expected` as the receiver's one.
#[inline]
pub(crate) fn ensure_same(expected: Precision, found: Precision) -> Result<(), SketchError> {
    if expected != found {
        return Err(SketchError::PrecisionMismatch {
            expected: expected.get(),
            found: found.get(),
        });
    }
    Ok(())
}
