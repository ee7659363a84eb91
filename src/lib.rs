//! `hll-sketch` estimates the number of distinct elements in a stream, over the whole stream
//! or over a trailing time window, and the overlap between several streams.
//!
//! - [`HyperLogLog`]: HyperLogLog with empirical bias correction and an optional embedded
//!   [`MinHashSketch`].
//! - [`SlidingHyperLogLog`]: sliding window HyperLogLog keeping a pruned history per register.
//! - [`overlap`]: jaccard index, intersection cardinality and containment over estimators
//!   owning minhash sketches.
//!
//! Bias correction defaults to [`ModelCalibration`], reference vectors derived from a model
//! rather than the published empirical tables; see [`calibration`] for supplying those.
//!
//! ```
//! use hll_sketch::HyperLogLog;
//!
//! let mut hll = HyperLogLog::<wyhash::WyHash>::new(0.01)?;
//! for i in 0..1000 {
//!     hll.insert(&i);
//! }
//! assert!((hll.cardinality() - 1000.0).abs() < 50.0);
//! # Ok::<(), hll_sketch::SketchError>(())
//! ```
pub mod calibration;
pub mod codec;
pub mod error;
pub mod hash;
pub mod hyperloglog;
pub mod minhash;
pub mod overlap;
pub mod precision;
#[cfg(feature = "with_serde")]
mod serde;
pub mod sliding;

pub use calibration::{
    Calibration, CalibrationData, CalibrationTable, ModelCalibration, TableCalibration,
};
pub use codec::RegisterCombinator;
pub use error::SketchError;
pub use hyperloglog::HyperLogLog;
pub use minhash::{MinHashSketch, DEFAULT_MINHASH_CAPACITY};
pub use precision::Precision;
pub use sliding::SlidingHyperLogLog;
