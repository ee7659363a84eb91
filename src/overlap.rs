//! Set overlap estimation over HyperLogLog estimators owning minhash sketches.
//!
//! Each estimator contributes two summaries of its set: the registers give its
//! cardinality, the minhash sketch gives a uniform sample of its hashes (the `k`
//! smallest). Overlap is estimated from the samples and scaled by the union cardinality:
//!
//! - [`jaccard`]: `|intersection| / |union|` of the sample sets.
//! - [`corrected_samples`]: truncates every sample to `round(k * own / max)` smallest
//!   values, where `own` is the estimator's cardinality and `max` the largest one,
//!   so that all samples represent their sets with equal density.
//! - [`corrected_jaccard`]: jaccard over corrected samples.
//! - [`intersection_cardinality`]: corrected jaccard times the cardinality of the
//!   register-wise union of all estimators.
//! - [`containment`]: intersection cardinality relative to each estimator's sample size.

use std::collections::HashSet;
use std::hash::Hasher;

use crate::error::SketchError;
use crate::hyperloglog::HyperLogLog;
use crate::minhash::MinHashSketch;

/// Jaccard index of sample sets, `|intersection| / |union|`.
///
/// Fails with [`SketchError::EmptySet`] if there are no samples or any of them is empty.
pub fn jaccard<S: AsRef<[u64]>>(samples: &[S]) -> Result<f64, SketchError> {
    if samples.is_empty() || samples.iter().any(|s| s.as_ref().is_empty()) {
        return Err(SketchError::EmptySet);
    }

    let union: HashSet<u64> = samples
        .iter()
        .flat_map(|s| s.as_ref().iter().copied())
        .collect();
    let first: HashSet<u64> = samples[0].as_ref().iter().copied().collect();
    let rest: Vec<HashSet<u64>> = samples[1..]
        .iter()
        .map(|s| s.as_ref().iter().copied().collect())
        .collect();
    let intersection = first
        .iter()
        .filter(|x| rest.iter().all(|set| set.contains(x)))
        .count();

    Ok(intersection as f64 / union.len() as f64)
}

/// Minhash samples truncated to equal sampling density.
pub fn corrected_samples<'a, H: Hasher + Default>(
    estimators: &[&'a HyperLogLog<H>],
) -> Result<Vec<&'a [u64]>, SketchError> {
    let sketches = minhash_sketches(estimators)?;
    let cardinalities: Vec<f64> = estimators.iter().map(|hll| hll.cardinality()).collect();
    let max_cardinality = cardinalities.iter().copied().fold(0.0, f64::max);

    Ok(sketches
        .iter()
        .zip(&cardinalities)
        .map(|(sketch, &cardinality)| {
            let len = if max_cardinality > 0.0 {
                (sketch.capacity() as f64 * cardinality / max_cardinality).round() as usize
            } else {
                0
            };
            &sketch.values()[..len.min(sketch.len())]
        })
        .collect())
}

/// Jaccard index over density corrected samples
pub fn corrected_jaccard<H: Hasher + Default>(
    estimators: &[&HyperLogLog<H>],
) -> Result<f64, SketchError> {
    jaccard(corrected_samples(estimators)?.as_slice())
}

/// Estimated size of the intersection of all estimators' sets.
pub fn intersection_cardinality<H: Hasher + Default>(
    estimators: &[&HyperLogLog<H>],
) -> Result<f64, SketchError> {
    let jaccard = corrected_jaccard(estimators)?;
    let union = union_of(estimators)?;
    Ok((jaccard * union.cardinality()).round())
}

/// Intersection cardinality divided by each estimator's own real sample count.
pub fn containment<H: Hasher + Default>(
    estimators: &[&HyperLogLog<H>],
) -> Result<Vec<f64>, SketchError> {
    let intersection = intersection_cardinality(estimators)?;
    Ok(minhash_sketches(estimators)?
        .iter()
        .map(|sketch| intersection / sketch.len() as f64)
        .collect())
}

/// Smallest cardinality estimate of the collection
pub fn min_cardinality<H: Hasher + Default>(estimators: &[&HyperLogLog<H>]) -> Option<f64> {
    estimators
        .iter()
        .map(|hll| hll.cardinality())
        .reduce(f64::min)
}

/// Largest cardinality estimate of the collection
pub fn max_cardinality<H: Hasher + Default>(estimators: &[&HyperLogLog<H>]) -> Option<f64> {
    estimators
        .iter()
        .map(|hll| hll.cardinality())
        .reduce(f64::max)
}

/// Register-only union of all estimators
fn union_of<H: Hasher + Default>(
    estimators: &[&HyperLogLog<H>],
) -> Result<HyperLogLog<H>, SketchError> {
    let (first, rest) = estimators.split_first().ok_or(SketchError::EmptySet)?;
    let mut union = first.registers_only();
    union.merge_all(rest.iter().copied())?;
    Ok(union)
}

/// Minhash sketches of all estimators, which must exist and share capacity.
fn minhash_sketches<'a, H: Hasher + Default>(
    estimators: &[&'a HyperLogLog<H>],
) -> Result<Vec<&'a MinHashSketch>, SketchError> {
    if estimators.is_empty() {
        return Err(SketchError::EmptySet);
    }
    let sketches = estimators
        .iter()
        .map(|hll| {
            hll.minhash().ok_or_else(|| {
                SketchError::configuration("overlap estimation requires minhash sketches")
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    let capacity = sketches[0].capacity();
    if let Some(other) = sketches.iter().find(|s| s.capacity() != capacity) {
        return Err(SketchError::configuration(format!(
            "minhash capacities differ: {capacity} and {}",
            other.capacity()
        )));
    }
    Ok(sketches)
}
