//! HyperLogLog cardinality estimator with empirical bias correction.
//!
//! The estimator owns `m = 2^p` registers, where register `j` holds the largest rank
//! observed among hashes whose low `p` bits equal `j`. Registers never decrease,
//! which makes merging a register-wise maximum: commutative, associative and idempotent.
//!
//! # Cardinality estimate
//!
//! 1. Raw estimate `E = alpha * m^2 / sum(2^-M[i])`.
//! 2. Bias corrected estimate `Ep = E - bias(E, p)` if `E <= 5m`, otherwise `E`.
//! 3. With `V > 0` zero registers, linear counting `H = m * ln(m / V)` is returned
//!    if `H <= threshold(p)`, otherwise `Ep`.
//!
//! Bias and threshold come from a [`CalibrationTable`].
//!
//! # Minhash
//!
//! An estimator may own a [`MinHashSketch`] fed with the same 64-bit hashes,
//! enabling set overlap estimation (see [`crate::overlap`]). The sketch takes part in
//! merges, but not in equality: two estimators with identical registers are equal
//! regardless of their minhash contents.

use std::fmt::{Debug, Formatter};
use std::hash::{BuildHasherDefault, Hash, Hasher};

use tracing::debug;
use wyhash::WyHash;

use crate::calibration::{Calibration, CalibrationTable};
use crate::error::SketchError;
use crate::hash::{bucket_and_rank, hash_item};
use crate::minhash::MinHashSketch;
use crate::precision::{ensure_same, Precision};

pub struct HyperLogLog<H: Hasher + Default = WyHash> {
    /// Target relative error the precision was derived from
    error_rate: f64,
    precision: Precision,
    /// Bias constant of the raw estimate, depends only on precision
    alpha: f64,
    /// `m` registers holding the largest rank seen per index
    registers: Vec<u8>,
    /// Optional bounded sample of the smallest hashes
    minhash: Option<MinHashSketch>,
    /// Zero-sized build hasher
    build_hasher: BuildHasherDefault<H>,
}

impl<H: Hasher + Default> HyperLogLog<H> {
    /// Create estimator for target relative `error_rate` in (0, 1).
    pub fn new(error_rate: f64) -> Result<Self, SketchError> {
        let precision = Precision::from_error_rate(error_rate)?;
        Ok(Self::with_parts(error_rate, precision, None))
    }

    /// Create estimator owning a minhash sketch of `capacity` slots.
    pub fn with_minhash(error_rate: f64, capacity: usize) -> Result<Self, SketchError> {
        let precision = Precision::from_error_rate(error_rate)?;
        let minhash = MinHashSketch::new(capacity)?;
        Ok(Self::with_parts(error_rate, precision, Some(minhash)))
    }

    fn with_parts(error_rate: f64, precision: Precision, minhash: Option<MinHashSketch>) -> Self {
        Self {
            error_rate,
            precision,
            alpha: precision.alpha(),
            registers: vec![0; precision.register_count()],
            minhash,
            build_hasher: BuildHasherDefault::default(),
        }
    }

    /// Rebuild estimator from decoded parts, validating register invariants.
    pub(crate) fn from_parts(
        error_rate: f64,
        precision: Precision,
        registers: Vec<u8>,
        minhash: Option<MinHashSketch>,
    ) -> Result<Self, SketchError> {
        let mut hll = Self::with_parts(error_rate, precision, minhash);
        hll.set_registers(registers)?;
        Ok(hll)
    }

    /// Insert a hashable item
    #[inline]
    pub fn insert<T: Hash + ?Sized>(&mut self, item: &T) {
        let hash = hash_item(&self.build_hasher, item);
        self.insert_hash(hash);
    }

    /// Insert 64-bit hash, which must come from the same hash function as all other items.
    #[inline]
    pub fn insert_hash(&mut self, hash: u64) {
        let (j, rank) = bucket_and_rank(hash, self.precision);
        if rank > self.registers[j] {
            self.registers[j] = rank;
        }
        if let Some(minhash) = self.minhash.as_mut() {
            minhash.insert(hash);
        }
    }

    /// Merge `rhs` into `self`.
    #[inline]
    pub fn merge(&mut self, rhs: &Self) -> Result<(), SketchError> {
        self.merge_all([rhs])
    }

    /// Merge all `others` into `self`: every register becomes the maximum across operands.
    ///
    /// Fails without modifying `self` if any operand has a different precision.
    /// When `self` owns a minhash sketch it keeps the smallest values across all
    /// operands' sketches.
    pub fn merge_all<'a, I>(&mut self, others: I) -> Result<(), SketchError>
    where
        I: IntoIterator<Item = &'a Self>,
        H: 'a,
    {
        let others: Vec<&Self> = others.into_iter().collect();
        for other in &others {
            ensure_same(self.precision, other.precision)?;
        }

        for other in &others {
            for (lhs, &rhs) in self.registers.iter_mut().zip(&other.registers) {
                *lhs = (*lhs).max(rhs);
            }
        }
        if let Some(minhash) = self.minhash.as_mut() {
            minhash.merge(others.iter().filter_map(|other| other.minhash.as_ref()));
        }

        debug!(
            precision = self.precision.get(),
            operands = others.len(),
            "merged hyperloglog estimators"
        );
        Ok(())
    }

    /// Return cardinality estimate using the default calibration
    #[inline]
    pub fn cardinality(&self) -> f64 {
        self.cardinality_with(&Calibration::default())
    }

    /// Return cardinality estimate using the provided calibration
    pub fn cardinality_with<C: CalibrationTable + ?Sized>(&self, calibration: &C) -> f64 {
        let zeros = self.zero_registers();
        if zeros > 0 {
            let m = self.register_count() as f64;
            let linear = m * (m / zeros as f64).ln();
            if linear <= calibration.threshold(self.precision) {
                return linear;
            }
        }
        self.bias_corrected_estimate(calibration)
    }

    /// Return cardinality estimate rounded to the nearest integer
    #[inline]
    pub fn count(&self) -> u64 {
        self.cardinality().round() as u64
    }

    /// Raw harmonic-mean estimate `alpha * m^2 / sum(2^-M[i])`
    pub fn raw_estimate(&self) -> f64 {
        let m = self.register_count() as f64;
        let sum: f64 = self
            .registers
            .iter()
            .map(|&rank| 2f64.powi(-i32::from(rank)))
            .sum();
        self.alpha * m * m / sum
    }

    /// Raw estimate corrected by calibration bias in the `E <= 5m` range
    fn bias_corrected_estimate<C: CalibrationTable + ?Sized>(&self, calibration: &C) -> f64 {
        let estimate = self.raw_estimate();
        if estimate <= 5.0 * self.register_count() as f64 {
            estimate - calibration.estimate_bias(estimate, self.precision)
        } else {
            estimate
        }
    }

    /// Compare registers of estimators with equal precision.
    ///
    /// Minhash contents are deliberately not compared.
    pub fn try_eq(&self, other: &Self) -> Result<bool, SketchError> {
        ensure_same(self.precision, other.precision)?;
        Ok(self.registers == other.registers)
    }

    /// Number of registers set to 0
    #[inline]
    pub fn zero_registers(&self) -> usize {
        self.registers.iter().filter(|&&rank| rank == 0).count()
    }

    /// Return whether nothing has been inserted yet
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.registers.iter().all(|&rank| rank == 0)
    }

    /// Reset registers and minhash slots
    pub fn clear(&mut self) {
        self.registers.fill(0);
        if let Some(minhash) = self.minhash.as_mut() {
            minhash.clear();
        }
    }

    #[inline]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    #[inline]
    pub fn register_count(&self) -> usize {
        self.registers.len()
    }

    #[inline]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    #[inline]
    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    #[inline]
    pub fn registers(&self) -> &[u8] {
        &self.registers
    }

    #[inline]
    pub fn minhash(&self) -> Option<&MinHashSketch> {
        self.minhash.as_ref()
    }

    /// Replace registers, checking length against `m` and ranks against `64 - p + 1`.
    pub(crate) fn set_registers(&mut self, registers: Vec<u8>) -> Result<(), SketchError> {
        if registers.len() != self.register_count() {
            return Err(SketchError::PrecisionMismatch {
                expected: self.precision.get(),
                found: registers_precision(registers.len()),
            });
        }
        let max_rank = self.precision.max_rank();
        if let Some((j, rank)) = registers.iter().enumerate().find(|(_, &r)| r > max_rank) {
            return Err(SketchError::corrupt(format!(
                "register {j} holds rank {rank}, maximum is {max_rank}"
            )));
        }
        self.registers = registers;
        Ok(())
    }

    /// Copy of the registers without the minhash sketch
    pub(crate) fn registers_only(&self) -> Self {
        Self {
            error_rate: self.error_rate,
            precision: self.precision,
            alpha: self.alpha,
            registers: self.registers.clone(),
            minhash: None,
            build_hasher: BuildHasherDefault::default(),
        }
    }
}

/// Precision implied by a register array length, saturated for reporting mismatches.
pub(crate) fn registers_precision(len: usize) -> u8 {
    if len == 0 {
        0
    } else {
        len.ilog2().min(u32::from(u8::MAX)) as u8
    }
}

// Manual `Clone` implementation to avoid an unnecessary `Clone` bound on the hasher type.
impl<H: Hasher + Default> Clone for HyperLogLog<H> {
    fn clone(&self) -> Self {
        Self {
            error_rate: self.error_rate,
            precision: self.precision,
            alpha: self.alpha,
            registers: self.registers.clone(),
            minhash: self.minhash.clone(),
            build_hasher: BuildHasherDefault::default(),
        }
    }
}

impl<H: Hasher + Default> PartialEq for HyperLogLog<H> {
    /// Estimators are equal when precision and registers match; minhash is ignored.
    fn eq(&self, rhs: &Self) -> bool {
        self.precision == rhs.precision && self.registers == rhs.registers
    }
}

impl<H: Hasher + Default> Debug for HyperLogLog<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HyperLogLog")
            .field("precision", &self.precision.get())
            .field("estimate", &self.count())
            .field("minhash", &self.minhash.as_ref().map(MinHashSketch::len))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use crate::calibration::{CalibrationData, TableCalibration};
    use crate::hash::bucket_and_rank;
    use test_case::test_case;

    /// Hash landing into register `j` with rank `r` for p = 9.
    fn hash_p9(j: u64, r: u32) -> u64 {
        (1 << (64 - r)) | j
    }

    #[test]
    fn test_new() {
        let hll = HyperLogLog::<WyHash>::new(0.05).unwrap();
        assert_eq!(hll.precision().get(), 9);
        assert_eq!(hll.register_count(), 512);
        assert_eq!(hll.alpha(), 0.7197831133217303);
        assert_eq!(hll.error_rate(), 0.05);
        assert!(hll.is_empty());
        assert!(hll.minhash().is_none());
        assert_eq!(hll.cardinality(), 0.0);
    }

    #[test_case(0.0; "zero error rate")]
    #[test_case(1.5; "error rate above one")]
    #[test_case(0.9; "precision below range")]
    #[test_case(0.0001; "precision above range")]
    fn test_new_invalid(error_rate: f64) {
        assert!(matches!(
            HyperLogLog::<WyHash>::new(error_rate),
            Err(SketchError::Configuration(_))
        ));
    }

    #[test]
    fn test_with_minhash_zero_capacity() {
        assert!(HyperLogLog::<WyHash>::with_minhash(0.05, 0).is_err());
    }

    fn non_zero(hll: &HyperLogLog) -> Vec<(usize, u8)> {
        hll.registers()
            .iter()
            .enumerate()
            .filter(|(_, &r)| r > 0)
            .map(|(j, &r)| (j, r))
            .collect()
    }

    #[test]
    fn test_golden_registers() {
        let mut hll = HyperLogLog::<WyHash>::new(0.05).unwrap();
        for i in 0..10 {
            hll.insert(&i.to_string());
        }
        assert_eq!(
            non_zero(&hll),
            [
                (16, 1),
                (130, 1),
                (176, 1),
                (191, 1),
                (240, 1),
                (263, 1),
                (322, 2),
                (407, 3),
                (490, 1),
                (494, 2)
            ]
        );
        assert_eq!(hll.count(), 10);

        let build_hasher = BuildHasherDefault::<WyHash>::default();
        for i in 0..10 {
            let hash = hash_item(&build_hasher, &i.to_string());
            let (j, rank) = bucket_and_rank(hash, hll.precision());
            assert!(hll.registers()[j] >= rank);
        }
    }

    #[test]
    fn test_insert_hash_keeps_max_rank() {
        let mut hll = HyperLogLog::<WyHash>::new(0.05).unwrap();
        let hashes = [
            hash_p9(31, 1),
            hash_p9(122, 4),
            hash_p9(151, 5),
            hash_p9(443, 2),
            // lower ranks into already populated registers
            hash_p9(122, 2),
            hash_p9(151, 1),
        ];
        hashes.iter().for_each(|&h| hll.insert_hash(h));
        assert_eq!(non_zero(&hll), [(31, 1), (122, 4), (151, 5), (443, 2)]);
    }

    #[test]
    fn test_insert() {
        let mut hll = HyperLogLog::<WyHash>::new(0.01).unwrap();
        assert_eq!(hll.count(), 0);

        hll.insert("test item 1");
        assert_eq!(hll.count(), 1);

        // Re-insert the same item, registers must stay the same.
        let registers = hll.registers().to_vec();
        hll.insert("test item 1");
        assert_eq!(hll.registers(), registers.as_slice());
        assert_eq!(hll.count(), 1);

        hll.insert("test item 2");
        assert_eq!(hll.count(), 2);
    }

    #[test]
    fn test_insert_feeds_minhash() {
        let mut hll = HyperLogLog::<WyHash>::with_minhash(0.05, 2).unwrap();
        hll.insert_hash(30);
        hll.insert_hash(10);
        hll.insert_hash(20);
        assert_eq!(hll.minhash().unwrap().values(), &[10, 20]);
    }

    fn filled(range: std::ops::Range<u64>) -> HyperLogLog {
        let mut hll = HyperLogLog::with_minhash(0.05, 64).unwrap();
        for i in range {
            hll.insert(&i);
        }
        hll
    }

    #[test]
    fn test_merge_commutative_and_associative() {
        let (a, b, c) = (filled(0..1000), filled(500..3000), filled(2500..2600));

        let mut ab = a.clone();
        ab.merge(&b).unwrap();
        let mut ba = b.clone();
        ba.merge(&a).unwrap();
        assert!(ab.try_eq(&ba).unwrap());

        let mut ab_c = ab.clone();
        ab_c.merge(&c).unwrap();
        let mut bc = b.clone();
        bc.merge(&c).unwrap();
        let mut a_bc = a.clone();
        a_bc.merge(&bc).unwrap();
        assert!(ab_c.try_eq(&a_bc).unwrap());

        let mut all = a.clone();
        all.merge_all([&b, &c]).unwrap();
        assert_eq!(all, a_bc);
        assert_eq!(all.minhash(), a_bc.minhash());
        assert_eq!(all, filled(0..3000));
    }

    #[test]
    fn test_merge_idempotent() {
        let a = filled(0..100);
        let mut merged = a.clone();
        merged.merge(&a).unwrap();
        assert_eq!(merged, a);
        assert_eq!(merged.minhash(), a.minhash());
    }

    #[test]
    fn test_merge_precision_mismatch() {
        let mut a = HyperLogLog::<WyHash>::new(0.05).unwrap();
        let b = HyperLogLog::<WyHash>::new(0.01).unwrap();
        let c = HyperLogLog::<WyHash>::new(0.05).unwrap();
        a.insert("x");
        let before = a.clone();

        assert!(matches!(
            a.merge_all([&c, &b]),
            Err(SketchError::PrecisionMismatch {
                expected: 9,
                found: 14
            })
        ));
        // nothing merged when any operand is rejected
        assert_eq!(a, before);
        assert!(a.try_eq(&b).is_err());
    }

    #[test]
    fn test_equality_ignores_minhash() {
        let mut a = HyperLogLog::<WyHash>::with_minhash(0.05, 8).unwrap();
        let mut b = HyperLogLog::<WyHash>::new(0.05).unwrap();
        a.insert_hash(hash_p9(3, 2));
        b.insert_hash(hash_p9(3, 2));
        assert!(a.try_eq(&b).unwrap());
        assert_eq!(a, b);

        let mut c = a.clone();
        c.insert_hash(hash_p9(4, 1));
        assert_ne!(a, c);
    }

    #[test]
    fn test_merge_disjoint_halves() {
        let mut a = HyperLogLog::<WyHash>::new(0.05).unwrap();
        let mut b = HyperLogLog::<WyHash>::new(0.05).unwrap();
        let mut c = HyperLogLog::<WyHash>::new(0.05).unwrap();
        for i in 0..2 {
            a.insert(&i.to_string());
            c.insert(&i.to_string());
        }
        for i in 2..4 {
            b.insert(&i.to_string());
            c.insert(&i.to_string());
        }
        a.merge(&b).unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_eq!(a, c);
    }

    #[test]
    fn test_clear() {
        let mut hll = filled(0..100);
        hll.clear();
        assert!(hll.is_empty());
        assert!(hll.minhash().unwrap().is_empty());
        assert_eq!(hll.count(), 0);
    }

    #[test]
    fn test_cardinality_with_calibration() {
        let mut hll = HyperLogLog::<WyHash>::new(0.05).unwrap();
        for i in 0..200u64 {
            hll.insert(&i);
        }
        let linear = hll.cardinality();

        // zero thresholds and constant bias force the bias corrected branch
        let tables = Precision::all()
            .map(|_| CalibrationData {
                raw_estimates: vec![0.0],
                biases: vec![100.0],
                threshold: 0.0,
            })
            .collect();
        let calibration = TableCalibration::new(tables).unwrap();
        let corrected = hll.cardinality_with(&calibration);
        assert_eq!(corrected, hll.raw_estimate() - 100.0);
        assert!((linear - 200.0).abs() < 30.0);
    }

    #[test]
    fn test_large_range_skips_bias() {
        let mut hll = HyperLogLog::<WyHash>::new(0.26).unwrap();
        for i in 0..10_000u64 {
            hll.insert(&i);
        }
        assert_eq!(hll.zero_registers(), 0);
        assert!(hll.raw_estimate() > 5.0 * 16.0);
        assert_eq!(hll.cardinality(), hll.raw_estimate());
    }

    #[test]
    fn test_set_registers_validation() {
        let mut hll = HyperLogLog::<WyHash>::new(0.05).unwrap();
        assert!(matches!(
            hll.set_registers(vec![0; 1024]),
            Err(SketchError::PrecisionMismatch {
                expected: 9,
                found: 10
            })
        ));
        let mut registers = vec![0; 512];
        registers[7] = 57;
        assert!(matches!(
            hll.set_registers(registers),
            Err(SketchError::CorruptState(_))
        ));
        let mut registers = vec![0; 512];
        registers[7] = 56;
        assert!(hll.set_registers(registers).is_ok());
    }

    #[test]
    fn test_debug() {
        let mut hll = HyperLogLog::<WyHash>::with_minhash(0.05, 4).unwrap();
        hll.insert_hash(hash_p9(1, 1));
        assert_eq!(
            format!("{:?}", hll),
            "HyperLogLog { precision: 9, estimate: 1, minhash: Some(1), .. }"
        );
    }
}
