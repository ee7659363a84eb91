//! Calibration tables used by the bias-corrected HyperLogLog estimate.
//!
//! Every precision `p` in `[4..16]` has three calibration values:
//! - reference vector of raw estimates at known cardinalities,
//! - matching vector of biases (`raw estimate - true cardinality`),
//! - linear counting threshold below which linear counting is preferred.
//!
//! Bias of a raw estimate `E` is interpolated as the average bias of the
//! 6 reference points nearest to `E` by squared distance.
//!
//! Two sources are supported:
//! - [`ModelCalibration`] (default): thresholds are the published HyperLogLog++
//!   constants, reference vectors are derived once per process from the Poisson
//!   model of register values on a cardinality grid spanning `[0, 6m]`.
//! - [`TableCalibration`]: externally supplied tables, e.g. the published empirical data.
//!
//! The model vectors are not the published empirical vectors, so bias corrected estimates
//! made with the default calibration do not match other HyperLogLog++ implementations
//! bit-for-bit. Load the published tables with [`TableCalibration::from_json`] and pass
//! them to `HyperLogLog::cardinality_with` when exact parity is needed.
//!
//! [HyperLogLog++ paper](https://static.googleusercontent.com/media/research.google.com/en//pubs/archive/40671.pdf)

use std::sync::OnceLock;

use enum_dispatch::enum_dispatch;
use serde::{Deserialize, Serialize};

use crate::error::SketchError;
use crate::precision::{Precision, MAX_PRECISION, MIN_PRECISION};

/// Number of nearest reference points averaged by bias interpolation.
const NEAREST_NEIGHBORS: usize = 6;
/// Number of cardinality grid points of model derived reference vectors.
const MODEL_POINTS: usize = 200;
/// Model grid spans cardinalities `[0, MODEL_SPAN * m]`.
const MODEL_SPAN: f64 = 6.0;
/// Number of supported precisions.
const PRECISIONS: usize = (MAX_PRECISION - MIN_PRECISION + 1) as usize;

/// Published linear counting thresholds for precision in [4..16] range.
const THRESHOLD_DATA: [f64; PRECISIONS] = [
    10.0, 20.0, 40.0, 80.0, 220.0, 400.0, 900.0, 1800.0, 3100.0, 6500.0, 11500.0, 20000.0,
    50000.0,
];

/// Calibration sources supported by the estimators
#[derive(Debug, Clone)]
#[enum_dispatch]
pub enum Calibration {
    Model(ModelCalibration),
    Table(TableCalibration),
}

/// Calibration lookup service keyed by precision.
#[enum_dispatch(Calibration)]
pub trait CalibrationTable {
    /// Raw estimate reference vector for precision `p`.
    fn raw_estimates(&self, p: Precision) -> &[f64];

    /// Bias vector matching [`CalibrationTable::raw_estimates`] elementwise.
    fn biases(&self, p: Precision) -> &[f64];

    /// Linear counting threshold for precision `p`.
    fn threshold(&self, p: Precision) -> f64;

    /// Interpolate bias of `raw` estimate from its nearest reference points.
    fn estimate_bias(&self, raw: f64, p: Precision) -> f64 {
        nearest_neighbor_bias(raw, self.raw_estimates(p), self.biases(p))
    }
}

impl Default for Calibration {
    fn default() -> Self {
        Calibration::Model(ModelCalibration)
    }
}

/// Reference data of a single precision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationData {
    pub raw_estimates: Vec<f64>,
    pub biases: Vec<f64>,
    pub threshold: f64,
}

/// Calibration derived from the Poisson model of register values.
#[derive(Debug, Clone, Copy, Default)]
pub struct ModelCalibration;

impl ModelCalibration {
    fn data(p: Precision) -> &'static CalibrationData {
        static MODEL: OnceLock<Vec<CalibrationData>> = OnceLock::new();
        let tables = MODEL.get_or_init(|| Precision::all().map(model_data).collect());
        &tables[p.table_index()]
    }
}

impl CalibrationTable for ModelCalibration {
    #[inline]
    fn raw_estimates(&self, p: Precision) -> &[f64] {
        &Self::data(p).raw_estimates
    }

    #[inline]
    fn biases(&self, p: Precision) -> &[f64] {
        &Self::data(p).biases
    }

    #[inline]
    fn threshold(&self, p: Precision) -> f64 {
        THRESHOLD_DATA[p.table_index()]
    }
}

/// Externally supplied calibration tables, one entry per precision in [4..16] range.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Vec<CalibrationData>", into = "Vec<CalibrationData>")]
pub struct TableCalibration {
    tables: Vec<CalibrationData>,
}

impl TableCalibration {
    /// Create calibration from per-precision tables ordered by ascending precision.
    pub fn new(tables: Vec<CalibrationData>) -> Result<Self, SketchError> {
        if tables.len() != PRECISIONS {
            return Err(SketchError::configuration(format!(
                "calibration requires {PRECISIONS} tables, got {}",
                tables.len()
            )));
        }
        for (table, p) in tables.iter().zip(Precision::all()) {
            if table.raw_estimates.len() != table.biases.len() {
                return Err(SketchError::configuration(format!(
                    "calibration for p={} has {} raw estimates and {} biases",
                    p.get(),
                    table.raw_estimates.len(),
                    table.biases.len()
                )));
            }
            if !(table.threshold.is_finite() && table.threshold >= 0.0) {
                return Err(SketchError::configuration(format!(
                    "calibration for p={} has invalid threshold {}",
                    p.get(),
                    table.threshold
                )));
            }
        }
        Ok(Self { tables })
    }

    /// Load calibration tables from JSON array of `{raw_estimates, biases, threshold}` objects.
    pub fn from_json(json: &str) -> Result<Self, SketchError> {
        serde_json::from_str(json)
            .map_err(|e| SketchError::configuration(format!("invalid calibration tables: {e}")))
    }

    fn data(&self, p: Precision) -> &CalibrationData {
        &self.tables[p.table_index()]
    }
}

impl TryFrom<Vec<CalibrationData>> for TableCalibration {
    type Error = SketchError;

    fn try_from(tables: Vec<CalibrationData>) -> Result<Self, Self::Error> {
        Self::new(tables)
    }
}

impl From<TableCalibration> for Vec<CalibrationData> {
    fn from(calibration: TableCalibration) -> Self {
        calibration.tables
    }
}

impl CalibrationTable for TableCalibration {
    #[inline]
    fn raw_estimates(&self, p: Precision) -> &[f64] {
        &self.data(p).raw_estimates
    }

    #[inline]
    fn biases(&self, p: Precision) -> &[f64] {
        &self.data(p).biases
    }

    #[inline]
    fn threshold(&self, p: Precision) -> f64 {
        self.data(p).threshold
    }
}

/// Average bias of the reference points nearest to `raw`, ties broken by lower index.
fn nearest_neighbor_bias(raw: f64, raw_estimates: &[f64], biases: &[f64]) -> f64 {
    let mut distances: Vec<(f64, usize)> = raw_estimates
        .iter()
        .enumerate()
        .map(|(idx, &estimate)| ((raw - estimate).powi(2), idx))
        .collect();
    if distances.is_empty() {
        return 0.0;
    }
    distances.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));

    let nearest = &distances[..NEAREST_NEIGHBORS.min(distances.len())];
    nearest.iter().map(|&(_, idx)| biases[idx]).sum::<f64>() / nearest.len() as f64
}

/// Derive reference vectors for precision `p`.
///
/// With `n` items spread over `m` registers, each register holds the maximum of
/// Poisson(`n / m`) geometric ranks, so `P(M <= k) = exp(-n / m * 2^-k)` below the
/// maximum rank. Mean raw estimate is expanded to second order around `E[sum 2^-M]`.
fn model_data(p: Precision) -> CalibrationData {
    let m = p.register_count() as f64;
    let max_rank = i32::from(p.max_rank());
    let alpha = p.alpha();

    let (raw_estimates, biases) = (0..MODEL_POINTS)
        .map(|i| {
            let n = i as f64 * MODEL_SPAN * m / (MODEL_POINTS - 1) as f64;
            let lambda = n / m;

            // first and second moments of 2^-M
            let (mut mean, mut square, mut cdf_prev) = (0.0, 0.0, 0.0);
            for k in 0..=max_rank {
                let cdf = if k == max_rank {
                    1.0
                } else {
                    (-lambda * 2f64.powi(-k)).exp()
                };
                let pk = cdf - cdf_prev;
                cdf_prev = cdf;
                mean += 2f64.powi(-k) * pk;
                square += 4f64.powi(-k) * pk;
            }
            let variance = square - mean * mean;
            let raw = alpha * m / mean * (1.0 + variance / (m * mean * mean));
            (raw, raw - n)
        })
        .unzip();

    CalibrationData {
        raw_estimates,
        biases,
        threshold: THRESHOLD_DATA[p.table_index()],
    }
}
