//! Byte codec for sketch state.
//!
//! Full state is captured in explicit, versioned state structs, serialized with `bincode`
//! and compressed with zlib. Decoding validates every invariant before a sketch is rebuilt,
//! so a blob either yields a consistent sketch or a [`SketchError`].
//!
//! Registers can also travel alone: a registers-only blob is the zlib-compressed register
//! array, one byte per register. A list of such blobs can be combined into an estimator
//! with a [`RegisterCombinator`].

use std::hash::Hasher;
use std::io::{Read, Write};

use bincode::Options;

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::SketchError;
use crate::hyperloglog::{registers_precision, HyperLogLog};
use crate::minhash::MinHashSketch;
use crate::precision::{Precision, MAX_PRECISION};
use crate::sliding::{Entry, SlidingHyperLogLog};

/// Version written into every full state blob.
pub const FORMAT_VERSION: u8 = 1;

/// Largest register array a registers-only blob may decompress to: `m` at precision 16.
pub const MAX_REGISTERS: usize = 1 << MAX_PRECISION;

/// Largest decompressed full state accepted by decode.
///
/// Covers a precision 16 sliding state with full frontiers, or a minhash sketch of several
/// million values.
pub const MAX_STATE_BYTES: u64 = 64 << 20;

/// Way of combining a list of registers-only blobs into a single register array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegisterCombinator {
    /// Elementwise maximum, equivalent to merging the estimators.
    Or,
    /// Elementwise `sum - min`, saturated at the largest valid rank.
    ///
    /// Experimental: the resulting registers have no rigorous cardinality interpretation.
    And,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct MinHashState {
    pub capacity: u64,
    pub values: Vec<u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct HyperLogLogState {
    pub version: u8,
    pub error_rate: f64,
    pub precision: Precision,
    pub register_count: u32,
    pub alpha: f64,
    pub registers: Vec<u8>,
    pub minhash: Option<MinHashState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub(crate) struct SlidingState {
    pub version: u8,
    pub error_rate: f64,
    pub window: f64,
    pub precision: Precision,
    pub alpha: f64,
    pub buckets: Vec<Vec<Entry>>,
}

impl<H: Hasher + Default> From<&HyperLogLog<H>> for HyperLogLogState {
    fn from(hll: &HyperLogLog<H>) -> Self {
        Self {
            version: FORMAT_VERSION,
            error_rate: hll.error_rate(),
            precision: hll.precision(),
            register_count: hll.register_count() as u32,
            alpha: hll.alpha(),
            registers: hll.registers().to_vec(),
            minhash: hll.minhash().map(|sketch| MinHashState {
                capacity: sketch.capacity() as u64,
                values: sketch.values().to_vec(),
            }),
        }
    }
}

impl<H: Hasher + Default> TryFrom<HyperLogLogState> for HyperLogLog<H> {
    type Error = SketchError;

    fn try_from(state: HyperLogLogState) -> Result<Self, Self::Error> {
        check_version(state.version)?;
        check_parameters(state.error_rate, state.precision, state.alpha)?;
        if state.register_count as usize != state.precision.register_count() {
            return Err(SketchError::corrupt(format!(
                "register count {} does not match precision {}",
                state.register_count,
                state.precision.get()
            )));
        }
        if state.registers.len() != state.precision.register_count() {
            return Err(SketchError::corrupt(format!(
                "{} registers for precision {}",
                state.registers.len(),
                state.precision.get()
            )));
        }
        let minhash = state
            .minhash
            .map(|minhash| {
                let capacity = usize::try_from(minhash.capacity)
                    .map_err(|_| SketchError::corrupt("minhash capacity overflows usize"))?;
                MinHashSketch::from_values(capacity, minhash.values)
            })
            .transpose()?;
        HyperLogLog::from_parts(state.error_rate, state.precision, state.registers, minhash)
    }
}

impl<H: Hasher + Default> From<&SlidingHyperLogLog<H>> for SlidingState {
    fn from(shll: &SlidingHyperLogLog<H>) -> Self {
        Self {
            version: FORMAT_VERSION,
            error_rate: shll.error_rate(),
            window: shll.window(),
            precision: shll.precision(),
            alpha: shll.alpha(),
            buckets: shll.buckets().to_vec(),
        }
    }
}

impl<H: Hasher + Default> TryFrom<SlidingState> for SlidingHyperLogLog<H> {
    type Error = SketchError;

    fn try_from(state: SlidingState) -> Result<Self, Self::Error> {
        check_version(state.version)?;
        check_parameters(state.error_rate, state.precision, state.alpha)?;
        SlidingHyperLogLog::from_parts(
            state.error_rate,
            state.window,
            state.precision,
            state.buckets,
        )
    }
}

fn check_version(version: u8) -> Result<(), SketchError> {
    if version != FORMAT_VERSION {
        return Err(SketchError::corrupt(format!(
            "unsupported format version {version}, expected {FORMAT_VERSION}"
        )));
    }
    Ok(())
}

/// Error rate must derive the stored precision and alpha must be the precision's one.
fn check_parameters(error_rate: f64, precision: Precision, alpha: f64) -> Result<(), SketchError> {
    let derived = Precision::from_error_rate(error_rate)
        .map_err(|err| SketchError::corrupt(err.to_string()))?;
    if derived != precision {
        return Err(SketchError::corrupt(format!(
            "error rate {error_rate} derives precision {}, found {}",
            derived.get(),
            precision.get()
        )));
    }
    if (alpha - precision.alpha()).abs() > 1e-12 {
        return Err(SketchError::corrupt(format!(
            "alpha {alpha} does not match precision {}",
            precision.get()
        )));
    }
    Ok(())
}

fn compress<T: Serialize>(value: &T) -> Result<Vec<u8>, SketchError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    bincode::serialize_into(&mut encoder, value)?;
    Ok(encoder.finish()?)
}

fn decompress<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, SketchError> {
    decompress_with_limit(bytes, MAX_STATE_BYTES)
}

/// Same encoding as `bincode::serialize_into`, reading at most `limit` decompressed bytes.
fn decompress_with_limit<T: DeserializeOwned>(bytes: &[u8], limit: u64) -> Result<T, SketchError> {
    let decoder = ZlibDecoder::new(bytes);
    Ok(bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .allow_trailing_bytes()
        .with_limit(limit)
        .deserialize_from(decoder)?)
}

/// Compress a raw register array into a registers-only blob.
pub fn encode_registers(registers: &[u8]) -> Result<Vec<u8>, SketchError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(registers)?;
    Ok(encoder.finish()?)
}

/// Decompress a registers-only blob into the raw register array.
///
/// Decompression stops after [`MAX_REGISTERS`] bytes; longer blobs are rejected.
/// The result is not validated against any precision; estimators do that when adopting it.
pub fn decode_registers(bytes: &[u8]) -> Result<Vec<u8>, SketchError> {
    let mut registers = Vec::new();
    ZlibDecoder::new(bytes)
        .take(MAX_REGISTERS as u64 + 1)
        .read_to_end(&mut registers)?;
    if registers.len() > MAX_REGISTERS {
        return Err(SketchError::corrupt(format!(
            "registers-only blob holds more than {MAX_REGISTERS} registers"
        )));
    }
    Ok(registers)
}

/// Combine register arrays of equal length with `combinator`.
fn combine(arrays: &[Vec<u8>], combinator: RegisterCombinator, max_rank: u8) -> Vec<u8> {
    let len = arrays.first().map_or(0, Vec::len);
    (0..len)
        .map(|j| {
            let column = arrays.iter().map(|registers| registers[j]);
            match combinator {
                RegisterCombinator::Or => column.max().unwrap_or(0),
                RegisterCombinator::And => {
                    let (sum, min) = column.fold((0u32, u8::MAX), |(sum, min), rank| {
                        (sum + u32::from(rank), min.min(rank))
                    });
                    let combined = (sum - u32::from(min)).min(u32::from(max_rank));
                    combined as u8
                }
            }
        })
        .collect()
}

impl<H: Hasher + Default> HyperLogLog<H> {
    /// Encode full state: parameters, registers and minhash sketch.
    pub fn encode(&self) -> Result<Vec<u8>, SketchError> {
        compress(&HyperLogLogState::from(self))
    }

    /// Decode estimator previously produced by [`HyperLogLog::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, SketchError> {
        let state: HyperLogLogState = decompress(bytes)?;
        let hll = Self::try_from(state)?;
        debug!(
            precision = hll.precision().get(),
            minhash = hll.minhash().is_some(),
            "decoded hyperloglog estimator"
        );
        Ok(hll)
    }

    /// Encode registers only.
    pub fn encode_registers(&self) -> Result<Vec<u8>, SketchError> {
        encode_registers(self.registers())
    }

    /// Replace registers with a registers-only blob and return the new estimate.
    ///
    /// The minhash sketch, if any, is left untouched.
    pub fn set_registers_from_encoded(&mut self, bytes: &[u8]) -> Result<f64, SketchError> {
        let registers = decode_registers(bytes)?;
        self.set_registers(registers)?;
        debug!(precision = self.precision().get(), "adopted encoded registers");
        Ok(self.cardinality())
    }

    /// Replace registers with the combination of registers-only blobs and return the new estimate.
    ///
    /// Every blob must hold exactly `m` registers. Registers of `self` do not take part.
    pub fn set_registers_from_encoded_list<B: AsRef<[u8]>>(
        &mut self,
        blobs: &[B],
        combinator: RegisterCombinator,
    ) -> Result<f64, SketchError> {
        if blobs.is_empty() {
            return Err(SketchError::configuration(
                "at least one register blob is required",
            ));
        }
        let arrays = blobs
            .iter()
            .map(|blob| decode_registers(blob.as_ref()))
            .collect::<Result<Vec<_>, _>>()?;
        if let Some(array) = arrays.iter().find(|a| a.len() != self.register_count()) {
            return Err(SketchError::PrecisionMismatch {
                expected: self.precision().get(),
                found: registers_precision(array.len()),
            });
        }

        if combinator == RegisterCombinator::And {
            warn!(
                blobs = blobs.len(),
                "combining registers with experimental AND operator"
            );
        }
        let max_rank = self.precision().max_rank();
        self.set_registers(combine(&arrays, combinator, max_rank))?;

        debug!(
            precision = self.precision().get(),
            blobs = blobs.len(),
            ?combinator,
            "combined encoded registers"
        );
        Ok(self.cardinality())
    }
}

impl<H: Hasher + Default> SlidingHyperLogLog<H> {
    /// Encode full state: parameters and every bucket frontier.
    pub fn encode(&self) -> Result<Vec<u8>, SketchError> {
        compress(&SlidingState::from(self))
    }

    /// Decode estimator previously produced by [`SlidingHyperLogLog::encode`].
    pub fn decode(bytes: &[u8]) -> Result<Self, SketchError> {
        let state: SlidingState = decompress(bytes)?;
        let shll = Self::try_from(state)?;
        debug!(
            precision = shll.precision().get(),
            window = shll.window(),
            entries = shll.entry_count(),
            "decoded sliding hyperloglog estimator"
        );
        Ok(shll)
    }
}

#[cfg(test)]
pub mod tests {
    use super::*;
    use test_case::test_case;
    use wyhash::WyHash;

    fn filled(n: u64, minhash: Option<usize>) -> HyperLogLog<WyHash> {
        let mut hll = match minhash {
            Some(capacity) => HyperLogLog::with_minhash(0.01, capacity).unwrap(),
            None => HyperLogLog::new(0.01).unwrap(),
        };
        for i in 0..n {
            hll.insert(&i);
        }
        hll
    }

    #[test_case(0, None; "empty")]
    #[test_case(1, None; "single element")]
    #[test_case(1000, None; "thousand elements")]
    #[test_case(100_000, Some(256); "with minhash")]
    fn test_round_trip(n: u64, minhash: Option<usize>) {
        let hll = filled(n, minhash);
        let decoded = HyperLogLog::<WyHash>::decode(&hll.encode().unwrap()).unwrap();
        assert_eq!(decoded.registers(), hll.registers());
        assert_eq!(decoded.cardinality(), hll.cardinality());
        assert_eq!(decoded.minhash(), hll.minhash());
        assert_eq!(decoded.error_rate(), hll.error_rate());
    }

    #[test]
    fn test_decoded_estimator_keeps_working() {
        let blob = filled(100, Some(8)).encode().unwrap();
        let mut decoded = HyperLogLog::<WyHash>::decode(&blob).unwrap();
        decoded.insert(&1000u64);
        decoded.merge(&filled(200, None)).unwrap();

        let mut expected = filled(200, None);
        expected.insert(&1000u64);
        assert_eq!(decoded, expected);
    }

    #[test_case(&[]; "empty input")]
    #[test_case(&[1, 2, 3, 4]; "not zlib")]
    #[test_case(&[0x78, 0x9c, 0x03, 0x00, 0x00, 0x00, 0x00, 0x01]; "empty zlib stream")]
    fn test_decode_garbage(bytes: &[u8]) {
        assert!(HyperLogLog::<WyHash>::decode(bytes).is_err());
        assert!(SlidingHyperLogLog::<WyHash>::decode(bytes).is_err());
    }

    /// Zlib stream of `prefix` followed by a run of `zeros` zero bytes.
    fn zlib_bomb(prefix: &[u8], zeros: usize) -> Vec<u8> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(prefix).unwrap();
        let chunk = vec![0u8; 1 << 20];
        for _ in 0..zeros / chunk.len() {
            encoder.write_all(&chunk).unwrap();
        }
        encoder.finish().unwrap()
    }

    #[test]
    fn test_decode_registers_bounded() {
        let bomb = zlib_bomb(&[], 8 << 20);
        assert!(bomb.len() < 1 << 20);
        assert!(matches!(
            decode_registers(&bomb),
            Err(SketchError::CorruptState(_))
        ));

        let mut hll = HyperLogLog::<WyHash>::new(0.26).unwrap();
        assert!(matches!(
            hll.set_registers_from_encoded(&bomb),
            Err(SketchError::CorruptState(_))
        ));
        assert!(matches!(
            hll.set_registers_from_encoded_list(&[&bomb], RegisterCombinator::Or),
            Err(SketchError::CorruptState(_))
        ));
        assert!(hll.is_empty());

        let largest = encode_registers(&vec![0; MAX_REGISTERS]).unwrap();
        assert_eq!(decode_registers(&largest).unwrap().len(), MAX_REGISTERS);
    }

    #[test]
    fn test_decode_state_bounded() {
        let blob = filled(100_000, Some(4096)).encode().unwrap();
        assert!(matches!(
            decompress_with_limit::<HyperLogLogState>(&blob, 1024),
            Err(SketchError::Codec(_))
        ));
        assert!(decompress_with_limit::<HyperLogLogState>(&blob, MAX_STATE_BYTES).is_ok());

        // valid header, then a register count prefix of 2^40 backed by a run of zeros
        let precision = Precision::new(14).unwrap();
        let mut prefix = vec![FORMAT_VERSION];
        prefix.extend(0.01f64.to_le_bytes());
        prefix.push(precision.get());
        prefix.extend(16384u32.to_le_bytes());
        prefix.extend(precision.alpha().to_le_bytes());
        prefix.extend((1u64 << 40).to_le_bytes());
        let bomb = zlib_bomb(&prefix, 8 << 20);
        assert!(matches!(
            decompress_with_limit::<HyperLogLogState>(&bomb, 1 << 20),
            Err(SketchError::Codec(_))
        ));
        assert!(HyperLogLog::<WyHash>::decode(&bomb).is_err());
        assert!(SlidingHyperLogLog::<WyHash>::decode(&bomb).is_err());
    }

    #[test]
    fn test_decode_rejects_invalid_state() {
        let valid = HyperLogLogState::from(&filled(10, Some(4)));
        let decode = |state: &HyperLogLogState| {
            HyperLogLog::<WyHash>::decode(&compress(state).unwrap())
        };
        assert!(decode(&valid).is_ok());

        let mut state = valid.clone();
        state.version = 2;
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));

        let mut state = valid.clone();
        state.registers.pop();
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));

        let mut state = valid.clone();
        state.register_count = 8192;
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));

        let mut state = valid.clone();
        state.registers[0] = 60;
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));

        let mut state = valid.clone();
        state.alpha = 0.5;
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));

        let mut state = valid.clone();
        state.error_rate = 0.05;
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));

        let mut state = valid.clone();
        state.minhash = Some(MinHashState {
            capacity: 2,
            values: vec![5, 3],
        });
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));
    }

    #[test]
    fn test_registers_round_trip() {
        let hll = filled(500, None);
        let blob = hll.encode_registers().unwrap();
        assert_eq!(decode_registers(&blob).unwrap(), hll.registers());

        let mut other = HyperLogLog::<WyHash>::with_minhash(0.01, 4).unwrap();
        other.insert_hash(7);
        let estimate = other.set_registers_from_encoded(&blob).unwrap();
        assert_eq!(estimate, hll.cardinality());
        assert_eq!(other, hll);
        // minhash sketch is left untouched
        assert_eq!(other.minhash().unwrap().values(), &[7]);
    }

    #[test]
    fn test_set_registers_from_encoded_mismatch() {
        let blob = filled(500, None).encode_registers().unwrap();
        let mut small = HyperLogLog::<WyHash>::new(0.05).unwrap();
        assert!(matches!(
            small.set_registers_from_encoded(&blob),
            Err(SketchError::PrecisionMismatch {
                expected: 9,
                found: 14
            })
        ));
        assert!(small.is_empty());
    }

    #[test]
    fn test_or_combinator_matches_merge() {
        let a = filled(1000, None);
        let mut b = HyperLogLog::<WyHash>::new(0.01).unwrap();
        for i in 500..3000u64 {
            b.insert(&i);
        }
        let blobs = [a.encode_registers().unwrap(), b.encode_registers().unwrap()];

        let mut combined = HyperLogLog::<WyHash>::new(0.01).unwrap();
        combined.insert(&"ignored");
        let estimate = combined
            .set_registers_from_encoded_list(&blobs, RegisterCombinator::Or)
            .unwrap();

        let mut merged = a.clone();
        merged.merge(&b).unwrap();
        assert_eq!(combined, merged);
        assert_eq!(estimate, merged.cardinality());
    }

    #[test_case(&[&[1, 2, 0], &[3, 2, 0]] => vec![3, 2, 0]; "two arrays")]
    #[test_case(&[&[1, 2, 0], &[3, 2, 0], &[2, 5, 1]] => vec![5, 7, 1]; "three arrays")]
    #[test_case(&[&[4, 0, 9]] => vec![0, 0, 0]; "single array")]
    #[test_case(&[&[40, 40, 1], &[40, 40, 1]] => vec![40, 40, 1]; "saturated")]
    fn test_and_combinator(arrays: &[&[u8]]) -> Vec<u8> {
        let arrays: Vec<Vec<u8>> = arrays.iter().map(|a| a.to_vec()).collect();
        combine(&arrays, RegisterCombinator::And, 40)
    }

    #[test]
    fn test_and_combinator_on_estimator() {
        let mut a = HyperLogLog::<WyHash>::new(0.26).unwrap();
        let mut b = HyperLogLog::<WyHash>::new(0.26).unwrap();
        let mut registers = vec![0; 16];
        registers[0] = 60;
        a.set_registers(registers.clone()).unwrap();
        registers[0] = 61;
        b.set_registers(registers).unwrap();

        let (a, b) = (a.encode_registers().unwrap(), b.encode_registers().unwrap());
        let blobs = [&a, &b, &b];
        let mut combined = HyperLogLog::<WyHash>::new(0.26).unwrap();
        combined
            .set_registers_from_encoded_list(&blobs, RegisterCombinator::And)
            .unwrap();
        // 60 + 61 + 61 - 60 saturates at the largest rank for p = 4
        assert_eq!(combined.registers()[0], 61);
        assert_eq!(combined.zero_registers(), 15);
    }

    #[test]
    fn test_encoded_list_errors() {
        let mut hll = HyperLogLog::<WyHash>::new(0.01).unwrap();
        let empty: [Vec<u8>; 0] = [];
        assert!(matches!(
            hll.set_registers_from_encoded_list(&empty, RegisterCombinator::Or),
            Err(SketchError::Configuration(_))
        ));

        let blobs = [
            filled(10, None).encode_registers().unwrap(),
            HyperLogLog::<WyHash>::new(0.05)
                .unwrap()
                .encode_registers()
                .unwrap(),
        ];
        assert!(matches!(
            hll.set_registers_from_encoded_list(&blobs, RegisterCombinator::Or),
            Err(SketchError::PrecisionMismatch { .. })
        ));
        assert!(hll.is_empty());
    }

    #[test]
    fn test_sliding_round_trip() {
        let mut shll = SlidingHyperLogLog::<WyHash>::new(0.05, 100.0).unwrap();
        for i in 0..5000u64 {
            shll.insert(i as f64 / 25.0, &i).unwrap();
        }
        let decoded = SlidingHyperLogLog::<WyHash>::decode(&shll.encode().unwrap()).unwrap();
        assert_eq!(decoded, shll);
        assert_eq!(decoded.window(), 100.0);
        assert_eq!(decoded.cardinality(200.0), shll.cardinality(200.0));
    }

    #[test]
    fn test_sliding_decode_rejects_invalid_state() {
        let mut shll = SlidingHyperLogLog::<WyHash>::new(0.26, 10.0).unwrap();
        shll.insert(1.0, "k1").unwrap();
        let valid = SlidingState::from(&shll);
        let decode = |state: &SlidingState| {
            SlidingHyperLogLog::<WyHash>::decode(&compress(state).unwrap())
        };
        assert!(decode(&valid).is_ok());

        let mut state = valid.clone();
        state.window = -1.0;
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));

        let mut state = valid.clone();
        state.buckets.truncate(8);
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));

        let mut state = valid.clone();
        state.buckets[0] = vec![
            Entry {
                timestamp: 2.0,
                rank: 1,
            },
            Entry {
                timestamp: 1.0,
                rank: 2,
            },
        ];
        assert!(matches!(decode(&state), Err(SketchError::CorruptState(_))));
    }
}
