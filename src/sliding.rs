//! Sliding window HyperLogLog answering cardinality queries over a trailing time window.
//!
//! Instead of a single rank, bucket `j` keeps a list of `(timestamp, rank)` entries:
//! the "possible future maxima". An entry is retained only while it is within `window`
//! of the newest timestamp of its bucket and no newer entry has an equal or larger rank.
//! Lists are therefore ordered by ascending timestamp with strictly decreasing rank.
//!
//! Every write (insert or merge) combines the already sorted lists of the bucket and
//! re-derives the frontier with a single backward scan:
//!
//! ```text
//! t:     1   4   5   9   12
//! rank:  7   2   5   3   1        window = 10, newest = 12
//! keep:  -   -   5   3   1        t=1 is out of window, rank 2 at t=4 is dominated by 5
//! ```
//!
//! A query at time `t` over `w <= window` uses, per bucket, the largest rank among entries
//! with timestamp `>= t - w` as the register value and applies the plain HyperLogLog
//! estimate with small and large range corrections. No empirical bias correction is applied.

use std::cmp::{Ordering, Reverse};
use std::collections::BinaryHeap;
use std::fmt::{Debug, Formatter};
use std::hash::{BuildHasherDefault, Hash, Hasher};

use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use wyhash::WyHash;

use crate::error::SketchError;
use crate::hash::{bucket_and_rank, hash_item};
use crate::precision::{ensure_same, Precision};

/// Size of the 64-bit hash space, `2^64`.
const HASH_SPACE: f64 = 18_446_744_073_709_551_616.0;

/// Single observation retained in a bucket frontier.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    pub timestamp: f64,
    pub rank: u8,
}

impl Entry {
    /// Total order by timestamp, then rank.
    #[inline]
    fn cmp_key(&self, other: &Self) -> Ordering {
        self.timestamp
            .total_cmp(&other.timestamp)
            .then(self.rank.cmp(&other.rank))
    }
}

pub struct SlidingHyperLogLog<H: Hasher + Default = WyHash> {
    error_rate: f64,
    /// Longest window a query may span, in timestamp units
    window: f64,
    precision: Precision,
    alpha: f64,
    /// `m` bucket frontiers
    buckets: Vec<Vec<Entry>>,
    build_hasher: BuildHasherDefault<H>,
}

impl<H: Hasher + Default> SlidingHyperLogLog<H> {
    /// Create estimator for target relative `error_rate` and maximum query `window`.
    pub fn new(error_rate: f64, window: f64) -> Result<Self, SketchError> {
        let precision = Precision::from_error_rate(error_rate)?;
        validate_window(window)?;
        Ok(Self {
            error_rate,
            window,
            precision,
            alpha: precision.alpha(),
            buckets: vec![Vec::new(); precision.register_count()],
            build_hasher: BuildHasherDefault::default(),
        })
    }

    /// Rebuild estimator from decoded parts, validating every bucket frontier.
    pub(crate) fn from_parts(
        error_rate: f64,
        window: f64,
        precision: Precision,
        buckets: Vec<Vec<Entry>>,
    ) -> Result<Self, SketchError> {
        validate_window(window).map_err(|err| SketchError::corrupt(err.to_string()))?;
        if buckets.len() != precision.register_count() {
            return Err(SketchError::corrupt(format!(
                "{} buckets for precision {}",
                buckets.len(),
                precision.get()
            )));
        }
        let max_rank = precision.max_rank();
        for (j, bucket) in buckets.iter().enumerate() {
            if let Some(entry) = bucket
                .iter()
                .find(|e| !e.timestamp.is_finite() || e.rank == 0 || e.rank > max_rank)
            {
                return Err(SketchError::corrupt(format!(
                    "bucket {j} holds invalid entry {entry:?}"
                )));
            }
            if !bucket.windows(2).all(|w| w[0].cmp_key(&w[1]).is_lt()) {
                return Err(SketchError::corrupt(format!("bucket {j} is not sorted")));
            }
            if frontier(bucket.clone(), window) != *bucket {
                return Err(SketchError::corrupt(format!(
                    "bucket {j} holds dominated or expired entries"
                )));
            }
        }

        Ok(Self {
            error_rate,
            window,
            precision,
            alpha: precision.alpha(),
            buckets,
            build_hasher: BuildHasherDefault::default(),
        })
    }

    /// Insert a hashable item observed at `timestamp`.
    #[inline]
    pub fn insert<T: Hash + ?Sized>(
        &mut self,
        timestamp: f64,
        item: &T,
    ) -> Result<(), SketchError> {
        let hash = hash_item(&self.build_hasher, item);
        self.insert_hash(timestamp, hash)
    }

    /// Insert 64-bit hash observed at `timestamp`, which must be finite.
    pub fn insert_hash(&mut self, timestamp: f64, hash: u64) -> Result<(), SketchError> {
        if !timestamp.is_finite() {
            return Err(SketchError::configuration(format!(
                "timestamp {timestamp} must be finite"
            )));
        }
        let (j, rank) = bucket_and_rank(hash, self.precision);
        let entry = Entry { timestamp, rank };

        let bucket = &mut self.buckets[j];
        let pos = bucket.partition_point(|e| e.cmp_key(&entry).is_le());
        bucket.insert(pos, entry);
        *bucket = frontier(std::mem::take(bucket), self.window);

        trace!(bucket = j, entries = bucket.len(), "rewrote sliding bucket frontier");
        Ok(())
    }

    /// Merge `rhs` into `self`.
    #[inline]
    pub fn merge(&mut self, rhs: &Self) -> Result<(), SketchError> {
        self.merge_all([rhs])
    }

    /// Merge all `others` into `self`, pruning every bucket with the window of `self`.
    ///
    /// Fails without modifying `self` if any operand has a different precision.
    pub fn merge_all<'a, I>(&mut self, others: I) -> Result<(), SketchError>
    where
        I: IntoIterator<Item = &'a Self>,
        H: 'a,
    {
        let others: Vec<&Self> = others.into_iter().collect();
        for other in &others {
            ensure_same(self.precision, other.precision)?;
        }

        for (j, bucket) in self.buckets.iter_mut().enumerate() {
            let mut lists: Vec<&[Entry]> = Vec::with_capacity(others.len() + 1);
            lists.push(bucket.as_slice());
            lists.extend(others.iter().map(|other| other.buckets[j].as_slice()));
            if lists.iter().skip(1).all(|list| list.is_empty()) {
                continue;
            }
            let merged = merge_sorted(&lists);
            *bucket = frontier(merged, self.window);
        }

        debug!(
            precision = self.precision.get(),
            operands = others.len(),
            window = self.window,
            "merged sliding hyperloglog estimators"
        );
        Ok(())
    }

    /// Estimate cardinality of items observed in `[t - window, ...]`.
    #[inline]
    pub fn cardinality(&self, t: f64) -> f64 {
        self.estimate(&self.snapshot(t, self.window))
    }

    /// Estimate cardinality of items observed in `[t - w, ...]`, where `0 < w <= window`.
    pub fn cardinality_window(&self, t: f64, w: f64) -> Result<f64, SketchError> {
        Ok(self.estimate(&self.register_snapshot(t, w)?))
    }

    /// Effective registers of a query at time `t` over window `w`.
    pub fn register_snapshot(&self, t: f64, w: f64) -> Result<Vec<u8>, SketchError> {
        if !(w > 0.0 && w <= self.window) {
            return Err(SketchError::WindowRange {
                requested: w,
                configured: self.window,
            });
        }
        Ok(self.snapshot(t, w))
    }

    fn snapshot(&self, t: f64, w: f64) -> Vec<u8> {
        let horizon = t - w;
        self.buckets
            .iter()
            .map(|bucket| {
                bucket
                    .iter()
                    .rev()
                    .take_while(|e| e.timestamp >= horizon)
                    .map(|e| e.rank)
                    .max()
                    .unwrap_or(0)
            })
            .collect()
    }

    /// HyperLogLog estimate with linear counting below `2.5m`
    /// and large range correction above `2^64 / 30`.
    fn estimate(&self, registers: &[u8]) -> f64 {
        let m = registers.len() as f64;
        let sum: f64 = registers
            .iter()
            .map(|&rank| 2f64.powi(-i32::from(rank)))
            .sum();
        let estimate = self.alpha * m * m / sum;

        if estimate <= 2.5 * m {
            let zeros = registers.iter().filter(|&&rank| rank == 0).count();
            if zeros > 0 {
                m * (m / zeros as f64).ln()
            } else {
                estimate
            }
        } else if estimate <= HASH_SPACE / 30.0 {
            estimate
        } else {
            -HASH_SPACE * (1.0 - estimate / HASH_SPACE).ln()
        }
    }

    /// Compare bucket frontiers of estimators with equal precision.
    pub fn try_eq(&self, other: &Self) -> Result<bool, SketchError> {
        ensure_same(self.precision, other.precision)?;
        Ok(self.buckets == other.buckets)
    }

    /// Frontier of bucket `j`, `None` if `j >= m`.
    #[inline]
    pub fn bucket(&self, j: usize) -> Option<&[Entry]> {
        self.buckets.get(j).map(Vec::as_slice)
    }

    /// Total number of retained entries across all buckets
    pub fn entry_count(&self) -> usize {
        self.buckets.iter().map(Vec::len).sum()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(Vec::is_empty)
    }

    pub fn clear(&mut self) {
        self.buckets.iter_mut().for_each(Vec::clear);
    }

    #[inline]
    pub fn window(&self) -> f64 {
        self.window
    }

    #[inline]
    pub fn precision(&self) -> Precision {
        self.precision
    }

    #[inline]
    pub fn register_count(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn alpha(&self) -> f64 {
        self.alpha
    }

    #[inline]
    pub fn error_rate(&self) -> f64 {
        self.error_rate
    }

    pub(crate) fn buckets(&self) -> &[Vec<Entry>] {
        &self.buckets
    }
}

fn validate_window(window: f64) -> Result<(), SketchError> {
    if !(window > 0.0 && window.is_finite()) {
        return Err(SketchError::configuration(format!(
            "window {window} must be positive and finite"
        )));
    }
    Ok(())
}

/// Heap item of the k-way merge: next unread entry of list `source`.
struct Cursor {
    entry: Entry,
    source: usize,
    pos: usize,
}

impl PartialEq for Cursor {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other).is_eq()
    }
}

impl Eq for Cursor {}

impl PartialOrd for Cursor {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Cursor {
    fn cmp(&self, other: &Self) -> Ordering {
        self.entry
            .cmp_key(&other.entry)
            .then(self.source.cmp(&other.source))
    }
}

/// Merge already sorted entry lists into a single sorted list.
fn merge_sorted(lists: &[&[Entry]]) -> Vec<Entry> {
    let mut merged = Vec::with_capacity(lists.iter().map(|list| list.len()).sum());
    let mut heap: BinaryHeap<Reverse<Cursor>> = lists
        .iter()
        .enumerate()
        .filter_map(|(source, list)| {
            list.first().map(|&entry| {
                Reverse(Cursor {
                    entry,
                    source,
                    pos: 0,
                })
            })
        })
        .collect();

    while let Some(Reverse(cursor)) = heap.pop() {
        merged.push(cursor.entry);
        let next = cursor.pos + 1;
        if let Some(&entry) = lists[cursor.source].get(next) {
            heap.push(Reverse(Cursor {
                entry,
                source: cursor.source,
                pos: next,
            }));
        }
    }
    merged
}

/// Re-derive the frontier of a sorted entry list.
///
/// Scanning from the newest entry backward, an entry is kept if it is not older than
/// `newest - window` and its rank exceeds every rank kept so far.
fn frontier(sorted: Vec<Entry>, window: f64) -> Vec<Entry> {
    let Some(newest) = sorted.last() else {
        return sorted;
    };
    let horizon = newest.timestamp - window;

    let mut kept = Vec::with_capacity(sorted.len().min(8));
    let mut best = 0;
    for entry in sorted.iter().rev() {
        if entry.timestamp < horizon {
            break;
        }
        if entry.rank > best {
            kept.push(*entry);
            best = entry.rank;
        }
    }
    kept.reverse();
    kept
}

// Manual `Clone` implementation to avoid an unnecessary `Clone` bound on the hasher type.
impl<H: Hasher + Default> Clone for SlidingHyperLogLog<H> {
    fn clone(&self) -> Self {
        Self {
            error_rate: self.error_rate,
            window: self.window,
            precision: self.precision,
            alpha: self.alpha,
            buckets: self.buckets.clone(),
            build_hasher: BuildHasherDefault::default(),
        }
    }
}

impl<H: Hasher + Default> PartialEq for SlidingHyperLogLog<H> {
    fn eq(&self, rhs: &Self) -> bool {
        self.precision == rhs.precision && self.buckets == rhs.buckets
    }
}

impl<H: Hasher + Default> Debug for SlidingHyperLogLog<H> {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlidingHyperLogLog")
            .field("precision", &self.precision.get())
            .field("window", &self.window)
            .field("entries", &self.entry_count())
            .finish_non_exhaustive()
    }
}
