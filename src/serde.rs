//! # Serde support for the estimators
//!
//! Enabled by the `with_serde` feature. Estimators are serialized through the same
//! versioned state structs the byte codec uses:
//! - `HyperLogLog`: version, error rate, precision, register count, alpha, registers
//!   and the optional minhash sketch (capacity and real values),
//! - `SlidingHyperLogLog`: version, error rate, window, precision, alpha and bucket frontiers.
//!
//! Deserialization runs the same validation as [`HyperLogLog::decode`], so an invalid
//! document is reported as a deserialization error instead of producing a broken sketch.
use std::hash::Hasher;

use serde::de::Error;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::codec::{HyperLogLogState, SlidingState};
use crate::hyperloglog::HyperLogLog;
use crate::sliding::SlidingHyperLogLog;

impl<H: Hasher + Default> Serialize for HyperLogLog<H> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        HyperLogLogState::from(self).serialize(serializer)
    }
}

impl<'de, H: Hasher + Default> Deserialize<'de> for HyperLogLog<H> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let state = HyperLogLogState::deserialize(deserializer)?;
        Self::try_from(state).map_err(D::Error::custom)
    }
}

impl<H: Hasher + Default> Serialize for SlidingHyperLogLog<H> {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        SlidingState::from(self).serialize(serializer)
    }
}

impl<'de, H: Hasher + Default> Deserialize<'de> for SlidingHyperLogLog<H> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let state = SlidingState::deserialize(deserializer)?;
        Self::try_from(state).map_err(D::Error::custom)
    }
}
