#![no_main]

use hll_sketch::codec::decode_registers;
use hll_sketch::{HyperLogLog, SlidingHyperLogLog};
use libfuzzer_sys::fuzz_target;
use wyhash::WyHash;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut estimator) = HyperLogLog::<WyHash>::decode(data) {
        estimator.insert(&1);
        assert!(estimator.cardinality() > 0.0);
    }
    if let Ok(mut estimator) = SlidingHyperLogLog::<WyHash>::decode(data) {
        estimator.insert(0.0, &1).unwrap();
        assert!(estimator.cardinality(0.0).is_finite());
    }
    if decode_registers(data).is_ok() {
        let mut estimator = HyperLogLog::<WyHash>::new(0.26).unwrap();
        if let Ok(estimate) = estimator.set_registers_from_encoded(data) {
            assert!(estimate.is_finite());
        }
    }
});
