#![no_main]

use hll_sketch::HyperLogLog;
use libfuzzer_sys::fuzz_target;

fuzz_target!(|data: &[u8]| {
    if let Ok(mut estimator) = serde_json::from_slice::<HyperLogLog>(data) {
        estimator.insert(&1);
        assert!(estimator.cardinality() > 0.0);
    }
});
