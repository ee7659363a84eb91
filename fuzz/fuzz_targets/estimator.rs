#![no_main]

use hll_sketch::{HyperLogLog, SlidingHyperLogLog};
use libfuzzer_sys::fuzz_target;
use wyhash::{wyhash, WyHash};

fuzz_target!(|data: &[u8]| {
    if data.is_empty() {
        return;
    }

    let split_index = wyhash(data, 0) as usize % data.len();
    let (first_half, second_half) = data.split_at(split_index);

    let mut estimator1 = HyperLogLog::<WyHash>::with_minhash(0.05, 16).unwrap();
    let mut sliding = SlidingHyperLogLog::<WyHash>::new(0.05, 8.0).unwrap();
    for (t, chunk) in first_half.chunks(4).enumerate() {
        estimator1.insert(&chunk);
        sliding.insert(t as f64, &chunk).unwrap();
        assert!(estimator1.cardinality() > 0.0);
        assert!(sliding.cardinality(t as f64) > 0.0);
    }

    let mut estimator2 = HyperLogLog::<WyHash>::with_minhash(0.05, 16).unwrap();
    for chunk in second_half.chunks(4) {
        estimator2.insert(&chunk);
        assert!(estimator2.cardinality().is_finite());
    }

    estimator1.merge(&estimator2).unwrap();
    assert!(estimator1.cardinality().is_finite());
    assert!(estimator1.minhash().unwrap().len() <= 16);
});
