use hll_sketch::{HyperLogLog, RegisterCombinator};

fn main() -> Result<(), hll_sketch::SketchError> {
    let mut estimator1 = HyperLogLog::<wyhash::WyHash>::new(0.01)?;
    for i in 0..10 {
        estimator1.insert(&i);
    }
    println!("estimator1 estimate = {}", estimator1.cardinality());

    let mut estimator2 = HyperLogLog::<wyhash::WyHash>::new(0.01)?;
    for i in 10..15 {
        estimator2.insert(&i);
    }
    println!("estimator2 estimate = {}", estimator2.cardinality());

    let blobs = [estimator1.encode_registers()?, estimator2.encode_registers()?];

    estimator1.merge(&estimator2)?;
    println!("merged estimate = {}", estimator1.cardinality());

    let encoded = estimator1.encode()?;
    let decoded = HyperLogLog::<wyhash::WyHash>::decode(&encoded)?;
    println!(
        "decoded estimate = {} ({} bytes encoded)",
        decoded.cardinality(),
        encoded.len()
    );

    let mut combined = HyperLogLog::<wyhash::WyHash>::new(0.01)?;
    let estimate = combined.set_registers_from_encoded_list(&blobs, RegisterCombinator::Or)?;
    println!("estimate from encoded registers = {estimate}");
    Ok(())
}
