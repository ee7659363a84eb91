use hll_sketch::overlap::{containment, corrected_jaccard, intersection_cardinality};
use hll_sketch::{HyperLogLog, DEFAULT_MINHASH_CAPACITY};

fn main() -> Result<(), hll_sketch::SketchError> {
    let mut monday = HyperLogLog::<wyhash::WyHash>::with_minhash(0.01, DEFAULT_MINHASH_CAPACITY)?;
    let mut tuesday = HyperLogLog::<wyhash::WyHash>::with_minhash(0.01, DEFAULT_MINHASH_CAPACITY)?;
    for user in 0..60_000u64 {
        monday.insert(&user);
    }
    for user in 40_000..100_000u64 {
        tuesday.insert(&user);
    }

    let days = [&monday, &tuesday];
    println!("monday       = {:.0}", monday.cardinality());
    println!("tuesday      = {:.0}", tuesday.cardinality());
    println!("jaccard      = {:.3}", corrected_jaccard(&days)?);
    println!("both days    = {:.0}", intersection_cardinality(&days)?);
    println!("containment  = {:?}", containment(&days)?);
    Ok(())
}
