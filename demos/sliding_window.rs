use hll_sketch::SlidingHyperLogLog;

fn main() -> Result<(), hll_sketch::SketchError> {
    // distinct visitors over the last hour, timestamps in seconds
    let mut visitors = SlidingHyperLogLog::<wyhash::WyHash>::new(0.02, 3600.0)?;
    for second in 0..7200u32 {
        // visitor ids drift over time: 50 per second out of a rolling population
        for k in 0..50 {
            let visitor = second / 10 * 50 + k;
            visitors.insert(f64::from(second), &visitor)?;
        }
    }

    let now = 7199.0;
    println!("last hour    = {:.0}", visitors.cardinality(now));
    println!("last minute  = {:.0}", visitors.cardinality_window(now, 60.0)?);
    println!("last second  = {:.0}", visitors.cardinality_window(now, 1.0)?);
    println!("retained entries = {}", visitors.entry_count());
    Ok(())
}
