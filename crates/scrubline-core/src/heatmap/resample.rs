/// Resamples `samples` to exactly `target` values by bucket averaging.
///
/// Output `i` averages `samples[floor(i*N/T)..floor((i+1)*N/T)]`. When the
/// bucket is empty (upsampling) it repeats the sample at the bucket start, and
/// falls back to `default` past the end or for an empty source.
pub fn resample(samples: &[f64], target: usize, default: f64) -> Vec<f64> {
    let n = samples.len();
    if n == 0 {
        return vec![default; target];
    }

    (0..target)
        .map(|i| {
            let start = i * n / target;
            let end = (i + 1) * n / target;
            if end > start {
                let bucket = &samples[start..end];
                bucket.iter().sum::<f64>() / bucket.len() as f64
            } else {
                samples.get(start).copied().unwrap_or(default)
            }
        })
        .collect()
}
