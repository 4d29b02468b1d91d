//! Linear-interpolation resampling for interleaved stereo i16

/// Resample one channel
fn resample(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = f64::from(to_rate) / f64::from(from_rate);
    let (from, to) = (u64::from(from_rate), u64::from(to_rate));
    let output_len = ((samples.len() as u64 * to + from - 1) / from) as usize;
    let last = samples[samples.len() - 1];

    (0..output_len)
        .map(|i| {
            let pos = i as f64 / ratio;
            let idx = pos.floor() as usize;
            let frac = pos - idx as f64;
            match (samples.get(idx), samples.get(idx + 1)) {
                (Some(&a), Some(&b)) => {
                    let a = f64::from(a);
                    (a + (f64::from(b) - a) * frac) as i16
                }
                (Some(&a), None) => a,
                _ => last,
            }
        })
        .collect()
}

/// Resample interleaved stereo, one channel at a time
pub fn resample_stereo(samples: &[i16], from_rate: u32, to_rate: u32) -> Vec<i16> {
    if from_rate == to_rate || samples.is_empty() {
        return samples.to_vec();
    }

    let (left, right): (Vec<i16>, Vec<i16>) = samples
        .chunks_exact(2)
        .map(|pair| (pair[0], pair[1]))
        .unzip();

    let left = resample(&left, from_rate, to_rate);
    let right = resample(&right, from_rate, to_rate);

    left.into_iter()
        .zip(right)
        .flat_map(|(l, r)| [l, r])
        .collect()
}
