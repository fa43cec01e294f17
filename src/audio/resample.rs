//! Integer-ratio resampling between the 8 kHz telephony rate and the
//! assistant's 24 kHz PCM rate. Each call works on one frame only.

/// Linear interpolation; original samples land on every `factor`-th output.
pub fn upsample(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }
    let mut out = Vec::with_capacity(samples.len() * factor);
    for (i, &current) in samples.iter().enumerate() {
        // 帧尾没有下一个采样点，保持最后一个值
        let next = samples.get(i + 1).copied().unwrap_or(current) as i32;
        let current = current as i32;
        for step in 0..factor {
            let value = current + (next - current) * step as i32 / factor as i32;
            out.push(value as i16);
        }
    }
    out
}

/// Box-filter decimation: each output sample is the mean of `factor` inputs.
/// A short trailing group is averaged over what is there.
pub fn downsample(samples: &[i16], factor: usize) -> Vec<i16> {
    if factor <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(factor)
        .map(|group| {
            let sum: i32 = group.iter().map(|&s| s as i32).sum();
            (sum / group.len() as i32) as i16
        })
        .collect()
}
