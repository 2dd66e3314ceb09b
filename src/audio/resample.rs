//! Sample conversion helpers: channel downmix and integer-ratio downsampling

/// Average interleaved frames down to one channel
pub fn downmix_to_mono(samples: &[i16], channels: u16) -> Vec<i16> {
    if channels <= 1 {
        return samples.to_vec();
    }

    samples
        .chunks(channels as usize)
        .map(|frame| {
            let sum: i32 = frame.iter().map(|&s| s as i32).sum();
            (sum / frame.len() as i32) as i16
        })
        .collect()
}

/// Rate the pipeline actually produces for a `source` → `target` request.
///
/// Only integer ratios are resampled; anything else keeps the source rate.
pub fn effective_rate(source_rate: u32, target_rate: u32) -> u32 {
    if source_rate == 0 || target_rate == 0 || source_rate % target_rate != 0 {
        source_rate
    } else {
        target_rate
    }
}

/// Downsample by averaging groups of `source_rate / target_rate` samples
///
/// Returns the input unchanged if the rates match or the ratio is not an
/// integer (e.g. 44.1kHz → 16kHz).
pub fn downsample(samples: &[i16], source_rate: u32, target_rate: u32) -> Vec<i16> {
    if target_rate == 0 || source_rate == 0 {
        log::warn!(
            "Invalid sample rate (source: {}, target: {}), returning original",
            source_rate,
            target_rate
        );
        return samples.to_vec();
    }

    if source_rate == target_rate {
        return samples.to_vec();
    }

    if source_rate % target_rate != 0 {
        return samples.to_vec();
    }

    let ratio = (source_rate / target_rate) as usize;

    samples
        .chunks(ratio)
        .map(|group| {
            let sum: i64 = group.iter().map(|&s| s as i64).sum();
            (sum / group.len() as i64) as i16
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_downmix_stereo() {
        let stereo = vec![100i16, 300, -200, 200, 50, 51];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![200, 0, 50]);
    }

    #[test]
    fn test_downmix_mono_passthrough() {
        let mono = vec![1i16, 2, 3];
        assert_eq!(downmix_to_mono(&mono, 1), mono);
    }

    #[test]
    fn test_downsample_48k_to_16k() {
        let input = vec![30i16, 60, 90, -30, -60, -90];
        assert_eq!(downsample(&input, 48000, 16000), vec![60, -60]);
    }

    #[test]
    fn test_downsample_unsupported_ratio() {
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 44100, 16000), input);
        assert_eq!(effective_rate(44100, 16000), 44100);
    }

    #[test]
    fn test_effective_rate() {
        assert_eq!(effective_rate(48000, 16000), 16000);
        assert_eq!(effective_rate(16000, 16000), 16000);
        assert_eq!(effective_rate(48000, 0), 48000);
    }

    #[test]
    fn test_downsample_zero_rate() {
        let input = vec![100i16, 200, 300];
        assert_eq!(downsample(&input, 48000, 0), input);
        assert_eq!(downsample(&input, 0, 16000), input);
    }
}
