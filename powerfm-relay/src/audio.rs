//! PCM level analysis for s16le mono chunks

/// Normalised levels of one chunk, both in 0.0..=1.0
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PcmLevels {
    pub peak: f32,
    pub rms: f32,
    pub samples: usize,
}

/// Peak and RMS of a little-endian 16-bit chunk.
///
/// Returns `None` when the chunk holds no complete sample. A trailing odd
/// byte is ignored.
pub fn pcm_levels(chunk: &[u8]) -> Option<PcmLevels> {
    let samples = chunk.len() / 2;
    if samples == 0 {
        return None;
    }

    let mut peak: i32 = 0;
    let mut sum_squares: f64 = 0.0;
    for pair in chunk.chunks_exact(2) {
        let sample = i16::from_le_bytes([pair[0], pair[1]]) as i32;
        peak = peak.max(sample.abs());
        sum_squares += (sample as f64) * (sample as f64);
    }

    let rms = (sum_squares / samples as f64).sqrt() / 32768.0;
    Some(PcmLevels {
        peak: (peak as f32 / 32768.0).min(1.0),
        rms: rms.min(1.0) as f32,
        samples,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode(samples: &[i16]) -> Vec<u8> {
        samples.iter().flat_map(|s| s.to_le_bytes()).collect()
    }

    #[test]
    fn test_silence() {
        let levels = pcm_levels(&encode(&[0; 64])).unwrap();
        assert_eq!(levels.peak, 0.0);
        assert_eq!(levels.rms, 0.0);
        assert_eq!(levels.samples, 64);
    }

    #[test]
    fn test_full_scale_negative() {
        let levels = pcm_levels(&encode(&[i16::MIN, 0, 0, 0])).unwrap();
        assert_eq!(levels.peak, 1.0);
    }

    #[test]
    fn test_square_wave_rms_equals_peak() {
        let levels = pcm_levels(&encode(&[16384, -16384, 16384, -16384])).unwrap();
        assert!((levels.peak - 0.5).abs() < 1e-6);
        assert!((levels.rms - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_incomplete_chunk() {
        assert!(pcm_levels(&[]).is_none());
        assert!(pcm_levels(&[0x7f]).is_none());
    }
}
