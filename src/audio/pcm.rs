//! Sample conversion shared by capture and playback.

/// Convert a float sample in [-1, 1] to PCM16.
///
/// Out-of-range input is clamped first. Negative values scale by 32768 and
/// non-negative values by 32767, so both ends of the i16 range are reachable
/// without overflow.
pub fn f32_to_pcm16(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Convert a PCM16 sample to float by dividing by 32768.
pub fn pcm16_to_f32(sample: i16) -> f32 {
    sample as f32 / 32768.0
}

/// Average interleaved channels down to mono.
///
/// A trailing partial frame is dropped.
pub fn downmix_to_mono(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks_exact(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect()
}

/// Simple linear interpolation resampling.
pub fn resample_linear(samples: &[f32], from_rate: u32, to_rate: u32) -> Vec<f32> {
    if from_rate == to_rate || from_rate == 0 || to_rate == 0 || samples.is_empty() {
        return samples.to_vec();
    }

    let ratio = from_rate as f64 / to_rate as f64;
    let output_len = (samples.len() as f64 / ratio).ceil() as usize;

    (0..output_len)
        .map(|i| {
            let source_pos = i as f64 * ratio;
            let source_idx = (source_pos.floor() as usize).min(samples.len() - 1);
            let fraction = (source_pos - source_idx as f64) as f32;

            match samples.get(source_idx + 1) {
                Some(&right) => {
                    let left = samples[source_idx];
                    left + (right - left) * fraction
                }
                None => samples[source_idx],
            }
        })
        .collect()
}

/// Linear resampler for a continuous stream delivered in buffers.
///
/// The source phase and the last input sample carry over between calls, so
/// output length tracks real time and buffer edges are interpolated like
/// any other pair of samples.
#[derive(Debug, Clone)]
pub struct StreamResampler {
    /// Source samples per output sample.
    step: f64,
    /// Source position of the next output sample. Index -1 is `last`.
    position: f64,
    last: Option<f32>,
}

impl StreamResampler {
    pub fn new(from_rate: u32, to_rate: u32) -> Self {
        let step = if from_rate == 0 || to_rate == 0 {
            1.0
        } else {
            from_rate as f64 / to_rate as f64
        };
        Self {
            step,
            position: 0.0,
            last: None,
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.step == 1.0
    }

    /// Resample one buffer. Output that needs the next buffer's first
    /// sample is held back until that buffer arrives.
    pub fn process(&mut self, samples: &[f32]) -> Vec<f32> {
        if self.is_passthrough() || samples.is_empty() {
            return samples.to_vec();
        }

        let len = samples.len() as isize;
        let mut out = Vec::with_capacity((samples.len() as f64 / self.step) as usize + 1);
        loop {
            let floor = self.position.floor();
            let index = floor as isize;
            if index + 1 >= len {
                break;
            }
            let right = samples[(index + 1) as usize];
            let left = if index < 0 {
                self.last.unwrap_or(right)
            } else {
                samples[index as usize]
            };
            let fraction = (self.position - floor) as f32;
            out.push(left + (right - left) * fraction);
            self.position += self.step;
        }

        self.last = samples.last().copied();
        self.position -= samples.len() as f64;
        out
    }

    /// Forget the carried phase and sample.
    pub fn reset(&mut self) {
        self.position = 0.0;
        self.last = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_scale_maps_to_asymmetric_extremes() {
        assert_eq!(f32_to_pcm16(1.0), 32767);
        assert_eq!(f32_to_pcm16(-1.0), -32768);
        assert_eq!(f32_to_pcm16(0.0), 0);
    }

    #[test]
    fn out_of_range_input_is_clamped() {
        assert_eq!(f32_to_pcm16(1.7), 32767);
        assert_eq!(f32_to_pcm16(-3.0), -32768);
        assert_eq!(f32_to_pcm16(f32::INFINITY), 32767);
        assert_eq!(f32_to_pcm16(f32::NEG_INFINITY), -32768);
    }

    #[test]
    fn half_scale_uses_side_specific_multiplier() {
        // 0.5 * 32767 = 16383.5 → truncates to 16383
        assert_eq!(f32_to_pcm16(0.5), 16383);
        // -0.5 * 32768 = -16384 exactly
        assert_eq!(f32_to_pcm16(-0.5), -16384);
    }

    #[test]
    fn pcm16_to_f32_divides_by_32768() {
        assert_eq!(pcm16_to_f32(-32768), -1.0);
        assert_eq!(pcm16_to_f32(16384), 0.5);
        assert_eq!(pcm16_to_f32(0), 0.0);
        assert!(pcm16_to_f32(32767) < 1.0);
    }

    #[test]
    fn pcm16_round_trip_is_within_one_step() {
        for &s in &[-32768i16, -12345, -1, 0, 1, 777, 32767] {
            let back = f32_to_pcm16(pcm16_to_f32(s));
            assert!((back as i32 - s as i32).abs() <= 1, "{} -> {}", s, back);
        }
    }

    #[test]
    fn downmix_averages_channels() {
        let stereo = [0.5, -0.5, 1.0, 0.0, -1.0, -1.0];
        assert_eq!(downmix_to_mono(&stereo, 2), vec![0.0, 0.5, -1.0]);
    }

    #[test]
    fn downmix_mono_is_identity_and_drops_partial_frames() {
        assert_eq!(downmix_to_mono(&[0.1, 0.2], 1), vec![0.1, 0.2]);
        assert_eq!(downmix_to_mono(&[0.2, 0.4, 0.9], 2), vec![0.3]);
    }

    #[test]
    fn resample_identity_same_rate() {
        let samples = vec![0.1f32, 0.2, 0.3];
        assert_eq!(resample_linear(&samples, 16000, 16000), samples);
    }

    #[test]
    fn resample_downsample_halves_length() {
        let samples = vec![0.0f32; 4800];
        assert_eq!(resample_linear(&samples, 48000, 16000).len(), 1600);
    }

    #[test]
    fn resample_upsample_interpolates() {
        let resampled = resample_linear(&[0.0, 0.5, 1.0], 8000, 16000);
        assert_eq!(resampled.len(), 6);
        assert_eq!(resampled[0], 0.0);
        assert!((resampled[1] - 0.25).abs() < 1e-6);
        assert_eq!(resampled[2], 0.5);
        assert_eq!(resampled[5], 1.0);
    }

    #[test]
    fn resample_handles_edge_cases() {
        assert!(resample_linear(&[], 48000, 16000).is_empty());
        assert_eq!(resample_linear(&[0.25], 48000, 16000), vec![0.25]);
    }

    #[test]
    fn stream_resampler_tracks_real_time_across_buffers() {
        let mut resampler = StreamResampler::new(44100, 16000);
        let second = vec![0.1f32; 44100];
        let produced: usize = second.chunks(128).map(|c| resampler.process(c).len()).sum();
        assert!(produced.abs_diff(16000) <= 1, "{} samples", produced);
    }

    #[test]
    fn stream_resampler_interpolates_across_buffer_edges() {
        let ramp: Vec<f32> = (0..480).map(|i| i as f32 / 480.0).collect();

        let mut whole = StreamResampler::new(48000, 32000);
        let expected = whole.process(&ramp);

        let mut split = StreamResampler::new(48000, 32000);
        let mut chunked = Vec::new();
        for chunk in ramp.chunks(7) {
            chunked.extend(split.process(chunk));
        }

        assert_eq!(chunked.len(), expected.len());
        for (a, b) in chunked.iter().zip(&expected) {
            assert!((a - b).abs() < 1e-5, "{} vs {}", a, b);
        }
    }

    #[test]
    fn stream_resampler_reset_restarts_phase() {
        let ramp = [0.0, 0.1, 0.2, 0.3, 0.4, 0.5, 0.6];
        let mut resampler = StreamResampler::new(48000, 16000);
        resampler.process(&[0.5; 5]);
        resampler.reset();
        assert_eq!(resampler.process(&ramp), vec![0.0, 0.3]);
    }

    #[test]
    fn stream_resampler_same_rate_passes_through() {
        let mut resampler = StreamResampler::new(16000, 16000);
        assert!(resampler.is_passthrough());
        assert_eq!(resampler.process(&[0.1, 0.2]), vec![0.1, 0.2]);
    }
}
