//! Fixed-size PCM16 framing of a continuous capture stream.

use crate::audio::pcm::{StreamResampler, downmix_to_mono, f32_to_pcm16};
use crate::defaults::SAMPLE_RATE;

/// One fixed-length unit of mono PCM16 audio at the wire sample rate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFrame {
    pub samples: Vec<i16>,
    /// Position of this frame in the stream, starting at 0.
    pub sequence: u64,
    /// Stream offset of the first sample, in wire-rate samples.
    pub offset: u64,
}

impl AudioFrame {
    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Converts captured float samples into frames of exactly `frame_len` samples.
///
/// Input may be interleaved multi-channel audio at any rate; it is downmixed
/// to mono, resampled to 16kHz and scaled to PCM16 before framing. Samples
/// that do not yet fill a frame are carried over to the next `push`.
#[derive(Debug)]
pub struct SampleFramer {
    frame_len: usize,
    channels: usize,
    resampler: StreamResampler,
    pending: Vec<i16>,
    next_sequence: u64,
    next_offset: u64,
}

impl SampleFramer {
    /// Create a framer. A `frame_len` of zero is treated as one.
    pub fn new(frame_len: usize, source_rate: u32, channels: u16) -> Self {
        let frame_len = frame_len.max(1);
        Self {
            frame_len,
            resampler: StreamResampler::new(source_rate, SAMPLE_RATE),
            channels: channels.max(1) as usize,
            pending: Vec::with_capacity(frame_len),
            next_sequence: 0,
            next_offset: 0,
        }
    }

    pub fn frame_len(&self) -> usize {
        self.frame_len
    }

    /// Samples waiting for the next frame to fill.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Feed a capture buffer and collect every frame it completes.
    pub fn push(&mut self, samples: &[f32]) -> Vec<AudioFrame> {
        if samples.is_empty() {
            return Vec::new();
        }

        let mono = downmix_to_mono(samples, self.channels);
        let resampled = self.resampler.process(&mono);
        self.pending
            .extend(resampled.into_iter().map(f32_to_pcm16));

        let ready = self.pending.len() / self.frame_len;
        if ready == 0 {
            return Vec::new();
        }

        let remainder = self.pending.split_off(ready * self.frame_len);
        let complete = std::mem::replace(&mut self.pending, remainder);

        complete
            .chunks_exact(self.frame_len)
            .map(|chunk| {
                let frame = AudioFrame {
                    samples: chunk.to_vec(),
                    sequence: self.next_sequence,
                    offset: self.next_offset,
                };
                self.next_sequence += 1;
                self.next_offset += self.frame_len as u64;
                frame
            })
            .collect()
    }

    /// Discard any partial frame and restart numbering.
    pub fn reset(&mut self) {
        self.pending.clear();
        self.resampler.reset();
        self.next_sequence = 0;
        self.next_offset = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn emits_nothing_until_a_frame_fills() {
        let mut framer = SampleFramer::new(4, SAMPLE_RATE, 1);
        assert!(framer.push(&[0.1, 0.2, 0.3]).is_empty());
        assert_eq!(framer.pending_len(), 3);

        let frames = framer.push(&[0.4]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 4);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn every_frame_has_the_configured_length() {
        let mut framer = SampleFramer::new(160, SAMPLE_RATE, 1);
        let mut frames = Vec::new();
        for size in [7usize, 300, 1, 1000, 55, 161] {
            frames.extend(framer.push(&vec![0.25; size]));
        }

        let total: usize = [7usize, 300, 1, 1000, 55, 161].iter().sum();
        assert_eq!(frames.len(), total / 160);
        assert!(frames.iter().all(|f| f.len() == 160));
        assert_eq!(framer.pending_len(), total % 160);
    }

    #[test]
    fn frames_are_time_ordered() {
        let mut framer = SampleFramer::new(100, SAMPLE_RATE, 1);
        let ramp: Vec<f32> = (0..1000).map(|i| i as f32 / 1000.0).collect();

        let mut frames = Vec::new();
        for chunk in ramp.chunks(37) {
            frames.extend(framer.push(chunk));
        }

        assert_eq!(frames.len(), 10);
        for (i, frame) in frames.iter().enumerate() {
            assert_eq!(frame.sequence, i as u64);
            assert_eq!(frame.offset, i as u64 * 100);
        }

        let flat: Vec<i16> = frames.iter().flat_map(|f| f.samples.clone()).collect();
        assert!(flat.windows(2).all(|w| w[0] <= w[1]));
    }

    #[test]
    fn samples_use_asymmetric_scaling() {
        let mut framer = SampleFramer::new(4, SAMPLE_RATE, 1);
        let frames = framer.push(&[-1.0, 1.0, -2.0, 2.0]);
        assert_eq!(frames[0].samples, vec![-32768, 32767, -32768, 32767]);
    }

    #[test]
    fn stereo_input_is_downmixed() {
        let mut framer = SampleFramer::new(2, SAMPLE_RATE, 2);
        let frames = framer.push(&[0.5, 0.5, -0.5, -0.5]);
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].samples, vec![16383, -16384]);
    }

    #[test]
    fn higher_rate_input_is_resampled() {
        let mut framer = SampleFramer::new(1600, 48000, 1);
        let frames = framer.push(&vec![0.0; 4800]);
        assert_eq!(frames.len(), 1);
        assert_eq!(framer.pending_len(), 0);
    }

    #[test]
    fn resampled_stream_keeps_real_time_length() {
        let mut framer = SampleFramer::new(1000, 44100, 1);
        let mut frames = Vec::new();
        for chunk in vec![0.2f32; 44100].chunks(128) {
            frames.extend(framer.push(chunk));
        }

        let produced = frames.len() * 1000 + framer.pending_len();
        assert!(produced.abs_diff(16000) <= 1, "{} samples", produced);
        assert_eq!(frames.len(), 15);
        assert_eq!(frames[14].offset, 14_000);
    }

    #[test]
    fn reset_discards_partial_frame_and_numbering() {
        let mut framer = SampleFramer::new(4, SAMPLE_RATE, 1);
        framer.push(&[0.0; 6]);
        assert_eq!(framer.pending_len(), 2);

        framer.reset();
        assert_eq!(framer.pending_len(), 0);

        let frames = framer.push(&[0.0; 4]);
        assert_eq!(frames[0].sequence, 0);
        assert_eq!(frames[0].offset, 0);
    }

    #[test]
    fn zero_frame_len_is_clamped() {
        let mut framer = SampleFramer::new(0, SAMPLE_RATE, 0);
        assert_eq!(framer.frame_len(), 1);
        assert_eq!(framer.push(&[0.1, 0.2]).len(), 2);
    }
}
