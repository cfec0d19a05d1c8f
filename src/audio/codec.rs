//! Transport encoding of PCM16 frames.
//!
//! Frames travel as base64 text of little-endian 16-bit samples, tagged
//! with a format descriptor such as `audio/pcm;rate=16000`.

use crate::audio::pcm::{downmix_to_mono, pcm16_to_f32};
use crate::defaults::{PCM_ENCODING, SAMPLE_RATE};
use crate::error::{Result, VoxliveError};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use std::fmt;
use std::io::Cursor;
use std::str::FromStr;
use std::time::Duration;

/// Encoding and sample-rate descriptor carried next to an audio payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AudioFormat {
    pub encoding: String,
    pub sample_rate: u32,
}

impl AudioFormat {
    pub fn pcm16(sample_rate: u32) -> Self {
        Self {
            encoding: PCM_ENCODING.to_string(),
            sample_rate,
        }
    }

    pub fn is_pcm(&self) -> bool {
        self.encoding.eq_ignore_ascii_case(PCM_ENCODING)
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self::pcm16(SAMPLE_RATE)
    }
}

impl fmt::Display for AudioFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{};rate={}", self.encoding, self.sample_rate)
    }
}

impl FromStr for AudioFormat {
    type Err = VoxliveError;

    /// Parse `encoding[;key=value...]`. A missing `rate` means 16kHz.
    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.split(';');
        let encoding = parts.next().unwrap_or_default().trim();
        if encoding.is_empty() {
            return Err(VoxliveError::Protocol {
                message: format!("audio format '{}' has no encoding", s),
            });
        }

        let mut sample_rate = SAMPLE_RATE;
        for param in parts {
            let Some((key, value)) = param.split_once('=') else {
                continue;
            };
            if key.trim().eq_ignore_ascii_case("rate") {
                sample_rate = value
                    .trim()
                    .parse::<u32>()
                    .ok()
                    .filter(|rate| *rate > 0)
                    .ok_or_else(|| VoxliveError::Protocol {
                        message: format!("audio format '{}' has an invalid rate", s),
                    })?;
            }
        }

        Ok(Self {
            encoding: encoding.to_string(),
            sample_rate,
        })
    }
}

/// Decoded audio ready for a playback device.
#[derive(Debug, Clone, PartialEq)]
pub struct PcmSegment {
    /// Mono samples in [-1, 1].
    pub samples: Vec<f32>,
    pub sample_rate: u32,
}

impl PcmSegment {
    pub fn duration(&self) -> Duration {
        if self.sample_rate == 0 {
            return Duration::ZERO;
        }
        Duration::from_secs_f64(self.samples.len() as f64 / self.sample_rate as f64)
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }
}

/// Serializes PCM16 frames for the wire.
#[derive(Debug, Clone, Default)]
pub struct FrameEncoder {
    format: AudioFormat,
}

impl FrameEncoder {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    pub fn encode(&self, samples: &[i16]) -> String {
        let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
        STANDARD.encode(bytes)
    }
}

/// Reverses [`FrameEncoder`] for inbound payloads.
#[derive(Debug, Clone, Default)]
pub struct FrameDecoder {
    format: AudioFormat,
}

impl FrameDecoder {
    pub fn new(format: AudioFormat) -> Self {
        Self { format }
    }

    /// Decode a payload to raw PCM16 samples.
    pub fn decode_samples(&self, payload: &str) -> Result<Vec<i16>> {
        let bytes = decode_base64(payload)?;
        if bytes.is_empty() {
            return Err(VoxliveError::Decode {
                message: "empty audio payload".to_string(),
            });
        }
        if bytes.len() % 2 != 0 {
            return Err(VoxliveError::Decode {
                message: format!("PCM16 payload has odd length {}", bytes.len()),
            });
        }
        Ok(bytes
            .chunks_exact(2)
            .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
            .collect())
    }

    /// Decode a payload into a playable segment tagged with the format's rate.
    pub fn decode(&self, payload: &str) -> Result<PcmSegment> {
        if !self.format.is_pcm() {
            return Err(VoxliveError::Decode {
                message: format!("unsupported encoding '{}'", self.format.encoding),
            });
        }
        let samples = self.decode_samples(payload)?;
        Ok(PcmSegment {
            samples: samples.into_iter().map(pcm16_to_f32).collect(),
            sample_rate: self.format.sample_rate,
        })
    }
}

/// Decode a payload that carries a complete WAV container.
///
/// Used for payloads that carry a RIFF/WAVE header, and as a secondary path
/// when raw PCM decoding or playback fails.
pub fn decode_container(payload: &str) -> Result<PcmSegment> {
    let bytes = decode_base64(payload)?;
    let reader = hound::WavReader::new(Cursor::new(bytes)).map_err(|e| VoxliveError::Decode {
        message: format!("payload is not a WAV container: {}", e),
    })?;

    let spec = reader.spec();
    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => reader
            .into_samples::<f32>()
            .collect::<std::result::Result<Vec<_>, _>>(),
        hound::SampleFormat::Int => {
            let scale = (1i64 << (spec.bits_per_sample.clamp(1, 32) - 1)) as f32;
            reader
                .into_samples::<i32>()
                .map(|s| s.map(|v| v as f32 / scale))
                .collect::<std::result::Result<Vec<_>, _>>()
        }
    }
    .map_err(|e| VoxliveError::Decode {
        message: format!("failed to read WAV samples: {}", e),
    })?;

    if interleaved.is_empty() {
        return Err(VoxliveError::Decode {
            message: "WAV container holds no samples".to_string(),
        });
    }

    Ok(PcmSegment {
        samples: downmix_to_mono(&interleaved, spec.channels as usize),
        sample_rate: spec.sample_rate,
    })
}

/// Whether a payload starts with a RIFF/WAVE header.
///
/// Only the first 12 bytes (16 base64 characters) are decoded.
pub fn is_container(payload: &str) -> bool {
    let Some(head) = payload.trim_start().get(..16) else {
        return false;
    };
    match STANDARD.decode(head) {
        Ok(bytes) => bytes.len() == 12 && &bytes[..4] == b"RIFF" && &bytes[8..12] == b"WAVE",
        Err(_) => false,
    }
}

fn decode_base64(payload: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(payload.trim())
        .map_err(|e| VoxliveError::Decode {
            message: format!("invalid base64 payload: {}", e),
        })
}
