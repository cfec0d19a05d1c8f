//! Speaker playback using CPAL.

use crate::audio::capture::{
    build_error, config_error, is_preferred_device, play_error, with_suppressed_stderr,
};
use crate::audio::codec::PcmSegment;
use crate::audio::device::PlaybackDevice;
use crate::audio::pcm::{f32_to_pcm16, resample_linear};
use crate::error::{DeviceErrorKind, Result, VoxliveError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crate::defaults;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How long the callback may go without pulling a sample while audio is
/// queued before the output is considered stalled.
const STALL_TIMEOUT: Duration = Duration::from_secs(1);

const HANDOFF_POLL: Duration = Duration::from_millis(2);

type SampleQueue = Arc<Mutex<VecDeque<f32>>>;

struct SendableStream(cpal::Stream);

// SAFETY: owned by a single playback device, which lives on the playback worker thread.
unsafe impl Send for SendableStream {}

fn find_output_device(device_name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();

        if let Some(name) = device_name {
            let mut devices = host.output_devices().map_err(|e| {
                VoxliveError::device(
                    DeviceErrorKind::Busy,
                    format!("failed to enumerate output devices: {}", e),
                )
            })?;
            return devices
                .find(|dev| dev.name().is_ok_and(|dev_name| dev_name == name))
                .ok_or_else(|| {
                    VoxliveError::device(
                        DeviceErrorKind::NotFound,
                        format!("no output device named '{}'", name),
                    )
                });
        }

        if let Ok(mut devices) = host.output_devices()
            && let Some(device) =
                devices.find(|dev| dev.name().is_ok_and(|name| is_preferred_device(&name)))
        {
            return Ok(device);
        }

        host.default_output_device().ok_or_else(|| {
            VoxliveError::device(DeviceErrorKind::NotFound, "no default output device")
        })
    })
}

fn build_output<T, F>(
    device: &cpal::Device,
    config: &cpal::StreamConfig,
    queue: SampleQueue,
    consumed: Arc<AtomicU64>,
    convert: F,
) -> std::result::Result<cpal::Stream, cpal::BuildStreamError>
where
    T: cpal::SizedSample + Send + 'static,
    F: Fn(f32) -> T + Send + 'static,
{
    let channels = config.channels.max(1) as usize;
    device.build_output_stream(
        config,
        move |data: &mut [T], _: &cpal::OutputCallbackInfo| {
            let mut queue = queue.lock().unwrap_or_else(PoisonError::into_inner);
            let mut pulled = 0u64;
            for frame in data.chunks_mut(channels) {
                let sample = match queue.pop_front() {
                    Some(sample) => {
                        pulled += 1;
                        sample
                    }
                    None => 0.0,
                };
                for out in frame.iter_mut() {
                    *out = convert(sample);
                }
            }
            consumed.fetch_add(pulled, Ordering::SeqCst);
        },
        |err: cpal::StreamError| warn!(error = %err, "audio output stream error"),
        None,
    )
}

/// Speaker output backed by one long-lived CPAL output stream.
///
/// Segments are resampled to the device rate and appended to a sample
/// queue that the stream callback drains; silence is written only when the
/// queue is empty. `play` returns while the low watermark is still queued,
/// so the next segment lands before the output runs dry.
pub struct CpalPlaybackDevice {
    _stream: SendableStream,
    queue: SampleQueue,
    /// Samples pulled by the callback since the stream opened.
    consumed: Arc<AtomicU64>,
    /// Samples appended since the stream opened.
    submitted: u64,
    low_watermark: u64,
    /// Last observed `consumed` value and when it was seen to move.
    progress: (u64, Instant),
    sample_rate: u32,
}

impl CpalPlaybackDevice {
    pub fn open(device_name: Option<&str>) -> Result<Self> {
        let device = find_output_device(device_name)?;
        let supported = device.default_output_config().map_err(config_error)?;
        let sample_rate = supported.sample_rate().0;
        let config: cpal::StreamConfig = supported.config();
        let queue: SampleQueue = Arc::new(Mutex::new(VecDeque::new()));
        let consumed = Arc::new(AtomicU64::new(0));
        let (q, c) = (Arc::clone(&queue), Arc::clone(&consumed));

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => build_output(&device, &config, q, c, |s| s),
            cpal::SampleFormat::I16 => build_output(&device, &config, q, c, f32_to_pcm16),
            cpal::SampleFormat::U16 => build_output(&device, &config, q, c, |s| {
                (f32_to_pcm16(s) as i32 + 32768) as u16
            }),
            other => {
                return Err(VoxliveError::device(
                    DeviceErrorKind::Busy,
                    format!("unsupported output sample format {:?}", other),
                ));
            }
        }
        .map_err(build_error)?;
        stream.play().map_err(play_error)?;

        debug!(
            sample_rate,
            channels = config.channels,
            "opened audio output stream"
        );

        Ok(Self {
            _stream: SendableStream(stream),
            queue,
            consumed,
            submitted: 0,
            low_watermark: sample_rate as u64 * defaults::PLAYBACK_LOW_WATERMARK_MS / 1000,
            progress: (0, Instant::now()),
            sample_rate,
        })
    }

    fn queued(&self) -> u64 {
        self.submitted
            .saturating_sub(self.consumed.load(Ordering::SeqCst))
    }

    /// Fail if samples are queued but the callback has stopped pulling them.
    fn check_progress(&mut self) -> Result<()> {
        let consumed = self.consumed.load(Ordering::SeqCst);
        let now = Instant::now();
        if consumed != self.progress.0 || self.queued() == 0 {
            self.progress = (consumed, now);
            return Ok(());
        }
        if now.duration_since(self.progress.1) < STALL_TIMEOUT {
            return Ok(());
        }

        let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
        queue.clear();
        self.submitted = self.consumed.load(Ordering::SeqCst);
        self.progress = (self.submitted, now);
        Err(VoxliveError::device(
            DeviceErrorKind::Busy,
            "output device stopped consuming audio",
        ))
    }
}

impl PlaybackDevice for CpalPlaybackDevice {
    fn play(&mut self, segment: &PcmSegment) -> Result<()> {
        let samples = resample_linear(&segment.samples, segment.sample_rate, self.sample_rate);
        self.check_progress()?;

        {
            let mut queue = self.queue.lock().unwrap_or_else(PoisonError::into_inner);
            self.submitted += samples.len() as u64;
            queue.extend(samples);
        }

        while self.queued() > self.low_watermark {
            self.check_progress()?;
            std::thread::sleep(HANDOFF_POLL);
        }
        Ok(())
    }

    fn pending(&mut self) -> Result<Duration> {
        self.check_progress()?;
        Ok(Duration::from_secs_f64(
            self.queued() as f64 / self.sample_rate.max(1) as f64,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    #[ignore] // Requires audio hardware
    fn test_open_default_output_and_play_silence() {
        let mut device = CpalPlaybackDevice::open(None).expect("Failed to open output device");
        let segment = PcmSegment {
            samples: vec![0.0; 1600],
            sample_rate: 16000,
        };
        device.play(&segment).expect("Failed to play segment");
        device.play(&segment).expect("Failed to play segment");
        assert!(device.pending().unwrap() > Duration::ZERO);

        std::thread::sleep(Duration::from_millis(300));
        assert_eq!(device.pending().unwrap(), Duration::ZERO);
    }

    #[test]
    fn test_open_unknown_output_device_fails() {
        assert!(matches!(
            CpalPlaybackDevice::open(Some("NonExistentOutput12345")),
            Err(VoxliveError::Device { .. })
        ));
    }
}
