use crate::audio::codec::PcmSegment;
use crate::defaults;
use crate::error::{DeviceErrorKind, Result, VoxliveError};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Trait for microphone capture devices.
///
/// This trait allows swapping implementations (real audio device vs mock).
/// A device is opened unacquired; `acquire` starts the underlying stream.
pub trait CaptureDevice: Send {
    /// Acquire the physical device and start buffering samples.
    fn acquire(&mut self) -> Result<()>;

    /// Stop the stream and give the device back.
    fn release(&mut self) -> Result<()>;

    /// Drain samples captured since the last call.
    ///
    /// Samples are interleaved floats in [-1, 1]; an empty vector means
    /// nothing new has arrived yet.
    fn read_samples(&mut self) -> Result<Vec<f32>>;

    /// Rate of the samples returned by `read_samples`.
    fn sample_rate(&self) -> u32;

    /// Interleaved channel count of the samples returned by `read_samples`.
    fn channels(&self) -> u16;
}

/// Trait for speaker playback devices.
///
/// Segments queue up behind whatever is still sounding, so consecutive
/// `play` calls join without silence as long as each one arrives before
/// the audio already queued runs out.
pub trait PlaybackDevice: Send {
    /// Queue a segment after any audio still pending.
    ///
    /// Returns once little enough is left that the caller should hand over
    /// the next segment, not when this segment has finished sounding.
    fn play(&mut self, segment: &PcmSegment) -> Result<()>;

    /// Audio queued but not yet pulled by the output.
    fn pending(&mut self) -> Result<Duration>;
}

/// Opens capture and playback devices on demand.
pub trait DeviceProvider: Send + Sync {
    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>>;
    fn open_playback(&self) -> Result<Box<dyn PlaybackDevice>>;
}

/// Shared counters recorded by mock devices.
#[derive(Debug, Default)]
pub struct MockDeviceStats {
    acquired: AtomicUsize,
    released: AtomicUsize,
    playing: AtomicBool,
    overlaps: AtomicUsize,
    underruns: AtomicUsize,
    played: Mutex<Vec<PcmSegment>>,
}

impl MockDeviceStats {
    pub fn acquire_count(&self) -> usize {
        self.acquired.load(Ordering::SeqCst)
    }

    pub fn release_count(&self) -> usize {
        self.released.load(Ordering::SeqCst)
    }

    /// Number of times `play` was entered while another call was inside it.
    pub fn overlap_count(&self) -> usize {
        self.overlaps.load(Ordering::SeqCst)
    }

    /// Number of segments queued after the previous audio had already run
    /// out, without anyone having observed the device drain in between.
    pub fn underrun_count(&self) -> usize {
        self.underruns.load(Ordering::SeqCst)
    }

    pub fn played(&self) -> Vec<PcmSegment> {
        self.played
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn played_count(&self) -> usize {
        self.played
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// Mock device provider for testing.
///
/// Capture buffers are fed through [`MockDeviceProvider::feed`] and drained
/// by whichever capture device is currently acquired.
#[derive(Debug, Clone)]
pub struct MockDeviceProvider {
    feed_tx: Sender<Vec<f32>>,
    feed_rx: Receiver<Vec<f32>>,
    capture_failure: Option<DeviceErrorKind>,
    read_failure: bool,
    open_playback_failure: bool,
    play_failure: bool,
    play_duration: Duration,
    sample_rate: u32,
    channels: u16,
    stats: Arc<MockDeviceStats>,
}

impl MockDeviceProvider {
    /// Create a provider whose devices capture 16kHz mono and play instantly
    pub fn new() -> Self {
        let (feed_tx, feed_rx) = unbounded();
        Self {
            feed_tx,
            feed_rx,
            capture_failure: None,
            read_failure: false,
            open_playback_failure: false,
            play_failure: false,
            play_duration: Duration::ZERO,
            sample_rate: defaults::SAMPLE_RATE,
            channels: 1,
            stats: Arc::new(MockDeviceStats::default()),
        }
    }

    /// Configure capture devices to fail on acquire with the given kind
    pub fn with_capture_failure(mut self, kind: DeviceErrorKind) -> Self {
        self.capture_failure = Some(kind);
        self
    }

    /// Configure capture devices to fail every read
    pub fn with_read_failure(mut self) -> Self {
        self.read_failure = true;
        self
    }

    /// Configure the capture format reported by devices
    pub fn with_capture_format(mut self, sample_rate: u32, channels: u16) -> Self {
        self.sample_rate = sample_rate;
        self.channels = channels;
        self
    }

    /// Configure how long each segment sounds for
    pub fn with_play_duration(mut self, duration: Duration) -> Self {
        self.play_duration = duration;
        self
    }

    /// Configure playback devices to fail to open
    pub fn with_open_playback_failure(mut self) -> Self {
        self.open_playback_failure = true;
        self
    }

    /// Configure playback devices to reject every segment
    pub fn with_play_failure(mut self) -> Self {
        self.play_failure = true;
        self
    }

    /// Queue one capture buffer for the acquired device.
    pub fn feed(&self, buffer: Vec<f32>) {
        self.feed_tx.send(buffer).ok();
    }

    /// Number of fed buffers not yet read by a device.
    pub fn unread_buffers(&self) -> usize {
        self.feed_rx.len()
    }

    pub fn stats(&self) -> Arc<MockDeviceStats> {
        Arc::clone(&self.stats)
    }
}

impl Default for MockDeviceProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DeviceProvider for MockDeviceProvider {
    fn open_capture(&self) -> Result<Box<dyn CaptureDevice>> {
        Ok(Box::new(MockCaptureDevice {
            feed: self.feed_rx.clone(),
            acquired: false,
            failure: self.capture_failure,
            read_failure: self.read_failure,
            sample_rate: self.sample_rate,
            channels: self.channels,
            stats: Arc::clone(&self.stats),
        }))
    }

    fn open_playback(&self) -> Result<Box<dyn PlaybackDevice>> {
        if self.open_playback_failure {
            return Err(VoxliveError::device(
                DeviceErrorKind::NotFound,
                "mock output device unavailable",
            ));
        }
        Ok(Box::new(MockPlaybackDevice {
            duration: self.play_duration,
            failure: self.play_failure,
            busy_until: None,
            stats: Arc::clone(&self.stats),
        }))
    }
}

/// Mock capture device for testing
#[derive(Debug)]
pub struct MockCaptureDevice {
    feed: Receiver<Vec<f32>>,
    acquired: bool,
    failure: Option<DeviceErrorKind>,
    read_failure: bool,
    sample_rate: u32,
    channels: u16,
    stats: Arc<MockDeviceStats>,
}

impl CaptureDevice for MockCaptureDevice {
    fn acquire(&mut self) -> Result<()> {
        if let Some(kind) = self.failure {
            return Err(VoxliveError::device(kind, "mock microphone"));
        }
        self.acquired = true;
        self.stats.acquired.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        if self.acquired {
            self.acquired = false;
            self.stats.released.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<f32>> {
        if !self.acquired {
            return Err(VoxliveError::device(
                DeviceErrorKind::Busy,
                "mock microphone read before acquire",
            ));
        }
        if self.read_failure {
            return Err(VoxliveError::device(
                DeviceErrorKind::Busy,
                "mock microphone stream error",
            ));
        }
        Ok(self.feed.try_iter().flatten().collect())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}

/// Mock playback device for testing
///
/// Models a real-time output: every segment sounds for the configured
/// duration, starting when the previous one ends. `play` hands back
/// control once half of the new segment remains.
#[derive(Debug)]
pub struct MockPlaybackDevice {
    duration: Duration,
    failure: bool,
    busy_until: Option<Instant>,
    stats: Arc<MockDeviceStats>,
}

impl PlaybackDevice for MockPlaybackDevice {
    fn play(&mut self, segment: &PcmSegment) -> Result<()> {
        if self.failure {
            return Err(VoxliveError::device(
                DeviceErrorKind::Busy,
                "mock output device rejected the buffer",
            ));
        }
        if self.stats.playing.swap(true, Ordering::SeqCst) {
            self.stats.overlaps.fetch_add(1, Ordering::SeqCst);
        }

        let now = Instant::now();
        if self.busy_until.is_some_and(|end| now > end) {
            self.stats.underruns.fetch_add(1, Ordering::SeqCst);
        }
        let start = self.busy_until.map_or(now, |end| end.max(now));
        let end = start + self.duration;
        self.busy_until = Some(end);
        self.stats
            .played
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(segment.clone());

        let handoff = end - self.duration / 2;
        if let Some(wait) = handoff.checked_duration_since(Instant::now()) {
            std::thread::sleep(wait);
        }
        self.stats.playing.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn pending(&mut self) -> Result<Duration> {
        let now = Instant::now();
        match self.busy_until {
            Some(end) if end > now => Ok(end - now),
            _ => {
                self.busy_until = None;
                Ok(Duration::ZERO)
            }
        }
    }
}
