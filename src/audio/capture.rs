//! Real microphone capture using CPAL (Cross-Platform Audio Library).

use crate::audio::device::CaptureDevice;
use crate::defaults;
use crate::error::{DeviceErrorKind, Result, VoxliveError};
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info, warn};

/// Run a closure with stderr temporarily redirected to /dev/null.
///
/// CPAL tries several backends while enumerating devices and ALSA/JACK
/// print harmless but confusing errors while it does.
///
/// # Safety
/// Uses `libc::dup`/`libc::dup2` to save and restore file descriptor 2.
/// Safe as long as no other thread is concurrently manipulating fd 2.
pub(crate) fn with_suppressed_stderr<F, R>(f: F) -> R
where
    F: FnOnce() -> R,
{
    unsafe {
        let saved_fd = libc::dup(2);
        let devnull = libc::open(c"/dev/null".as_ptr(), libc::O_WRONLY);
        if saved_fd >= 0 && devnull >= 0 {
            libc::dup2(devnull, 2);
            libc::close(devnull);
        }

        let result = f();

        if saved_fd >= 0 {
            libc::dup2(saved_fd, 2);
            libc::close(saved_fd);
        }

        result
    }
}

/// Quiet JACK/PipeWire/ALSA diagnostics before any audio backend is opened.
///
/// # Safety
/// Modifies environment variables; call at startup before spawning threads.
pub fn suppress_audio_warnings() {
    // SAFETY: Called at startup before any threads are spawned
    unsafe {
        std::env::set_var("JACK_NO_START_SERVER", "1");
        std::env::set_var("JACK_NO_AUDIO_RESERVATION", "1");
        std::env::set_var("PIPEWIRE_DEBUG", "0");
        std::env::set_var("ALSA_DEBUG", "0");
        std::env::set_var("PW_LOG", "0");
    }
}

/// Device names preferred on PipeWire/PulseAudio desktops.
const PREFERRED_DEVICES: &[&str] = &["pipewire", "pulse", "PulseAudio"];

/// Device name patterns that are never useful for a voice session.
const FILTERED_PATTERNS: &[&str] = &[
    "surround",
    "front:",
    "rear:",
    "center:",
    "side:",
    "S/PDIF",
];

pub(crate) fn should_filter_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    FILTERED_PATTERNS
        .iter()
        .any(|pattern| lower.contains(&pattern.to_lowercase()))
}

pub(crate) fn is_preferred_device(name: &str) -> bool {
    let lower = name.to_lowercase();
    PREFERRED_DEVICES
        .iter()
        .any(|pref| lower.contains(&pref.to_lowercase()))
}

/// Map a backend error description onto a device error kind.
///
/// Backends report permission and contention problems as free text, so this
/// is a best-effort match. Anything unrecognised counts as busy.
pub(crate) fn classify_backend_message(message: &str) -> DeviceErrorKind {
    let lower = message.to_lowercase();
    if ["permission", "denied", "not authorized", "not permitted", "eacces"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        DeviceErrorKind::PermissionDenied
    } else if ["no such device", "not found", "no device", "unavailable", "enoent"]
        .iter()
        .any(|needle| lower.contains(needle))
    {
        DeviceErrorKind::NotFound
    } else {
        DeviceErrorKind::Busy
    }
}

pub(crate) fn build_error(error: cpal::BuildStreamError) -> VoxliveError {
    let kind = match &error {
        cpal::BuildStreamError::DeviceNotAvailable => DeviceErrorKind::NotFound,
        cpal::BuildStreamError::BackendSpecific { err } => {
            classify_backend_message(&err.description)
        }
        _ => DeviceErrorKind::Busy,
    };
    VoxliveError::device(kind, format!("failed to open audio stream: {}", error))
}

pub(crate) fn config_error(error: cpal::DefaultStreamConfigError) -> VoxliveError {
    let kind = match &error {
        cpal::DefaultStreamConfigError::DeviceNotAvailable => DeviceErrorKind::NotFound,
        cpal::DefaultStreamConfigError::BackendSpecific { err } => {
            classify_backend_message(&err.description)
        }
        _ => DeviceErrorKind::Busy,
    };
    VoxliveError::device(kind, format!("failed to query device config: {}", error))
}

pub(crate) fn play_error(error: cpal::PlayStreamError) -> VoxliveError {
    let kind = match &error {
        cpal::PlayStreamError::DeviceNotAvailable => DeviceErrorKind::NotFound,
        cpal::PlayStreamError::BackendSpecific { err } => {
            classify_backend_message(&err.description)
        }
        #[allow(unreachable_patterns)]
        _ => DeviceErrorKind::Busy,
    };
    VoxliveError::device(kind, format!("failed to start audio stream: {}", error))
}

fn list_names<I>(devices: I) -> Vec<String>
where
    I: Iterator<Item = cpal::Device>,
{
    devices
        .filter_map(|device| device.name().ok())
        .filter(|name| !should_filter_device(name))
        .map(|name| {
            if is_preferred_device(&name) {
                format!("{} [recommended]", name)
            } else {
                name
            }
        })
        .collect()
}

/// List audio input devices, marking preferred ones with "\[recommended\]".
pub fn list_input_devices() -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| cpal::default_host().input_devices())
        .map_err(|e| VoxliveError::Other(format!("Failed to enumerate input devices: {}", e)))?;
    Ok(list_names(devices))
}

/// List audio output devices, marking preferred ones with "\[recommended\]".
pub fn list_output_devices() -> Result<Vec<String>> {
    let devices = with_suppressed_stderr(|| cpal::default_host().output_devices())
        .map_err(|e| VoxliveError::Other(format!("Failed to enumerate output devices: {}", e)))?;
    Ok(list_names(devices))
}

/// Find an input device by exact name, or the best default.
fn find_input_device(device_name: Option<&str>) -> Result<cpal::Device> {
    with_suppressed_stderr(|| {
        let host = cpal::default_host();
        let mut devices = host.input_devices().map_err(|e| {
            VoxliveError::device(
                classify_backend_message(&e.to_string()),
                format!("failed to enumerate input devices: {}", e),
            )
        })?;

        if let Some(name) = device_name {
            return devices
                .find(|dev| dev.name().is_ok_and(|dev_name| dev_name == name))
                .ok_or_else(|| {
                    VoxliveError::device(
                        DeviceErrorKind::NotFound,
                        format!("no input device named '{}'", name),
                    )
                });
        }

        if let Some(device) =
            devices.find(|dev| dev.name().is_ok_and(|name| is_preferred_device(&name)))
        {
            return Ok(device);
        }

        host.default_input_device().ok_or_else(|| {
            VoxliveError::device(DeviceErrorKind::NotFound, "no default input device")
        })
    })
}

/// Wrapper for cpal::Stream to make it Send.
///
/// SAFETY: the stream is owned by exactly one capture device, which is
/// itself owned by a single capture worker thread.
struct SendableStream(cpal::Stream);

unsafe impl Send for SendableStream {}

/// Microphone capture backed by a CPAL input stream.
///
/// The stream callback forwards every buffer over a channel; `read_samples`
/// drains it. The preferred stream is f32/16kHz/mono; if the device refuses
/// it or never delivers data, the device's native config is used and the
/// framer downmixes and resamples in software.
pub struct CpalCaptureDevice {
    device_name: Option<String>,
    stream: Option<SendableStream>,
    buffers: Option<Receiver<Vec<f32>>>,
    sample_rate: u32,
    channels: u16,
}

impl CpalCaptureDevice {
    pub fn new(device_name: Option<String>) -> Self {
        Self {
            device_name,
            stream: None,
            buffers: None,
            sample_rate: defaults::SAMPLE_RATE,
            channels: 1,
        }
    }

    fn build_preferred(
        device: &cpal::Device,
        tx: Sender<Vec<f32>>,
        callbacks: Arc<AtomicU64>,
    ) -> std::result::Result<cpal::Stream, cpal::BuildStreamError> {
        let config = cpal::StreamConfig {
            channels: 1,
            sample_rate: cpal::SampleRate(defaults::SAMPLE_RATE),
            buffer_size: cpal::BufferSize::Default,
        };
        device.build_input_stream(
            &config,
            move |data: &[f32], _: &cpal::InputCallbackInfo| {
                callbacks.fetch_add(1, Ordering::Relaxed);
                tx.send(data.to_vec()).ok();
            },
            |err| warn!(error = %err, "audio input stream error"),
            None,
        )
    }

    fn build_native(
        device: &cpal::Device,
        tx: Sender<Vec<f32>>,
    ) -> Result<(cpal::Stream, u32, u16)> {
        let supported = device.default_input_config().map_err(config_error)?;
        let sample_rate = supported.sample_rate().0;
        let channels = supported.channels();
        let config: cpal::StreamConfig = supported.config();
        let on_error = |err: cpal::StreamError| warn!(error = %err, "audio input stream error");

        info!(
            channels,
            sample_rate,
            format = ?supported.sample_format(),
            "using native input format, converting in software"
        );

        let stream = match supported.sample_format() {
            cpal::SampleFormat::F32 => device.build_input_stream(
                &config,
                move |data: &[f32], _: &cpal::InputCallbackInfo| {
                    tx.send(data.to_vec()).ok();
                },
                on_error,
                None,
            ),
            cpal::SampleFormat::I16 => device.build_input_stream(
                &config,
                move |data: &[i16], _: &cpal::InputCallbackInfo| {
                    tx.send(data.iter().map(|&s| s as f32 / 32768.0).collect())
                        .ok();
                },
                on_error,
                None,
            ),
            cpal::SampleFormat::U16 => device.build_input_stream(
                &config,
                move |data: &[u16], _: &cpal::InputCallbackInfo| {
                    tx.send(
                        data.iter()
                            .map(|&s| (s as f32 - 32768.0) / 32768.0)
                            .collect(),
                    )
                    .ok();
                },
                on_error,
                None,
            ),
            other => {
                return Err(VoxliveError::device(
                    DeviceErrorKind::Busy,
                    format!(
                        "unsupported native sample format {:?}; try another --device",
                        other
                    ),
                ));
            }
        }
        .map_err(build_error)?;

        Ok((stream, sample_rate, channels))
    }
}

impl CaptureDevice for CpalCaptureDevice {
    fn acquire(&mut self) -> Result<()> {
        if self.stream.is_some() {
            return Ok(());
        }

        let device = find_input_device(self.device_name.as_deref())?;
        let (tx, rx) = unbounded();
        let callbacks = Arc::new(AtomicU64::new(0));

        let preferred = with_suppressed_stderr(|| {
            Self::build_preferred(&device, tx.clone(), Arc::clone(&callbacks))
        });

        let (stream, sample_rate, channels) = match preferred {
            Ok(stream) => {
                stream.play().map_err(play_error)?;
                // Some PipeWire-ALSA setups accept the config but never call back.
                std::thread::sleep(Duration::from_millis(200));
                if callbacks.load(Ordering::Relaxed) > 0 {
                    (stream, defaults::SAMPLE_RATE, 1)
                } else {
                    debug!("preferred input stream delivered no data, falling back to native");
                    drop(stream);
                    rx.try_iter().for_each(drop);
                    let (stream, rate, channels) = Self::build_native(&device, tx)?;
                    stream.play().map_err(play_error)?;
                    (stream, rate, channels)
                }
            }
            Err(e) => {
                debug!(error = %e, "preferred input format rejected");
                let (stream, rate, channels) = Self::build_native(&device, tx)?;
                stream.play().map_err(play_error)?;
                (stream, rate, channels)
            }
        };

        self.sample_rate = sample_rate;
        self.channels = channels;
        self.buffers = Some(rx);
        self.stream = Some(SendableStream(stream));
        Ok(())
    }

    fn release(&mut self) -> Result<()> {
        self.buffers = None;
        if let Some(stream) = self.stream.take() {
            stream.0.pause().map_err(|e| {
                VoxliveError::device(
                    DeviceErrorKind::Busy,
                    format!("failed to stop audio stream: {}", e),
                )
            })?;
        }
        Ok(())
    }

    fn read_samples(&mut self) -> Result<Vec<f32>> {
        let buffers = self.buffers.as_ref().ok_or_else(|| {
            VoxliveError::device(DeviceErrorKind::Busy, "microphone is not acquired")
        })?;
        Ok(buffers.try_iter().flatten().collect())
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn channels(&self) -> u16 {
        self.channels
    }
}
