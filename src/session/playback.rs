//! Serialized playback of inbound audio.
//!
//! Payloads are queued in arrival order and handed to the device one at a
//! time by a single worker thread, so segments never overlap. The device
//! asks for the next segment while the current one still has audio left,
//! which keeps consecutive segments gapless. `enqueue` never waits for the
//! device.

use crate::audio::codec::{AudioFormat, FrameDecoder, PcmSegment, decode_container, is_container};
use crate::audio::device::{DeviceProvider, PlaybackDevice};
use crate::config::PlaybackConfig;
use crate::defaults;
use crate::error::{Result, VoxliveError};
use crate::session::report::StatusReporter;
use crossbeam_channel::{Receiver, Sender, unbounded};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info};

const COMPONENT: &str = "playback";

enum Command {
    Play {
        epoch: u64,
        payload: String,
        format: AudioFormat,
    },
    Shutdown,
}

/// Plays inbound audio payloads strictly one after another.
pub struct PlaybackController {
    commands: Sender<Command>,
    epoch: Arc<AtomicU64>,
    speaking: Arc<watch::Sender<bool>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl PlaybackController {
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        reporter: Arc<dyn StatusReporter>,
        config: &PlaybackConfig,
    ) -> Result<Self> {
        let (commands, queue) = unbounded();
        let epoch = Arc::new(AtomicU64::new(0));
        let speaking = Arc::new(watch::Sender::new(false));

        let worker = PlaybackWorker {
            provider,
            reporter,
            container_fallback: config.container_fallback,
            device: None,
            queue,
            epoch: Arc::clone(&epoch),
            speaking: Arc::clone(&speaking),
        };
        let handle = std::thread::Builder::new()
            .name("voxlive-playback".to_string())
            .spawn(move || worker.run())?;

        Ok(Self {
            commands,
            epoch,
            speaking,
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Queue an encoded payload for playback.
    ///
    /// Never fails; decode and device errors are reported by the worker and
    /// only cost the affected segment.
    pub fn enqueue(&self, payload: impl Into<String>, format: AudioFormat) {
        let command = Command::Play {
            epoch: self.epoch.load(Ordering::SeqCst),
            payload: payload.into(),
            format,
        };
        if self.commands.send(command).is_err() {
            debug!("playback worker gone, dropping segment");
        }
    }

    /// Drop every segment queued so far. The segment playing now finishes.
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
    }

    pub fn is_speaking(&self) -> bool {
        *self.speaking.borrow()
    }

    pub fn watch(&self) -> watch::Receiver<bool> {
        self.speaking.subscribe()
    }

    /// Stop the worker after the current segment and wait for it.
    pub fn shutdown(&self) {
        self.clear();
        self.commands.send(Command::Shutdown).ok();
        let handle = self
            .worker
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            self.speaking.send_replace(false);
        }
    }
}

impl Drop for PlaybackController {
    fn drop(&mut self) {
        self.clear();
        self.commands.send(Command::Shutdown).ok();
    }
}

struct PlaybackWorker {
    provider: Arc<dyn DeviceProvider>,
    reporter: Arc<dyn StatusReporter>,
    container_fallback: bool,
    device: Option<Box<dyn PlaybackDevice>>,
    queue: Receiver<Command>,
    epoch: Arc<AtomicU64>,
    speaking: Arc<watch::Sender<bool>>,
}

impl PlaybackWorker {
    fn run(mut self) {
        let mut played = 0u64;
        while let Ok(command) = self.queue.recv() {
            let Command::Play {
                epoch,
                payload,
                format,
            } = command
            else {
                break;
            };

            if epoch != self.epoch.load(Ordering::SeqCst) {
                debug!("skipping cleared segment");
                self.settle();
                continue;
            }

            if self.play_payload(&payload, &format) {
                played += 1;
            }
            self.settle();
        }

        self.device = None;
        self.speaking.send_replace(false);
        info!(segments = played, "playback stopped");
    }

    /// Decode and play one payload. Returns whether anything was played.
    fn play_payload(&mut self, payload: &str, format: &AudioFormat) -> bool {
        if is_container(payload) {
            if self.container_fallback {
                return self.try_container(payload);
            }
            self.reporter.report(
                COMPONENT,
                &VoxliveError::Decode {
                    message: "WAV payload received with container decoding disabled".to_string(),
                },
            );
            return false;
        }

        match FrameDecoder::new(format.clone()).decode(payload) {
            Ok(segment) => {
                if self.play_segment(&segment) {
                    return true;
                }
                // Raw PCM was rejected by the device; the payload may be a
                // self-describing container instead.
                self.try_container(payload)
            }
            Err(e) => {
                self.reporter.report(COMPONENT, &e);
                self.try_container(payload)
            }
        }
    }

    fn try_container(&mut self, payload: &str) -> bool {
        if !self.container_fallback {
            return false;
        }
        match decode_container(payload) {
            Ok(segment) => {
                debug!(
                    sample_rate = segment.sample_rate,
                    samples = segment.samples.len(),
                    "decoded container payload"
                );
                self.play_segment(&segment)
            }
            Err(e) => {
                self.reporter.report(COMPONENT, &e);
                false
            }
        }
    }

    fn play_segment(&mut self, segment: &PcmSegment) -> bool {
        if segment.is_empty() {
            return false;
        }
        if self.device.is_none() {
            match self.provider.open_playback() {
                Ok(device) => self.device = Some(device),
                Err(e) => {
                    self.reporter.report(COMPONENT, &e);
                    return false;
                }
            }
        }
        let Some(device) = self.device.as_mut() else {
            return false;
        };

        self.speaking.send_if_modified(|speaking| !std::mem::replace(speaking, true));
        match device.play(segment) {
            Ok(()) => {
                debug!(
                    duration_ms = segment.duration().as_millis() as u64,
                    "queued segment"
                );
                true
            }
            Err(e) => {
                self.reporter.report(COMPONENT, &e);
                false
            }
        }
    }

    /// Drop the speaking flag once nothing else is waiting and the device
    /// has pulled its last sample. Returns early when a command arrives.
    fn settle(&mut self) {
        let poll = Duration::from_millis(defaults::PLAYBACK_SETTLE_POLL_MS);
        loop {
            if !self.queue.is_empty() {
                return;
            }
            let pending = match self.device.as_mut().map(|device| device.pending()) {
                Some(Ok(pending)) => pending,
                Some(Err(e)) => {
                    self.reporter.report(COMPONENT, &e);
                    Duration::ZERO
                }
                None => Duration::ZERO,
            };
            if pending.is_zero() {
                self.speaking.send_if_modified(|speaking| std::mem::replace(speaking, false));
                return;
            }
            std::thread::sleep(pending.min(poll));
        }
    }
}
