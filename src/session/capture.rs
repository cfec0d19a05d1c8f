//! Microphone capture and the start/stop/turn-complete state machine.
//!
//! `Idle --start--> Recording --stop--> Stopping --(turn end sent)--> Idle`
//!
//! A dedicated worker thread owns the capture device for the duration of a
//! recording. It polls the device, frames and encodes the samples and
//! forwards each frame as an audio chunk. Control requests reach it as
//! messages, so `stop` and `cancel` never wait on the device.

use crate::audio::codec::{AudioFormat, FrameEncoder};
use crate::audio::device::{CaptureDevice, DeviceProvider};
use crate::audio::framer::{AudioFrame, SampleFramer};
use crate::config::CaptureConfig;
use crate::defaults;
use crate::error::{Result, VoxliveError};
use crate::session::envelope::Envelope;
use crate::session::report::StatusReporter;
use crate::session::sink::EnvelopeSink;
use crate::session::turn::{PendingTurn, ResolvedTurn, TurnCompletion};
use crossbeam_channel::{Receiver, Sender, never, select, unbounded};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

const COMPONENT: &str = "capture";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordingState {
    Idle,
    Recording,
    /// Stop requested; waiting for the turn end to be dispatched.
    Stopping,
}

#[derive(Debug)]
enum Control {
    Stop { grace: Duration },
    Cancel,
}

/// Timing knobs for the capture worker.
#[derive(Debug, Clone)]
pub struct CaptureSettings {
    pub frame_samples: usize,
    pub grace: Duration,
    pub poll_interval: Duration,
    pub max_consecutive_errors: u32,
}

impl Default for CaptureSettings {
    fn default() -> Self {
        Self::from(&CaptureConfig::default())
    }
}

impl From<&CaptureConfig> for CaptureSettings {
    fn from(config: &CaptureConfig) -> Self {
        Self {
            frame_samples: config.frame_samples,
            grace: config.turn_complete_grace(),
            poll_interval: Duration::from_millis(defaults::CAPTURE_POLL_MS),
            max_consecutive_errors: defaults::MAX_CONSECUTIVE_DEVICE_ERRORS,
        }
    }
}

#[derive(Default)]
struct WorkerSlot {
    control: Option<Sender<Control>>,
    handle: Option<JoinHandle<()>>,
}

/// Drives the microphone and hands framed audio to an [`EnvelopeSink`].
pub struct CaptureController {
    provider: Arc<dyn DeviceProvider>,
    sink: Arc<dyn EnvelopeSink>,
    reporter: Arc<dyn StatusReporter>,
    settings: CaptureSettings,
    state: Arc<watch::Sender<RecordingState>>,
    worker: Mutex<WorkerSlot>,
}

impl CaptureController {
    pub fn new(
        provider: Arc<dyn DeviceProvider>,
        sink: Arc<dyn EnvelopeSink>,
        reporter: Arc<dyn StatusReporter>,
        settings: CaptureSettings,
    ) -> Self {
        Self {
            provider,
            sink,
            reporter,
            settings,
            state: Arc::new(watch::Sender::new(RecordingState::Idle)),
            worker: Mutex::new(WorkerSlot::default()),
        }
    }

    pub fn state(&self) -> RecordingState {
        *self.state.borrow()
    }

    pub fn is_recording(&self) -> bool {
        self.state() != RecordingState::Idle
    }

    /// Subscribe to recording state changes.
    pub fn watch(&self) -> watch::Receiver<RecordingState> {
        self.state.subscribe()
    }

    /// Acquire the microphone and begin streaming audio chunks.
    ///
    /// Fails with `AlreadyRecording` unless Idle, or with a device error if
    /// the microphone cannot be acquired; both leave the state Idle-or-unchanged.
    pub fn start(&self) -> Result<()> {
        let began = self.state.send_if_modified(|state| {
            if *state == RecordingState::Idle {
                *state = RecordingState::Recording;
                true
            } else {
                false
            }
        });
        if !began {
            return Err(VoxliveError::AlreadyRecording);
        }

        // The control channel exists before acquisition so a stop issued
        // while the device is still opening is queued for the worker.
        let (control_tx, control_rx) = unbounded();
        self.slot().control = Some(control_tx);

        let device = match self.acquire() {
            Ok(device) => device,
            Err(e) => {
                self.slot().control = None;
                self.state.send_replace(RecordingState::Idle);
                self.reporter.report(COMPONENT, &e);
                return Err(e);
            }
        };

        info!(
            sample_rate = device.sample_rate(),
            channels = device.channels(),
            "microphone acquired"
        );

        let worker = CaptureWorker {
            device,
            sink: Arc::clone(&self.sink),
            reporter: Arc::clone(&self.reporter),
            settings: self.settings.clone(),
            state: Arc::clone(&self.state),
            control: control_rx,
        };
        let spawned = std::thread::Builder::new()
            .name("voxlive-capture".to_string())
            .spawn(move || worker.run());

        match spawned {
            Ok(handle) => {
                self.slot().handle = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.slot().control = None;
                self.state.send_replace(RecordingState::Idle);
                Err(VoxliveError::Io(e))
            }
        }
    }

    /// Request the end of the turn.
    ///
    /// The next outgoing chunk carries the turn-complete flag; if none is
    /// sent within the grace window a standalone turn-complete follows.
    /// Fails with `NotRecording` unless Recording, leaving the state as is.
    pub fn stop(&self) -> Result<()> {
        // A cancelled recording has given up its control sender while the
        // worker winds down; there is no turn left to end.
        let slot = self.slot();
        let Some(control) = slot.control.as_ref() else {
            return Err(VoxliveError::NotRecording);
        };
        let stopping = self.state.send_if_modified(|state| {
            if *state == RecordingState::Recording {
                *state = RecordingState::Stopping;
                true
            } else {
                false
            }
        });
        if !stopping {
            return Err(VoxliveError::NotRecording);
        }

        let grace = self.settings.grace;
        if control.send(Control::Stop { grace }).is_ok() {
            debug!(grace_ms = grace.as_millis() as u64, "stop requested");
        }
        Ok(())
    }

    /// Abort any recording without signalling the end of the turn.
    ///
    /// Never fails; the worker releases the device and returns to Idle.
    pub fn cancel(&self) {
        if self.state() == RecordingState::Idle {
            return;
        }
        if let Some(control) = self.slot().control.take() {
            control.send(Control::Cancel).ok();
        }
    }

    /// Wait for the current worker thread, if any, to finish.
    pub fn join(&self) {
        let handle = self.slot().handle.take();
        if let Some(handle) = handle
            && handle.join().is_err()
        {
            warn!("capture worker panicked");
            self.state.send_replace(RecordingState::Idle);
        }
    }

    fn acquire(&self) -> Result<Box<dyn CaptureDevice>> {
        let mut device = self.provider.open_capture()?;
        device.acquire()?;
        Ok(device)
    }

    fn slot(&self) -> std::sync::MutexGuard<'_, WorkerSlot> {
        self.worker.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for CaptureController {
    fn drop(&mut self) {
        self.cancel();
    }
}

struct CaptureWorker {
    device: Box<dyn CaptureDevice>,
    sink: Arc<dyn EnvelopeSink>,
    reporter: Arc<dyn StatusReporter>,
    settings: CaptureSettings,
    state: Arc<watch::Sender<RecordingState>>,
    control: Receiver<Control>,
}

enum Step {
    Continue,
    Finished,
}

impl CaptureWorker {
    fn run(mut self) {
        let mut framer = SampleFramer::new(
            self.settings.frame_samples,
            self.device.sample_rate(),
            self.device.channels(),
        );
        let encoder = FrameEncoder::new(AudioFormat::default());
        let mut pending: Option<PendingTurn> = None;
        let mut consecutive_errors = 0u32;
        let mut sent = 0u64;

        loop {
            let timer = pending.as_ref().map_or_else(never, PendingTurn::timer);

            let step = select! {
                recv(self.control) -> message => match message {
                    Ok(Control::Stop { grace }) => {
                        if pending.is_none() {
                            pending = Some(PendingTurn::arm(grace));
                        }
                        Step::Continue
                    }
                    Ok(Control::Cancel) | Err(_) => {
                        debug!("capture cancelled");
                        Step::Finished
                    }
                },
                recv(timer) -> _ => {
                    if let Some(turn) = pending.take() {
                        self.finish_standalone(turn);
                    }
                    Step::Finished
                },
                default(self.settings.poll_interval) => match self.device.read_samples() {
                    Ok(samples) => {
                        consecutive_errors = 0;
                        let frames = framer.push(&samples);
                        self.dispatch(frames, &encoder, &mut pending, &mut sent)
                    }
                    Err(e) => {
                        consecutive_errors += 1;
                        if consecutive_errors == 1 {
                            self.reporter.report(COMPONENT, &e);
                        }
                        if consecutive_errors >= self.settings.max_consecutive_errors {
                            warn!(errors = consecutive_errors, "microphone stopped delivering audio");
                            self.reporter.report(COMPONENT, &e);
                            if let Some(turn) = pending.take() {
                                self.finish_standalone(turn);
                            }
                            Step::Finished
                        } else {
                            Step::Continue
                        }
                    }
                },
            };

            if let Step::Finished = step {
                break;
            }
        }

        if framer.pending_len() > 0 {
            debug!(samples = framer.pending_len(), "discarding partial frame");
        }
        framer.reset();

        if let Err(e) = self.device.release() {
            self.reporter.report(COMPONENT, &e);
        }
        info!(chunks = sent, "microphone released");
        self.state.send_replace(RecordingState::Idle);
    }

    /// Send completed frames; the last one carries the flag if a turn is pending.
    fn dispatch(
        &self,
        frames: Vec<AudioFrame>,
        encoder: &FrameEncoder,
        pending: &mut Option<PendingTurn>,
        sent: &mut u64,
    ) -> Step {
        let count = frames.len();
        for (index, frame) in frames.into_iter().enumerate() {
            let data = encoder.encode(&frame.samples);
            let last = index + 1 == count;

            if last && let Some(turn) = pending.take() {
                let flagged = Envelope::audio_chunk(data, encoder.format(), true);
                match self.sink.send(flagged) {
                    Ok(()) => {
                        *sent += 1;
                        self.log_resolved(turn.complete(TurnCompletion::FlaggedChunk), frame.sequence);
                    }
                    Err(e) => {
                        self.reporter.report(COMPONENT, &e);
                        self.finish_standalone(turn);
                    }
                }
                return Step::Finished;
            }

            match self
                .sink
                .send(Envelope::audio_chunk(data, encoder.format(), false))
            {
                Ok(()) => {
                    *sent += 1;
                    if *sent % defaults::CHUNK_LOG_INTERVAL == 0 {
                        debug!(sequence = frame.sequence, sent = *sent, "sent audio chunk");
                    }
                }
                // A dropped chunk never stalls capture.
                Err(e) => self.reporter.report(COMPONENT, &e),
            }
        }
        Step::Continue
    }

    fn finish_standalone(&self, turn: PendingTurn) {
        match self.sink.send(Envelope::TurnComplete) {
            Ok(()) => {
                let resolved = turn.complete(TurnCompletion::Standalone);
                info!(
                    after_ms = resolved.after.as_millis() as u64,
                    "sent standalone turn_complete"
                );
            }
            Err(e) => self.reporter.report(COMPONENT, &e),
        }
    }

    fn log_resolved(&self, resolved: ResolvedTurn, sequence: u64) {
        info!(
            sequence,
            after_ms = resolved.after.as_millis() as u64,
            "sent final audio chunk with turn_complete"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audio::device::MockDeviceProvider;
    use crate::error::{DeviceErrorKind, ErrorKind};
    use crate::session::report::CollectingReporter;
    use crate::session::sink::CollectingSink;
    use std::time::Instant;

    const FRAME: usize = 160;

    struct Harness {
        provider: MockDeviceProvider,
        sink: Arc<CollectingSink>,
        reporter: Arc<CollectingReporter>,
        controller: CaptureController,
    }

    fn harness_with(provider: MockDeviceProvider, sink: CollectingSink, grace: Duration) -> Harness {
        let sink = Arc::new(sink);
        let reporter = Arc::new(CollectingReporter::new());
        let settings = CaptureSettings {
            frame_samples: FRAME,
            grace,
            poll_interval: Duration::from_millis(2),
            max_consecutive_errors: 3,
        };
        let controller = CaptureController::new(
            Arc::new(provider.clone()),
            sink.clone(),
            reporter.clone(),
            settings,
        );
        Harness {
            provider,
            sink,
            reporter,
            controller,
        }
    }

    fn harness(grace: Duration) -> Harness {
        harness_with(MockDeviceProvider::new(), CollectingSink::new(), grace)
    }

    fn wait_idle(controller: &CaptureController) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while controller.state() != RecordingState::Idle {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }

    fn turn_ends(envelopes: &[Envelope]) -> usize {
        envelopes.iter().filter(|e| e.completes_turn()).count()
    }

    #[test]
    fn test_start_streams_chunks_without_flag() {
        let h = harness(Duration::from_millis(50));
        h.controller.start().unwrap();
        assert_eq!(h.controller.state(), RecordingState::Recording);

        for _ in 0..3 {
            h.provider.feed(vec![0.1; FRAME]);
        }
        assert!(h.sink.wait_for(3, Duration::from_secs(2)));

        let envelopes = h.sink.envelopes();
        assert!(envelopes.iter().all(|e| matches!(
            e,
            Envelope::AudioChunk { turn_complete: false, format: Some(f), .. } if f == "audio/pcm;rate=16000"
        )));

        h.controller.cancel();
        assert!(wait_idle(&h.controller));
    }

    #[test]
    fn test_stop_flags_next_chunk() {
        let h = harness(Duration::from_secs(2));
        h.controller.start().unwrap();

        h.provider.feed(vec![0.2; FRAME]);
        assert!(h.sink.wait_for(1, Duration::from_secs(2)));

        h.controller.stop().unwrap();
        assert_eq!(h.controller.state(), RecordingState::Stopping);
        h.provider.feed(vec![0.3; FRAME]);

        assert!(wait_idle(&h.controller));
        let envelopes = h.sink.envelopes();
        assert_eq!(envelopes.len(), 2);
        assert!(matches!(
            envelopes[1],
            Envelope::AudioChunk {
                turn_complete: true,
                ..
            }
        ));
        assert_eq!(turn_ends(&envelopes), 1);
        assert_eq!(h.provider.stats().release_count(), 1);
    }

    #[test]
    fn test_stop_without_data_sends_standalone_after_grace() {
        let h = harness(Duration::from_millis(30));
        h.controller.start().unwrap();

        let stopped_at = Instant::now();
        h.controller.stop().unwrap();
        assert!(wait_idle(&h.controller));

        assert!(stopped_at.elapsed() >= Duration::from_millis(30));
        assert_eq!(h.sink.envelopes(), vec![Envelope::TurnComplete]);
        assert_eq!(h.provider.stats().release_count(), 1);
    }

    #[test]
    fn test_stop_after_cancel_is_refused() {
        let h = harness(Duration::from_millis(30));
        h.controller.start().unwrap();
        h.controller.cancel();

        // the worker may still be winding down, but the turn is gone
        assert!(matches!(h.controller.stop(), Err(VoxliveError::NotRecording)));
        assert_ne!(h.controller.state(), RecordingState::Stopping);
        assert!(wait_idle(&h.controller));

        std::thread::sleep(Duration::from_millis(60));
        assert_eq!(turn_ends(&h.sink.envelopes()), 0);
    }

    #[test]
    fn test_partial_frame_after_stop_is_not_sent() {
        let h = harness(Duration::from_millis(30));
        h.controller.start().unwrap();
        h.controller.stop().unwrap();
        h.provider.feed(vec![0.1; FRAME / 2]);

        assert!(wait_idle(&h.controller));
        assert_eq!(h.sink.envelopes(), vec![Envelope::TurnComplete]);
    }

    #[test]
    fn test_multiple_frames_in_one_read_flag_only_the_last() {
        let h = harness(Duration::from_secs(2));
        h.controller.start().unwrap();
        h.controller.stop().unwrap();
        h.provider.feed(vec![0.1; FRAME * 3]);

        assert!(wait_idle(&h.controller));
        let envelopes = h.sink.envelopes();
        assert_eq!(envelopes.len(), 3);
        assert_eq!(turn_ends(&envelopes), 1);
        assert!(envelopes[2].completes_turn());
    }

    #[test]
    fn test_ten_buffers_then_stop_yields_one_turn_end() {
        let h = harness(Duration::from_millis(50));
        h.controller.start().unwrap();

        for _ in 0..10 {
            h.provider.feed(vec![0.05; FRAME]);
        }
        assert!(h.sink.wait_for(10, Duration::from_secs(2)));
        h.controller.stop().unwrap();
        assert!(wait_idle(&h.controller));

        let envelopes = h.sink.envelopes();
        let audio = envelopes
            .iter()
            .filter(|e| matches!(e, Envelope::AudioChunk { .. }))
            .count();
        assert_eq!(audio, 10);
        assert_eq!(turn_ends(&envelopes), 1);
        assert!(envelopes.last().is_some_and(Envelope::completes_turn));
        assert_eq!(h.provider.stats().acquire_count(), 1);
        assert_eq!(h.provider.stats().release_count(), 1);
    }

    #[test]
    fn test_flagged_send_failure_falls_back_to_standalone() {
        let h = harness_with(
            MockDeviceProvider::new(),
            CollectingSink::new().with_flagged_rejection(),
            Duration::from_secs(2),
        );
        h.controller.start().unwrap();
        h.controller.stop().unwrap();
        h.provider.feed(vec![0.1; FRAME]);

        assert!(wait_idle(&h.controller));
        assert_eq!(h.sink.envelopes(), vec![Envelope::TurnComplete]);
        assert_eq!(h.reporter.count(ErrorKind::Send), 1);
    }

    #[test]
    fn test_send_failures_do_not_stall_capture() {
        let h = harness_with(
            MockDeviceProvider::new(),
            CollectingSink::rejecting(),
            Duration::from_millis(20),
        );
        h.controller.start().unwrap();
        for _ in 0..4 {
            h.provider.feed(vec![0.1; FRAME]);
        }

        let deadline = Instant::now() + Duration::from_secs(2);
        while h.reporter.count(ErrorKind::Send) < 4 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(2));
        }
        assert_eq!(h.reporter.count(ErrorKind::Send), 4);
        assert_eq!(h.controller.state(), RecordingState::Recording);

        h.controller.cancel();
        assert!(wait_idle(&h.controller));
    }

    #[test]
    fn test_start_twice_fails_with_already_recording() {
        let h = harness(Duration::from_millis(20));
        h.controller.start().unwrap();

        assert!(matches!(
            h.controller.start(),
            Err(VoxliveError::AlreadyRecording)
        ));
        assert_eq!(h.controller.state(), RecordingState::Recording);
        assert_eq!(h.provider.stats().acquire_count(), 1);

        h.controller.cancel();
        assert!(wait_idle(&h.controller));
    }

    #[test]
    fn test_stop_when_idle_fails_and_keeps_state() {
        let h = harness(Duration::from_millis(20));
        assert!(matches!(h.controller.stop(), Err(VoxliveError::NotRecording)));
        assert_eq!(h.controller.state(), RecordingState::Idle);
        assert!(h.sink.is_empty());
    }

    #[test]
    fn test_second_stop_while_stopping_fails() {
        let h = harness(Duration::from_millis(200));
        h.controller.start().unwrap();
        h.controller.stop().unwrap();

        assert!(matches!(h.controller.stop(), Err(VoxliveError::NotRecording)));
        assert_eq!(h.controller.state(), RecordingState::Stopping);

        assert!(wait_idle(&h.controller));
        assert_eq!(turn_ends(&h.sink.envelopes()), 1);
    }

    #[test]
    fn test_device_errors_are_distinguishable() {
        for kind in [
            DeviceErrorKind::PermissionDenied,
            DeviceErrorKind::NotFound,
            DeviceErrorKind::Busy,
        ] {
            let h = harness_with(
                MockDeviceProvider::new().with_capture_failure(kind),
                CollectingSink::new(),
                Duration::from_millis(20),
            );

            match h.controller.start() {
                Err(VoxliveError::Device { kind: actual, .. }) => assert_eq!(actual, kind),
                other => panic!("Expected Device error, got {:?}", other),
            }
            assert_eq!(h.controller.state(), RecordingState::Idle);
            assert_eq!(h.reporter.count(ErrorKind::Device(kind)), 1);
        }
    }

    #[test]
    fn test_cancel_releases_without_turn_end() {
        let h = harness(Duration::from_millis(20));
        h.controller.start().unwrap();
        h.provider.feed(vec![0.1; FRAME]);
        assert!(h.sink.wait_for(1, Duration::from_secs(2)));

        h.controller.cancel();
        assert!(wait_idle(&h.controller));
        assert_eq!(turn_ends(&h.sink.envelopes()), 0);
        assert_eq!(h.provider.stats().release_count(), 1);

        // cancel when idle is a no-op
        h.controller.cancel();
        assert_eq!(h.controller.state(), RecordingState::Idle);
    }

    #[test]
    fn test_restart_after_turn_end() {
        let h = harness(Duration::from_millis(10));
        for _ in 0..2 {
            h.controller.start().unwrap();
            h.controller.stop().unwrap();
            assert!(wait_idle(&h.controller));
        }
        assert_eq!(turn_ends(&h.sink.envelopes()), 2);
        assert_eq!(h.provider.stats().acquire_count(), 2);
        assert_eq!(h.provider.stats().release_count(), 2);
    }

    #[test]
    fn test_persistent_read_errors_end_the_recording() {
        let h = harness_with(
            MockDeviceProvider::new().with_read_failure(),
            CollectingSink::new(),
            Duration::from_secs(2),
        );
        h.controller.start().unwrap();
        h.controller.stop().unwrap();

        assert!(wait_idle(&h.controller));
        // the turn end is still delivered
        assert_eq!(h.sink.envelopes(), vec![Envelope::TurnComplete]);
        assert_eq!(h.reporter.count(ErrorKind::Device(DeviceErrorKind::Busy)), 2);
        assert_eq!(h.provider.stats().release_count(), 1);
    }

    #[test]
    fn test_watch_reports_transitions() {
        let h = harness(Duration::from_millis(10));
        let mut rx = h.controller.watch();
        assert_eq!(*rx.borrow_and_update(), RecordingState::Idle);

        h.controller.start().unwrap();
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), RecordingState::Recording);

        h.controller.stop().unwrap();
        assert!(wait_idle(&h.controller));
        assert_eq!(*rx.borrow_and_update(), RecordingState::Idle);
    }

    #[test]
    fn test_stereo_device_input_is_downmixed_before_framing() {
        let provider = MockDeviceProvider::new().with_capture_format(16000, 2);
        let h = harness_with(provider, CollectingSink::new(), Duration::from_millis(20));
        h.controller.start().unwrap();
        h.provider.feed(vec![0.5; FRAME * 2]);

        assert!(h.sink.wait_for(1, Duration::from_secs(2)));
        h.controller.cancel();
        assert!(wait_idle(&h.controller));
        assert_eq!(h.sink.len(), 1);
    }
}
