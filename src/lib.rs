//! voxlive - full-duplex live voice sessions
//!
//! Streams microphone audio to an agent backend over a persistent WebSocket
//! and plays the agent's spoken replies as they arrive.

// Enforce error handling discipline
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod audio;
#[cfg(feature = "cli")]
pub mod cli;
pub mod config;
pub mod defaults;
pub mod error;
pub mod session;

// Composition root for the interactive client
#[cfg(all(feature = "cpal-audio", feature = "cli"))]
pub mod app;

// Device seams (real hardware vs mock)
pub use audio::device::{
    CaptureDevice, DeviceProvider, MockDeviceProvider, MockDeviceStats, PlaybackDevice,
};
#[cfg(feature = "cpal-audio")]
pub use audio::CpalDeviceProvider;

// Audio pipeline
pub use audio::codec::{
    AudioFormat, FrameDecoder, FrameEncoder, PcmSegment, decode_container, is_container,
};
pub use audio::framer::{AudioFrame, SampleFramer};

// Session
pub use session::capture::{CaptureController, CaptureSettings, RecordingState};
pub use session::channel::{ChannelEvent, CloseReport, ConnectionHandle, SessionChannel};
pub use session::envelope::{ContextSummary, Envelope, ViolationSummary};
pub use session::orchestrator::{SessionOrchestrator, SessionState};
pub use session::playback::PlaybackController;
pub use session::report::{CollectingReporter, LogReporter, SessionReporter, StatusReporter};
pub use session::sink::{CollectingSink, EnvelopeSink};

// Error handling
pub use error::{DeviceErrorKind, ErrorKind, LastError, Result, VoxliveError};

// Config
pub use config::Config;

/// Build version string with optional git commit hash.
///
/// Returns `"0.1.0+abc1234"` when git hash is available, `"0.1.0"` otherwise.
pub fn version_string() -> String {
    let version = env!("CARGO_PKG_VERSION");
    match option_env!("GIT_HASH") {
        Some(hash) if !hash.is_empty() => format!("{}+{}", version, hash),
        _ => version.to_string(),
    }
}
