//! Default configuration constants for voxlive.
//!
//! Shared between the config layer, the session components and the CLI so
//! the wire format and timing policy are defined in exactly one place.

/// Wire sample rate in Hz.
///
/// Both directions of a live session carry mono PCM16 at this rate,
/// independent of what the local capture or output device prefers.
pub const SAMPLE_RATE: u32 = 16000;

/// Encoding name used in the audio format descriptor.
pub const PCM_ENCODING: &str = "audio/pcm";

/// Samples per outbound audio frame.
///
/// 4096 samples at 16kHz is 256ms of audio, roughly one capture buffer.
pub const FRAME_SAMPLES: usize = 4096;

/// Grace window after a stop request, in milliseconds.
///
/// One more capture buffer may flush with the turn-complete flag attached
/// during this window; otherwise a standalone turn-complete is sent.
pub const TURN_COMPLETE_GRACE_MS: u64 = 200;

/// Upper bound accepted for the grace window.
pub const MAX_TURN_COMPLETE_GRACE_MS: u64 = 5000;

/// Default live session endpoint.
pub const ENDPOINT: &str = "ws://localhost:8000/ws/live";

/// Handshake timeout in milliseconds.
pub const CONNECT_TIMEOUT_MS: u64 = 10_000;

/// Reconnect attempts after an abnormal disconnect.
pub const RECONNECT_ATTEMPTS: u32 = 3;

/// First reconnect delay in milliseconds; doubles per attempt.
pub const RECONNECT_BACKOFF_MS: u64 = 500;

/// Ceiling for the reconnect delay in milliseconds.
pub const MAX_RECONNECT_BACKOFF_MS: u64 = 8000;

/// WebSocket close code for a normal closure.
pub const NORMAL_CLOSE_CODE: u16 = 1000;

/// Close code reported when a close frame carries no status.
pub const NO_STATUS_CLOSE_CODE: u16 = 1005;

/// Close code reported when the transport ends without a close frame.
pub const ABNORMAL_CLOSE_CODE: u16 = 1006;

/// How often the capture worker drains the device buffer, in milliseconds.
pub const CAPTURE_POLL_MS: u64 = 16;

/// Audio left queued on the output when the next segment is requested,
/// in milliseconds.
pub const PLAYBACK_LOW_WATERMARK_MS: u64 = 40;

/// How often the playback worker checks whether the output has drained.
pub const PLAYBACK_SETTLE_POLL_MS: u64 = 2;

/// Consecutive device read failures tolerated before capture gives up.
pub const MAX_CONSECUTIVE_DEVICE_ERRORS: u32 = 5;

/// Number of violations carried in a context primer.
pub const CONTEXT_TOP_VIOLATIONS: usize = 5;

/// Log every Nth outbound audio chunk at debug level.
pub const CHUNK_LOG_INTERVAL: u64 = 20;

/// Backoff delay before reconnect attempt `attempt` (1-based).
pub fn reconnect_delay_ms(base_ms: u64, attempt: u32) -> u64 {
    let factor = 1u64 << attempt.saturating_sub(1).min(16);
    base_ms.saturating_mul(factor).min(MAX_RECONNECT_BACKOFF_MS)
}
