//! Live session: wire envelopes, the WebSocket channel, capture and
//! playback controllers and the orchestrator tying them together.

pub mod capture;
pub mod channel;
pub mod envelope;
pub mod orchestrator;
pub mod playback;
pub mod report;
pub mod sink;
pub mod turn;
