use crate::error::{Result, VoxliveError};
use crate::session::envelope::Envelope;
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

/// Destination for outbound envelopes.
///
/// Implementations must not block: the capture worker calls `send` from its
/// polling loop.
pub trait EnvelopeSink: Send + Sync {
    fn send(&self, envelope: Envelope) -> Result<()>;
}

/// Sink that collects envelopes in memory (useful for testing).
#[derive(Debug, Default)]
pub struct CollectingSink {
    envelopes: Mutex<Vec<Envelope>>,
    reject_flagged: bool,
    reject_all: bool,
}

impl CollectingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every send
    pub fn rejecting() -> Self {
        Self {
            reject_all: true,
            ..Self::default()
        }
    }

    /// Fail audio chunks that carry the turn-complete flag
    pub fn with_flagged_rejection(mut self) -> Self {
        self.reject_flagged = true;
        self
    }

    pub fn envelopes(&self) -> Vec<Envelope> {
        self.envelopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn len(&self) -> usize {
        self.envelopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Block until at least `count` envelopes arrived, or `timeout` elapses.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.len() < count {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(2));
        }
        true
    }
}

impl EnvelopeSink for CollectingSink {
    fn send(&self, envelope: Envelope) -> Result<()> {
        if self.reject_all {
            return Err(VoxliveError::Send {
                message: "sink rejects everything".to_string(),
            });
        }
        if self.reject_flagged
            && let Envelope::AudioChunk {
                turn_complete: true,
                ..
            } = envelope
        {
            return Err(VoxliveError::Send {
                message: "sink rejects flagged chunks".to_string(),
            });
        }
        self.envelopes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(envelope);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_collecting_sink_records_in_order() {
        let sink = CollectingSink::new();
        sink.send(Envelope::TurnComplete).unwrap();
        sink.send(Envelope::StatusNotice {
            message: "x".to_string(),
        })
        .unwrap();

        let envelopes = sink.envelopes();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0], Envelope::TurnComplete);
        assert!(sink.wait_for(2, Duration::ZERO));
        assert!(!sink.wait_for(3, Duration::from_millis(10)));
    }

    #[test]
    fn test_rejecting_sinks() {
        let sink = CollectingSink::rejecting();
        assert!(sink.send(Envelope::TurnComplete).is_err());
        assert!(sink.is_empty());

        let sink = CollectingSink::new().with_flagged_rejection();
        let flagged = Envelope::AudioChunk {
            data: String::new(),
            format: None,
            turn_complete: true,
        };
        assert!(sink.send(flagged).is_err());
        assert!(sink.send(Envelope::TurnComplete).is_ok());
        assert_eq!(sink.len(), 1);
    }
}
