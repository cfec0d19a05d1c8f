//! Turn-complete race resolution.
//!
//! After a stop request two completions compete: the next outgoing audio
//! chunk (which then carries the flag) and a grace-window timer (which then
//! triggers a standalone turn-complete). The first one to fire consumes the
//! [`PendingTurn`]; dropping it cancels the other.

use crossbeam_channel::{Receiver, after};
use std::time::{Duration, Instant};

/// How the end of a turn reached the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TurnCompletion {
    /// The final audio chunk carried `turn_complete = true`.
    FlaggedChunk,
    /// No chunk followed in time; a standalone envelope was sent.
    Standalone,
}

/// An armed, not yet resolved turn end.
#[derive(Debug)]
pub struct PendingTurn {
    timer: Receiver<Instant>,
    armed_at: Instant,
    grace: Duration,
}

impl PendingTurn {
    /// Arm the grace-window timer.
    pub fn arm(grace: Duration) -> Self {
        Self {
            timer: after(grace),
            armed_at: Instant::now(),
            grace,
        }
    }

    /// Receiver that fires once the grace window elapses.
    pub fn timer(&self) -> Receiver<Instant> {
        self.timer.clone()
    }

    pub fn grace(&self) -> Duration {
        self.grace
    }

    /// Resolve the turn; consuming `self` makes a second resolution impossible.
    pub fn complete(self, via: TurnCompletion) -> ResolvedTurn {
        ResolvedTurn {
            via,
            after: self.armed_at.elapsed(),
        }
    }
}

/// Outcome of a resolved turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedTurn {
    pub via: TurnCompletion,
    /// Time from the stop request to resolution.
    pub after: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crossbeam_channel::select;

    #[test]
    fn timer_fires_after_grace_window() {
        let turn = PendingTurn::arm(Duration::from_millis(20));
        let fired = turn.timer().recv_timeout(Duration::from_secs(1));
        assert!(fired.is_ok());

        let resolved = turn.complete(TurnCompletion::Standalone);
        assert_eq!(resolved.via, TurnCompletion::Standalone);
        assert!(resolved.after >= Duration::from_millis(20));
    }

    #[test]
    fn data_arrival_wins_before_timer() {
        let turn = PendingTurn::arm(Duration::from_secs(5));
        let (data_tx, data_rx) = crossbeam_channel::unbounded::<()>();
        data_tx.send(()).unwrap();

        let timer = turn.timer();
        let via = select! {
            recv(data_rx) -> _ => TurnCompletion::FlaggedChunk,
            recv(timer) -> _ => TurnCompletion::Standalone,
        };

        let resolved = turn.complete(via);
        assert_eq!(resolved.via, TurnCompletion::FlaggedChunk);
        assert!(resolved.after < Duration::from_secs(5));
    }

    #[test]
    fn option_take_guards_single_resolution() {
        let mut pending = Some(PendingTurn::arm(Duration::from_millis(200)));

        let first = pending.take().map(|t| t.complete(TurnCompletion::FlaggedChunk));
        let second = pending.take().map(|t| t.complete(TurnCompletion::Standalone));

        assert_eq!(first.map(|r| r.via), Some(TurnCompletion::FlaggedChunk));
        assert!(second.is_none());
    }

    #[test]
    fn zero_grace_fires_immediately() {
        let turn = PendingTurn::arm(Duration::ZERO);
        assert!(turn.timer().recv_timeout(Duration::from_millis(100)).is_ok());
        assert_eq!(turn.grace(), Duration::ZERO);
    }
}
