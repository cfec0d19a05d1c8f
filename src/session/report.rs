//! Error reporting for session components.

use crate::error::{ErrorKind, LastError, VoxliveError};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::watch;
use tracing::{error, warn};

/// Trait for reporting errors that a component absorbs instead of returning.
pub trait StatusReporter: Send + Sync {
    /// Reports an error from a component.
    fn report(&self, component: &str, error: &VoxliveError);
}

/// Reporter that only logs.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogReporter;

impl StatusReporter for LogReporter {
    fn report(&self, component: &str, error: &VoxliveError) {
        if error.is_recoverable() {
            warn!(component, error = %error, "recoverable error");
        } else {
            error!(component, error = %error, "error");
        }
    }
}

/// Reporter that logs and publishes surfaced errors to a `last_error` slot.
///
/// Device, connection and remote errors are published; send, decode and
/// protocol errors are absorbed after logging.
#[derive(Debug, Clone)]
pub struct SessionReporter {
    last_error: Arc<watch::Sender<Option<LastError>>>,
}

impl SessionReporter {
    pub fn new(last_error: Arc<watch::Sender<Option<LastError>>>) -> Self {
        Self { last_error }
    }

    /// Whether errors of this kind reach the `last_error` slot.
    pub fn surfaces(kind: ErrorKind) -> bool {
        matches!(
            kind,
            ErrorKind::Device(_) | ErrorKind::Connection | ErrorKind::Remote
        )
    }
}

impl StatusReporter for SessionReporter {
    fn report(&self, component: &str, error: &VoxliveError) {
        LogReporter.report(component, error);
        if Self::surfaces(error.kind()) {
            self.last_error.send_replace(Some(LastError::from(error)));
        }
    }
}

/// Reporter that collects errors for inspection in tests.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    reports: Mutex<Vec<(String, ErrorKind, String)>>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Collected `(component, kind, message)` triples in report order.
    pub fn reports(&self) -> Vec<(String, ErrorKind, String)> {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn count(&self, kind: ErrorKind) -> usize {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .count()
    }
}

impl StatusReporter for CollectingReporter {
    fn report(&self, component: &str, error: &VoxliveError) {
        self.reports
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((component.to_string(), error.kind(), error.to_string()));
    }
}
