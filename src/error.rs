//! Error types for voxlive.

use std::fmt;
use thiserror::Error;

/// Why an audio device could not be used.
///
/// Each kind maps to different remediation guidance for the user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceErrorKind {
    PermissionDenied,
    NotFound,
    Busy,
}

impl DeviceErrorKind {
    /// Guidance shown to the user alongside the error.
    pub fn remediation(&self) -> &'static str {
        match self {
            DeviceErrorKind::PermissionDenied => {
                "Grant microphone access to this application in your system privacy settings"
            }
            DeviceErrorKind::NotFound => {
                "Connect a microphone or pick another one with --device (see `voxlive devices`)"
            }
            DeviceErrorKind::Busy => {
                "Close other applications that are using the audio device and try again"
            }
        }
    }
}

impl fmt::Display for DeviceErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceErrorKind::PermissionDenied => write!(f, "permission denied"),
            DeviceErrorKind::NotFound => write!(f, "not found"),
            DeviceErrorKind::Busy => write!(f, "busy"),
        }
    }
}

#[derive(Error, Debug)]
pub enum VoxliveError {
    // Configuration errors
    #[error("Configuration file not found at {path}")]
    ConfigFileNotFound { path: String },

    #[error("Failed to parse configuration: {message}")]
    ConfigParse { message: String },

    #[error("Invalid configuration value for {key}: {message}")]
    ConfigInvalidValue { key: String, message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    // Transport errors
    #[error("Connection failed: {message}")]
    Connection { message: String },

    #[error("Not connected to a live session")]
    NotConnected,

    #[error("Send failed: {message}")]
    Send { message: String },

    // Audio device errors
    #[error("Audio device {kind}: {message}")]
    Device {
        kind: DeviceErrorKind,
        message: String,
    },

    // Recording state errors
    #[error("Already recording")]
    AlreadyRecording,

    #[error("Not recording")]
    NotRecording,

    // Payload errors
    #[error("Audio decode failed: {message}")]
    Decode { message: String },

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Remote error: {message}")]
    Remote { message: String },

    // General I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Generic error for cases not covered above
    #[error("{0}")]
    Other(String),
}

/// Coarse classification of an error, used by observers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Config,
    Connection,
    Device(DeviceErrorKind),
    State,
    Send,
    Decode,
    Protocol,
    Remote,
    Other,
}

impl VoxliveError {
    pub fn device(kind: DeviceErrorKind, message: impl Into<String>) -> Self {
        VoxliveError::Device {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            VoxliveError::ConfigFileNotFound { .. }
            | VoxliveError::ConfigParse { .. }
            | VoxliveError::ConfigInvalidValue { .. }
            | VoxliveError::Config(_) => ErrorKind::Config,
            VoxliveError::Connection { .. } => ErrorKind::Connection,
            VoxliveError::Device { kind, .. } => ErrorKind::Device(*kind),
            VoxliveError::NotConnected
            | VoxliveError::AlreadyRecording
            | VoxliveError::NotRecording => ErrorKind::State,
            VoxliveError::Send { .. } => ErrorKind::Send,
            VoxliveError::Decode { .. } => ErrorKind::Decode,
            VoxliveError::Protocol { .. } => ErrorKind::Protocol,
            VoxliveError::Remote { .. } => ErrorKind::Remote,
            VoxliveError::Io(_) | VoxliveError::Other(_) => ErrorKind::Other,
        }
    }

    /// Whether the session can carry on after this error.
    ///
    /// Connection errors feed the reconnect policy; send, decode and
    /// protocol errors only cost a single frame or envelope.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self.kind(),
            ErrorKind::Connection | ErrorKind::Send | ErrorKind::Decode | ErrorKind::Protocol
        )
    }

    /// Message for display, including remediation for device errors.
    pub fn user_message(&self) -> String {
        match self {
            VoxliveError::Device { kind, .. } => format!("{}. {}", self, kind.remediation()),
            other => other.to_string(),
        }
    }
}

/// Snapshot of the most recent surfaced error.
///
/// Held by the session's `last_error` observable so UI code never has to
/// hold on to the error value itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastError {
    pub kind: ErrorKind,
    pub message: String,
}

impl From<&VoxliveError> for LastError {
    fn from(error: &VoxliveError) -> Self {
        Self {
            kind: error.kind(),
            message: error.user_message(),
        }
    }
}

impl fmt::Display for LastError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.message)
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, VoxliveError>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn test_config_invalid_value_display() {
        let error = VoxliveError::ConfigInvalidValue {
            key: "session.endpoint".to_string(),
            message: "must start with ws:// or wss://".to_string(),
        };
        assert_eq!(
            error.to_string(),
            "Invalid configuration value for session.endpoint: must start with ws:// or wss://"
        );
    }

    #[test]
    fn test_connection_display() {
        let error = VoxliveError::Connection {
            message: "connection refused".to_string(),
        };
        assert_eq!(error.to_string(), "Connection failed: connection refused");
    }

    #[test]
    fn test_device_display_names_the_kind() {
        let error = VoxliveError::device(DeviceErrorKind::Busy, "hw:0 in use");
        assert_eq!(error.to_string(), "Audio device busy: hw:0 in use");

        let error = VoxliveError::device(DeviceErrorKind::PermissionDenied, "mic");
        assert_eq!(error.to_string(), "Audio device permission denied: mic");
    }

    #[test]
    fn test_device_user_message_includes_remediation() {
        for kind in [
            DeviceErrorKind::PermissionDenied,
            DeviceErrorKind::NotFound,
            DeviceErrorKind::Busy,
        ] {
            let error = VoxliveError::device(kind, "default");
            let message = error.user_message();
            assert!(message.starts_with(&error.to_string()));
            assert!(message.ends_with(kind.remediation()));
        }
    }

    #[test]
    fn test_remediation_differs_per_kind() {
        let permission = DeviceErrorKind::PermissionDenied.remediation();
        let not_found = DeviceErrorKind::NotFound.remediation();
        let busy = DeviceErrorKind::Busy.remediation();
        assert_ne!(permission, not_found);
        assert_ne!(not_found, busy);
        assert_ne!(permission, busy);
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(
            VoxliveError::Connection {
                message: "reset".into()
            }
            .is_recoverable()
        );
        assert!(
            VoxliveError::Send {
                message: "closed".into()
            }
            .is_recoverable()
        );
        assert!(
            VoxliveError::Decode {
                message: "odd".into()
            }
            .is_recoverable()
        );
        assert!(
            VoxliveError::Protocol {
                message: "bad".into()
            }
            .is_recoverable()
        );
        assert!(!VoxliveError::device(DeviceErrorKind::NotFound, "x").is_recoverable());
        assert!(!VoxliveError::AlreadyRecording.is_recoverable());
    }

    #[test]
    fn test_kind_mapping() {
        assert_eq!(
            VoxliveError::device(DeviceErrorKind::Busy, "x").kind(),
            ErrorKind::Device(DeviceErrorKind::Busy)
        );
        assert_eq!(VoxliveError::NotConnected.kind(), ErrorKind::State);
        assert_eq!(VoxliveError::NotRecording.kind(), ErrorKind::State);
        assert_eq!(
            VoxliveError::Remote {
                message: "x".into()
            }
            .kind(),
            ErrorKind::Remote
        );
    }

    #[test]
    fn test_last_error_from_device_error() {
        let error = VoxliveError::device(DeviceErrorKind::NotFound, "USB mic");
        let last = LastError::from(&error);
        assert_eq!(last.kind, ErrorKind::Device(DeviceErrorKind::NotFound));
        assert!(last.message.contains("USB mic"));
        assert!(last.message.contains("voxlive devices"));
        assert_eq!(last.to_string(), last.message);
    }

    #[test]
    fn test_io_error_conversion() {
        let io_error = io::Error::new(io::ErrorKind::NotFound, "file not found");
        let error: VoxliveError = io_error.into();
        assert!(matches!(error, VoxliveError::Io(_)));
        assert_eq!(error.kind(), ErrorKind::Other);
    }

    #[test]
    fn test_result_type_alias() {
        fn failing() -> Result<()> {
            Err(VoxliveError::NotRecording)
        }
        assert!(failing().is_err());
    }
}
