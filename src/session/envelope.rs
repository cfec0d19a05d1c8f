//! Wire envelopes exchanged over a live session.
//!
//! Every message is a JSON object with a `type` discriminator.

use crate::audio::codec::AudioFormat;
use crate::defaults::CONTEXT_TOP_VIOLATIONS;
use crate::error::{Result, VoxliveError};
use serde::{Deserialize, Serialize};

/// A discriminated message exchanged over the session channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Envelope {
    /// One encoded audio frame, optionally closing the user's turn.
    #[serde(rename = "audio")]
    AudioChunk {
        data: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        format: Option<String>,
        #[serde(default)]
        turn_complete: bool,
    },
    /// Standalone end-of-turn signal, sent when no chunk carried the flag.
    TurnComplete,
    /// Summary of prior context, sent once after connecting.
    #[serde(rename = "context")]
    ContextPrimer { audit_result: ContextSummary },
    #[serde(rename = "status")]
    StatusNotice { message: String },
    /// Server-side diagnostics; never surfaced as an error.
    #[serde(rename = "log")]
    LogNotice { message: String },
    #[serde(rename = "error")]
    ErrorNotice { message: String },
}

impl Envelope {
    pub fn audio_chunk(data: String, format: &AudioFormat, turn_complete: bool) -> Self {
        Envelope::AudioChunk {
            data,
            format: Some(format.to_string()),
            turn_complete,
        }
    }

    /// Wire name of this envelope's type.
    pub fn kind(&self) -> &'static str {
        match self {
            Envelope::AudioChunk { .. } => "audio",
            Envelope::TurnComplete => "turn_complete",
            Envelope::ContextPrimer { .. } => "context",
            Envelope::StatusNotice { .. } => "status",
            Envelope::LogNotice { .. } => "log",
            Envelope::ErrorNotice { .. } => "error",
        }
    }

    /// Whether this envelope ends the user's turn.
    pub fn completes_turn(&self) -> bool {
        matches!(
            self,
            Envelope::TurnComplete
                | Envelope::AudioChunk {
                    turn_complete: true,
                    ..
                }
        )
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| VoxliveError::Protocol {
            message: format!("failed to serialize {} envelope: {}", self.kind(), e),
        })
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| VoxliveError::Protocol {
            message: format!("malformed envelope: {}", e),
        })
    }
}

/// One violation carried in a context primer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViolationSummary {
    pub severity: String,
    pub issue: String,
    #[serde(default)]
    pub rule_section: String,
}

/// Condensed prior context handed to the remote agent at session start.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSummary {
    pub score: f64,
    pub summary: String,
    pub violations_count: usize,
    #[serde(default)]
    pub top_violations: Vec<ViolationSummary>,
}

impl ContextSummary {
    /// Build a summary, keeping only the first few violations.
    pub fn new(score: f64, summary: impl Into<String>, violations: Vec<ViolationSummary>) -> Self {
        let violations_count = violations.len();
        Self {
            score,
            summary: summary.into(),
            violations_count,
            top_violations: violations
                .into_iter()
                .take(CONTEXT_TOP_VIOLATIONS)
                .collect(),
        }
    }

    /// Parse a summary from JSON, trimming the violation list.
    pub fn from_json(json: &str) -> Result<Self> {
        let mut summary: ContextSummary =
            serde_json::from_str(json).map_err(|e| VoxliveError::Protocol {
                message: format!("invalid context summary: {}", e),
            })?;
        summary.top_violations.truncate(CONTEXT_TOP_VIOLATIONS);
        Ok(summary)
    }

    pub fn into_envelope(self) -> Envelope {
        Envelope::ContextPrimer { audit_result: self }
    }
}
