use std::time::Duration;

use thiserror::Error;

use crate::models::TurnStatus;

/// Every failure the chat client can report.
/// Fragment-level problems never reach the caller; they are logged and skipped.
#[derive(Debug, Error)]
pub enum ChatError {
    // ── Validation errors ────────────────────────────────────────────────────
    #[error("A prompt or at least one attachment is required")]
    EmptyPrompt,

    #[error("Another chat turn is still in progress")]
    TurnInProgress,

    #[error("Invalid turn transition from {from:?} to {to:?}")]
    InvalidTransition { from: TurnStatus, to: TurnStatus },

    // ── Stream errors ────────────────────────────────────────────────────────
    #[error("Malformed stream fragment: {line}")]
    MalformedStreamFragment { line: String },

    #[error("Streaming endpoint rejected the request with status {status}")]
    StreamOpenFailure { status: u16, message: Option<String> },

    #[error("Streaming endpoint did not respond within {after:?}")]
    StreamOpenTimeout { after: Duration },

    #[error("Stream interrupted: {reason}")]
    StreamInterrupted { reason: String },

    // ── Fallback errors ──────────────────────────────────────────────────────
    #[error("Failed to send message (status {status}): {message}")]
    FallbackFailure { status: u16, message: String },

    // ── Transport errors ─────────────────────────────────────────────────────
    #[error("Network unavailable: {0}")]
    NetworkUnavailable(#[source] reqwest::Error),

    #[error("Request to {endpoint} failed with status {status}")]
    RequestFailed { endpoint: String, status: u16 },

    #[error("Failed to decode response from {endpoint}: {message}")]
    Decode { endpoint: String, message: String },
}

impl ChatError {
    pub fn interrupted(reason: impl Into<String>) -> Self {
        ChatError::StreamInterrupted { reason: reason.into() }
    }

    pub fn decode(endpoint: impl Into<String>, message: impl ToString) -> Self {
        ChatError::Decode { endpoint: endpoint.into(), message: message.to_string() }
    }

    /// Failures the user can resolve by sending the same turn again.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ChatError::FallbackFailure { .. }
                | ChatError::NetworkUnavailable(_)
                | ChatError::StreamInterrupted { .. }
                | ChatError::RequestFailed { .. }
        )
    }

    pub fn is_validation(&self) -> bool {
        matches!(self, ChatError::EmptyPrompt | ChatError::TurnInProgress)
    }

    pub fn is_stream_open_failure(&self) -> bool {
        matches!(
            self,
            ChatError::StreamOpenFailure { .. }
                | ChatError::StreamOpenTimeout { .. }
                | ChatError::NetworkUnavailable(_)
        )
    }
}
