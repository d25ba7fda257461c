//! Error types for the senseloop domain.
//!
//! Uses `thiserror` for ergonomic error definitions.
//! Each bounded context has its own error enum.
//!
//! Backend errors never carry raw backend output in their `Display` text.
//! Where raw output is useful for diagnosis it lives in a `diagnostic` field
//! that is only logged to the internal diagnostics target.

use thiserror::Error;

/// Fixed text shown in place of any backend failure.
pub const RESPONSE_UNAVAILABLE: &str = "[response unavailable]";

// --- Bounded context errors ---

/// A watched source could not be read.
#[derive(Debug, Clone, Error)]
pub enum SourceError {
    #[error("Source unavailable: {0}")]
    Unavailable(String),

    #[error("Source query failed: {0}")]
    Query(String),

    #[error("Source I/O error: {0}")]
    Io(String),
}

/// A registered event handler failed to process a record.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    #[error("Handler failed: {0}")]
    Failed(String),

    #[error("Handler rejected record: {0}")]
    Rejected(String),
}

/// Failures of a single backend invocation.
#[derive(Debug, Clone, Error)]
pub enum InvocationError {
    #[error("Backend executable not found: {command}")]
    BackendNotFound { command: String },

    #[error("Failed to launch backend: {reason}")]
    LaunchFailed {
        reason: String,
        kind: std::io::ErrorKind,
    },

    #[error("Backend timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Backend exited with status {code:?} and no recognizable error body")]
    NonZeroExit {
        code: Option<i32>,
        message: String,
        diagnostic: String,
    },

    #[error("Backend output is not valid UTF-8")]
    InvalidUtf8,

    #[error("Prompt is too large for the backend context window")]
    PromptTooLong,

    #[error("Backend reported an error")]
    BackendReported { message: String, diagnostic: String },

    #[error("Backend response is malformed (exit status {exit_code:?})")]
    MalformedResponse {
        exit_code: Option<i32>,
        diagnostic: String,
    },

    #[error("Retry ceiling exceeded ({retry_count} of {ceiling} retries used)")]
    RetryCeilingExceeded { retry_count: u32, ceiling: u32 },

    /// The resume token was rejected and the run without it failed as well.
    /// The token must not be offered again.
    #[error("{cause} (resumed session was rejected)")]
    SessionRejected { cause: Box<InvocationError> },
}

impl InvocationError {
    /// Text that may be shown to an end user for this failure.
    ///
    /// Always a fixed placeholder: no variant exposes backend output.
    pub fn user_message(&self) -> &'static str {
        RESPONSE_UNAVAILABLE
    }

    /// Internal diagnostic text (raw backend output), if captured.
    pub fn diagnostic(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { diagnostic, .. }
            | Self::BackendReported { diagnostic, .. }
            | Self::MalformedResponse { diagnostic, .. } => Some(diagnostic),
            Self::SessionRejected { cause } => cause.diagnostic(),
            _ => None,
        }
    }

    /// Error text reported by the backend (stderr or the error document's
    /// message), without any answer text. Used to classify the failure.
    pub fn error_text(&self) -> Option<&str> {
        match self {
            Self::NonZeroExit { message, .. } | Self::BackendReported { message, .. } => {
                Some(message)
            }
            Self::SessionRejected { cause } => cause.error_text(),
            _ => None,
        }
    }

    /// True when the resume token passed to this call is no longer valid.
    pub fn session_rejected(&self) -> bool {
        matches!(self, Self::SessionRejected { .. })
    }

    /// The failure underneath any session-rejection wrapper.
    pub fn root(&self) -> &InvocationError {
        match self {
            Self::SessionRejected { cause } => cause.root(),
            other => other,
        }
    }
}

/// Failures of the local model tier.
#[derive(Debug, Clone, Error)]
pub enum LocalModelError {
    #[error("Local model server is not available")]
    Unavailable,

    #[error("Local model server unreachable: {0}")]
    Unreachable(String),

    #[error("Local model request timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("Local model not installed: {0}")]
    ModelNotInstalled(String),

    #[error("Local model server returned HTTP {status}")]
    Http { status: u16 },

    #[error("Local model response invalid: {0}")]
    InvalidResponse(String),
}

/// The deferred-request queue could not be written or read.
#[derive(Debug, Clone, Error)]
pub enum QueueError {
    #[error("Queue storage error: {0}")]
    Storage(String),

    #[error("Queue entry could not be serialized: {0}")]
    Serialization(String),
}

/// The session ledger could not be written or read.
#[derive(Debug, Clone, Error)]
pub enum LedgerError {
    #[error("Ledger storage error: {0}")]
    Storage(String),

    #[error("Ledger entry could not be serialized: {0}")]
    Serialization(String),
}

/// The session store could not be persisted or loaded.
#[derive(Debug, Clone, Error)]
pub enum SessionError {
    #[error("Session storage error: {0}")]
    Storage(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_error_display_hides_diagnostic() {
        let err = InvocationError::MalformedResponse {
            exit_code: Some(1),
            diagnostic: "secret internal trace".into(),
        };
        assert!(!err.to_string().contains("secret"));
        assert_eq!(err.diagnostic(), Some("secret internal trace"));
        assert_eq!(err.user_message(), RESPONSE_UNAVAILABLE);
    }

    #[test]
    fn rejected_session_keeps_the_underlying_failure() {
        let err = InvocationError::SessionRejected {
            cause: Box::new(InvocationError::NonZeroExit {
                code: Some(1),
                message: "503 overloaded".into(),
                diagnostic: "exit=Some(1) stderr=\"503 overloaded\"".into(),
            }),
        };
        assert!(err.session_rejected());
        assert!(matches!(err.root(), InvocationError::NonZeroExit { .. }));
        assert_eq!(err.error_text(), Some("503 overloaded"));
        assert!(err.diagnostic().is_some());
        assert!(!err.to_string().contains("overloaded"));
    }

    #[test]
    fn ceiling_error_names_both_counts() {
        let err = InvocationError::RetryCeilingExceeded {
            retry_count: 2,
            ceiling: 2,
        };
        let text = err.to_string();
        assert!(text.contains("2 of 2"));
    }
}
