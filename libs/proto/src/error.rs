//! Error taxonomy.
//!
//! Every error the agent surfaces to a caller maps to exactly one
//! [`ErrorKind`], so cross-process callers branch on the kind rather than on
//! message text.

use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Closed set of error kinds carried in `ActionResponse.error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// The requested action is not defined in the registry.
    NotDefined,
    /// The action exists but the requested mode is not supported.
    NotImplemented,
    /// The request is malformed.
    BadRequest,
    /// A previous non-blocking call of the same action is still running.
    InProgress,
    /// The agent is at its concurrency limit.
    Busy,
    /// The call exceeded its deadline.
    TimedOut,
    /// The action ran and reported failure.
    Failed,
    /// The agent could not carry out the call.
    InternalError,
    /// Anything else, including kinds this version does not know.
    #[serde(other)]
    Unknown,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::NotDefined => "notDefined",
            ErrorKind::NotImplemented => "notImplemented",
            ErrorKind::BadRequest => "badRequest",
            ErrorKind::InProgress => "inProgress",
            ErrorKind::Busy => "busy",
            ErrorKind::TimedOut => "timedOut",
            ErrorKind::Failed => "failed",
            ErrorKind::InternalError => "internalError",
            ErrorKind::Unknown => "unknown",
        }
    }

    /// Parses a wire string; unrecognised values map to [`ErrorKind::Unknown`].
    pub fn parse(s: &str) -> Self {
        match s {
            "notDefined" => ErrorKind::NotDefined,
            "notImplemented" => ErrorKind::NotImplemented,
            "badRequest" => ErrorKind::BadRequest,
            "inProgress" => ErrorKind::InProgress,
            "busy" => ErrorKind::Busy,
            "timedOut" => ErrorKind::TimedOut,
            "failed" => ErrorKind::Failed,
            "internalError" => ErrorKind::InternalError,
            _ => ErrorKind::Unknown,
        }
    }

    /// Whether a dispatcher retry policy applies to this kind.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, ErrorKind::NotDefined | ErrorKind::BadRequest)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error with its taxonomy kind and a best-effort diagnostic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ActionError {
    pub kind: ErrorKind,
    pub message: String,
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.message.is_empty() {
            write!(f, "{}", self.kind)
        } else {
            write!(f, "{}: {}", self.kind, self.message)
        }
    }
}

impl std::error::Error for ActionError {}

impl ActionError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_defined(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotDefined, message)
    }

    pub fn not_implemented(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotImplemented, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::BadRequest, message)
    }

    pub fn in_progress(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InProgress, message)
    }

    pub fn busy(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Busy, message)
    }

    pub fn timed_out() -> Self {
        Self::new(ErrorKind::TimedOut, "")
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Failed, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InternalError, message)
    }

    /// Appends context to the diagnostic while keeping the kind.
    pub fn context(mut self, context: impl fmt::Display) -> Self {
        self.message = if self.message.is_empty() {
            context.to_string()
        } else {
            format!("{}, {}", self.message, context)
        };
        self
    }

    pub fn is_retryable(&self) -> bool {
        self.kind.is_retryable()
    }
}

/// Errors raised while decoding or validating protocol definitions.
#[derive(Debug, Error)]
pub enum ProtoError {
    /// An environment payload is not valid JSON for its type.
    #[error("failed to decode {name}: {source}")]
    Decode {
        name: String,
        #[source]
        source: serde_json::Error,
    },

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// An action definition violates its invariants.
    #[error("invalid action {name}: {reason}")]
    InvalidAction { name: String, reason: String },

    /// Two actions share a name.
    #[error("duplicate action: {0}")]
    DuplicateAction(String),

    /// A probe references an action that is not defined.
    #[error("probe {probe} references undefined action {action}")]
    UndefinedProbeAction { probe: String, action: String },
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(ErrorKind::NotDefined, "\"notDefined\"")]
    #[case(ErrorKind::TimedOut, "\"timedOut\"")]
    #[case(ErrorKind::InternalError, "\"internalError\"")]
    fn test_error_kind_serialization(#[case] kind: ErrorKind, #[case] json: &str) {
        assert_eq!(serde_json::to_string(&kind).unwrap(), json);
        assert_eq!(serde_json::from_str::<ErrorKind>(json).unwrap(), kind);
        assert_eq!(ErrorKind::parse(kind.as_str()), kind);
    }

    #[test]
    fn test_unrecognised_kind_is_unknown() {
        let kind: ErrorKind = serde_json::from_str("\"preconditionFailed\"").unwrap();
        assert_eq!(kind, ErrorKind::Unknown);
        assert_eq!(ErrorKind::parse("whatever"), ErrorKind::Unknown);
    }

    #[test]
    fn test_retryable_kinds() {
        assert!(!ErrorKind::NotDefined.is_retryable());
        assert!(!ErrorKind::BadRequest.is_retryable());
        assert!(ErrorKind::Failed.is_retryable());
        assert!(ErrorKind::TimedOut.is_retryable());
    }

    #[test]
    fn test_action_error_display() {
        assert_eq!(ActionError::timed_out().to_string(), "timedOut");
        let err = ActionError::failed("exit code: 1").context("stderr: boom");
        assert_eq!(err.to_string(), "failed: exit code: 1, stderr: boom");
    }
}
