//! Classification of backend error codes.
//!
//! Every `errorCode` lands in exactly one class. Codes outside both fixed sets are
//! kept verbatim as [`ErrorCode::Unrecognized`] and treated as non-retryable: an
//! untrusted backend emitting codes we have never seen is not evidence that a
//! retry would help, and retrying blindly could loop on a permanent failure.

use std::fmt;

/// Retry class of an error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorClass {
    Retryable,
    Terminal,
    Unknown,
}

impl ErrorClass {
    pub fn should_retry(&self) -> bool {
        matches!(self, Self::Retryable)
    }
}

/// Backend error codes, as a closed set with an explicit fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    // -- transient --
    Unavailable,
    ResourceExhausted,
    DeadlineExceeded,
    Aborted,
    // -- permanent --
    InvalidArgument,
    PermissionDenied,
    Unauthenticated,
    NotFound,
    FailedPrecondition,
    Unimplemented,
    Safety,
    MaxTokens,
    // -- anything else --
    Unrecognized(String),
}

impl ErrorCode {
    pub const RETRYABLE: [ErrorCode; 4] = [
        Self::Unavailable,
        Self::ResourceExhausted,
        Self::DeadlineExceeded,
        Self::Aborted,
    ];

    pub const TERMINAL: [ErrorCode; 8] = [
        Self::InvalidArgument,
        Self::PermissionDenied,
        Self::Unauthenticated,
        Self::NotFound,
        Self::FailedPrecondition,
        Self::Unimplemented,
        Self::Safety,
        Self::MaxTokens,
    ];

    pub fn parse(code: &str) -> Self {
        match code.trim().to_ascii_uppercase().as_str() {
            "UNAVAILABLE" => Self::Unavailable,
            "RESOURCE_EXHAUSTED" => Self::ResourceExhausted,
            "DEADLINE_EXCEEDED" => Self::DeadlineExceeded,
            "ABORTED" => Self::Aborted,
            "INVALID_ARGUMENT" => Self::InvalidArgument,
            "PERMISSION_DENIED" => Self::PermissionDenied,
            "UNAUTHENTICATED" => Self::Unauthenticated,
            "NOT_FOUND" => Self::NotFound,
            "FAILED_PRECONDITION" => Self::FailedPrecondition,
            "UNIMPLEMENTED" => Self::Unimplemented,
            "SAFETY" => Self::Safety,
            "MAX_TOKENS" => Self::MaxTokens,
            _ => Self::Unrecognized(code.to_string()),
        }
    }

    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Unavailable | Self::ResourceExhausted | Self::DeadlineExceeded | Self::Aborted => {
                ErrorClass::Retryable
            }
            Self::InvalidArgument
            | Self::PermissionDenied
            | Self::Unauthenticated
            | Self::NotFound
            | Self::FailedPrecondition
            | Self::Unimplemented
            | Self::Safety
            | Self::MaxTokens => ErrorClass::Terminal,
            Self::Unrecognized(_) => ErrorClass::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Unavailable => "UNAVAILABLE",
            Self::ResourceExhausted => "RESOURCE_EXHAUSTED",
            Self::DeadlineExceeded => "DEADLINE_EXCEEDED",
            Self::Aborted => "ABORTED",
            Self::InvalidArgument => "INVALID_ARGUMENT",
            Self::PermissionDenied => "PERMISSION_DENIED",
            Self::Unauthenticated => "UNAUTHENTICATED",
            Self::NotFound => "NOT_FOUND",
            Self::FailedPrecondition => "FAILED_PRECONDITION",
            Self::Unimplemented => "UNIMPLEMENTED",
            Self::Safety => "SAFETY",
            Self::MaxTokens => "MAX_TOKENS",
            Self::Unrecognized(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An `errorCode` carried by a raw event.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("agent error {code}{}", .message.as_deref().map(|m| format!(": {m}")).unwrap_or_default())]
pub struct ProtocolError {
    pub code: ErrorCode,
    /// Backend-supplied text; logged, never shown to operators.
    pub message: Option<String>,
    pub invocation_id: Option<String>,
}

impl ProtocolError {
    pub fn class(&self) -> ErrorClass {
        self.code.class()
    }

    /// Operator-facing description of the failure.
    pub fn user_message(&self) -> &'static str {
        match self.code {
            ErrorCode::Unavailable | ErrorCode::Aborted => {
                "The analysis service is temporarily unavailable."
            }
            ErrorCode::ResourceExhausted => "The analysis service is over capacity right now.",
            ErrorCode::DeadlineExceeded => "The analysis took too long to respond.",
            ErrorCode::InvalidArgument | ErrorCode::FailedPrecondition => {
                "The request could not be processed as asked."
            }
            ErrorCode::PermissionDenied | ErrorCode::Unauthenticated => {
                "This console is not authorized for that request."
            }
            ErrorCode::NotFound => "The requested briefing session no longer exists.",
            ErrorCode::Unimplemented => "That request is not supported by the analysis service.",
            ErrorCode::Safety => "The response was withheld by a content safety filter.",
            ErrorCode::MaxTokens => "The response was too long and was cut off.",
            ErrorCode::Unrecognized(_) => "The analysis service reported an unexpected error.",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_classification_is_total() {
        for code in ErrorCode::RETRYABLE {
            assert_eq!(code.class(), ErrorClass::Retryable, "{code}");
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
        for code in ErrorCode::TERMINAL {
            assert_eq!(code.class(), ErrorClass::Terminal, "{code}");
            assert_eq!(ErrorCode::parse(code.as_str()), code);
        }
        let odd = ErrorCode::parse("SOLAR_FLARE");
        assert_eq!(odd.class(), ErrorClass::Unknown);
        assert_eq!(odd.as_str(), "SOLAR_FLARE");
        assert!(!odd.class().should_retry());
    }

    #[test]
    fn test_parse_is_case_insensitive() {
        assert_eq!(ErrorCode::parse(" unavailable "), ErrorCode::Unavailable);
    }

    #[test]
    fn test_display() {
        let err = ProtocolError {
            code: ErrorCode::Unavailable,
            message: Some("backend overloaded".to_string()),
            invocation_id: None,
        };
        assert_eq!(err.to_string(), "agent error UNAVAILABLE: backend overloaded");
        assert!(!err.user_message().contains("overloaded"));
    }
}
