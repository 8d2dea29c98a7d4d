use thiserror::Error;

use crate::auth::token_verifier::AuthError;
use crate::detection::domain::inference_error::InferenceError;

/// Per-event failures surfaced to clients as `error_message`.
///
/// Only `Authentication` (and `ServiceUnavailable` at connect) end a
/// connection; every other variant is scoped to the event that caused it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StreamError {
    #[error("{0}")]
    Authentication(String),

    #[error("{0}")]
    Validation(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("{message}")]
    RateLimited { message: String, recommended: u32 },

    #[error("{0}")]
    QuotaExceeded(String),

    #[error("{0}")]
    Processing(String),

    #[error("{0}")]
    ServiceUnavailable(String),
}

impl StreamError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// HTTP-style status code carried in `error_message.code`.
    pub fn code(&self) -> u16 {
        match self {
            Self::Authentication(_) => 401,
            Self::Validation(_) => 400,
            Self::PayloadTooLarge(_) => 413,
            Self::RateLimited { .. } => 429,
            Self::QuotaExceeded(_) => 403,
            Self::Processing(_) => 500,
            Self::ServiceUnavailable(_) => 503,
        }
    }

    pub fn recommended_value(&self) -> Option<u32> {
        match self {
            Self::RateLimited { recommended, .. } => Some(*recommended),
            _ => None,
        }
    }
}

impl From<InferenceError> for StreamError {
    fn from(err: InferenceError) -> Self {
        match err {
            InferenceError::Unavailable(_) => Self::ServiceUnavailable(err.to_string()),
            InferenceError::Failed(_) => Self::Processing(err.to_string()),
        }
    }
}

impl From<AuthError> for StreamError {
    fn from(err: AuthError) -> Self {
        Self::Authentication(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(StreamError::Authentication("x".into()), 401)]
    #[case(StreamError::validation("x"), 400)]
    #[case(StreamError::PayloadTooLarge("x".into()), 413)]
    #[case(StreamError::RateLimited { message: "x".into(), recommended: 3 }, 429)]
    #[case(StreamError::QuotaExceeded("x".into()), 403)]
    #[case(StreamError::Processing("x".into()), 500)]
    #[case(StreamError::ServiceUnavailable("x".into()), 503)]
    fn test_codes(#[case] err: StreamError, #[case] code: u16) {
        assert_eq!(err.code(), code);
    }

    #[test]
    fn test_only_rate_limit_carries_recommendation() {
        let limited = StreamError::RateLimited {
            message: "slow down".into(),
            recommended: 4,
        };
        assert_eq!(limited.recommended_value(), Some(4));
        assert_eq!(limited.to_string(), "slow down");
        assert_eq!(StreamError::validation("bad").recommended_value(), None);
    }

    #[test]
    fn test_inference_errors_map_to_503_and_500() {
        let unavailable: StreamError = InferenceError::Unavailable("gone".into()).into();
        let failed: StreamError = InferenceError::Failed("boom".into()).into();
        assert_eq!(unavailable.code(), 503);
        assert_eq!(failed.code(), 500);
        assert!(failed.to_string().contains("boom"));
    }

    #[test]
    fn test_auth_error_maps_to_401() {
        let err: StreamError = AuthError::InvalidToken.into();
        assert_eq!(err.code(), 401);
    }
}
