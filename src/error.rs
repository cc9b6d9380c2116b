use thiserror::Error;

/// Errors raised while talking to the completion service or handling a session event.
#[derive(Debug, Error)]
pub enum CoachError {
    #[error("no completion API key configured (set OPENAI_API_KEY)")]
    MissingApiKey,

    #[error("request to completion service failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("completion service returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("completion stream failed: {0}")]
    Stream(String),

    #[error("malformed response from completion service: {0}")]
    MalformedResponse(String),

    #[error("invalid selection: {0}")]
    InvalidSelection(String),

    #[error("malformed client event: {0}")]
    MalformedEvent(String),
}

impl CoachError {
    /// True for failures raised by the remote service rather than local input.
    pub fn is_remote(&self) -> bool {
        !matches!(
            self,
            Self::MissingApiKey | Self::InvalidSelection(_) | Self::MalformedEvent(_)
        )
    }
}

pub type CoachResult<T> = std::result::Result<T, CoachError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_classification() {
        assert!(CoachError::Stream("reset".into()).is_remote());
        assert!(CoachError::Api { status: 429, message: "slow down".into() }.is_remote());
        assert!(!CoachError::MissingApiKey.is_remote());
        assert!(!CoachError::InvalidSelection("Pilates".into()).is_remote());
        assert!(!CoachError::MalformedEvent("expected value".into()).is_remote());
    }

    #[test]
    fn test_api_error_display() {
        let err = CoachError::Api { status: 401, message: "Incorrect API key provided".into() };
        assert_eq!(
            err.to_string(),
            "completion service returned 401: Incorrect API key provided"
        );
    }
}
