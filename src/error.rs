use thiserror::Error;

/// Failures of a streamed completion request.
///
/// Every variant except [`GenerationError::Exhausted`] is transient: the client retries it
/// with linear backoff until the attempt ceiling is reached.
#[derive(Error, Debug)]
pub enum GenerationError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Request timed out after {secs}s")]
    Timeout { secs: u64 },

    #[error("Empty response: no content or reasoning text was streamed")]
    EmptyResponse,

    #[error("API error {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Stream reported an error: {0}")]
    Stream(String),

    #[error("All {attempts} attempts failed; last error: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<GenerationError>,
    },
}

impl GenerationError {
    /// Short machine-friendly label for reports.
    pub fn kind(&self) -> &'static str {
        match self {
            GenerationError::Network(_) => "network",
            GenerationError::Timeout { .. } => "timeout",
            GenerationError::EmptyResponse => "empty_response",
            GenerationError::Api { .. } => "api",
            GenerationError::Stream(_) => "stream",
            GenerationError::Exhausted { last, .. } => last.kind(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exhausted_reports_inner_kind() {
        let err = GenerationError::Exhausted {
            attempts: 3,
            last: Box::new(GenerationError::EmptyResponse),
        };
        assert_eq!(err.kind(), "empty_response");
        assert!(err.to_string().contains("All 3 attempts failed"));
    }
}
