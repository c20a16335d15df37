use std::time::Duration;

use crate::agent::ContextScope;

/// Failure reported by a reply generator.
/// Classified so a failed message can carry a stable error kind.
#[derive(Clone, Debug, thiserror::Error)]
pub enum GenerationError {
    // Caller-side
    #[error("authentication failed: {0}")]
    AuthenticationFailed(String),
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    // Provider-side, may clear up on a later attempt
    #[error("rate limited")]
    RateLimited { retry_after: Option<Duration> },
    #[error("server error {status}: {body}")]
    ServerError { status: u16, body: String },
    #[error("provider overloaded")]
    ProviderOverloaded,
    #[error("network error: {0}")]
    NetworkError(String),

    #[error("malformed response: {0}")]
    MalformedResponse(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
}

impl GenerationError {
    /// Whether a user-triggered retry has a reasonable chance of succeeding.
    /// The engine itself never retries.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited { .. }
                | Self::ServerError { .. }
                | Self::ProviderOverloaded
                | Self::NetworkError(_)
                | Self::Timeout(_)
        )
    }

    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            401 | 403 => Self::AuthenticationFailed(body),
            400 | 404 | 422 => Self::InvalidRequest(body),
            429 => Self::RateLimited { retry_after: None },
            529 => Self::ProviderOverloaded,
            _ => Self::ServerError { status, body },
        }
    }

    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::AuthenticationFailed(_) => "authentication_failed",
            Self::InvalidRequest(_) => "invalid_request",
            Self::RateLimited { .. } => "rate_limited",
            Self::ServerError { .. } => "server_error",
            Self::ProviderOverloaded => "provider_overloaded",
            Self::NetworkError(_) => "network_error",
            Self::MalformedResponse(_) => "malformed_response",
            Self::Timeout(_) => "timeout",
        }
    }
}

/// Failure reported by a scoped context loader.
#[derive(Clone, Debug, thiserror::Error)]
pub enum ContextError {
    #[error("no loader registered for scope {0}")]
    NoLoader(ContextScope),
    #[error("loading {scope} failed: {detail}")]
    LoadFailed { scope: ContextScope, detail: String },
}
