use thiserror::Error;

/// Errors surfaced to callers of the position service
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("only active subscribers can set options (caller: {0})")]
    NotSubscribed(String),

    #[error("position service is no longer running")]
    ServiceStopped,
}

pub type Result<T> = std::result::Result<T, ProviderError>;

/// Failures of the online geolocation service. Never shown to subscribers,
/// the engine falls back to offline triangulation instead.
#[derive(Debug, Error)]
pub enum OnlineError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("service returned HTTP {0}")]
    Status(u16),

    #[error("no location found for the submitted query")]
    NotFound,

    #[error("malformed response: {0}")]
    Malformed(String),
}
