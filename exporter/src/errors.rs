use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Credential persistence error: {0}")]
    Persist(String),

    #[error("Metrics registry error: {0}")]
    Prometheus(#[from] prometheus::Error),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Exposition encoding error: {0}")]
    Encoding(#[from] std::string::FromUtf8Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Failure to obtain a usable credential from the identity endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AuthError {
    /// Upstream 5xx, network failure or timeout. The stored credential is
    /// untouched and the next cycle tries again.
    #[error("transient authentication failure: {0}")]
    Transient(String),

    /// Rejected client credentials or a revoked refresh token. Needs a human
    /// to go through the consent page again.
    #[error("permanent authentication failure: {0}")]
    Permanent(String),
}

impl AuthError {
    pub fn is_permanent(&self) -> bool {
        matches!(self, AuthError::Permanent(_))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            AuthError::Transient(_) => "transient",
            AuthError::Permanent(_) => "permanent",
        }
    }
}

/// Failure to fetch the device list from the telemetry endpoint.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum FetchError {
    #[error("access token rejected by telemetry endpoint (HTTP {0})")]
    AuthRejected(u16),

    #[error("transient telemetry failure: {0}")]
    Transient(String),

    /// Malformed body. Only the current cycle is lost, the token stays valid.
    #[error("malformed telemetry response: {0}")]
    Permanent(String),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            FetchError::AuthRejected(_) => "auth_rejected",
            FetchError::Transient(_) => "transient",
            FetchError::Permanent(_) => "permanent",
        }
    }
}

/// A single device entry that could not be turned into samples.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MappingFailure {
    #[error("device #{index} has no usable `{field}`")]
    MissingIdentity { index: usize, field: &'static str },

    #[error("device #{index} is not a JSON object")]
    NotAnObject { index: usize },
}

/// Why a collection cycle was abandoned.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CycleError {
    #[error(transparent)]
    Auth(#[from] AuthError),

    #[error(transparent)]
    Fetch(#[from] FetchError),
}
