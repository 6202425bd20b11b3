use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors of the trust and secret lifecycle subsystem.
///
/// The first eight variants are the externally visible taxonomy. They are
/// surfaced to the operator or the boot process verbatim and never swallowed.
#[derive(Error, Debug)]
pub enum TrustError {
    #[error("Operator key unavailable: {0}")]
    KeyUnavailable(String),

    #[error("Recipient not authorized to decrypt secret '{0}'")]
    RecipientNotAuthorized(String),

    #[error("Secret '{0}' failed integrity verification")]
    CorruptSecret(String),

    #[error("Trust anchor expired at {0}")]
    AnchorExpired(DateTime<Utc>),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Insufficient key shares: needed {needed}, retrieved {retrieved}")]
    InsufficientShares { needed: usize, retrieved: usize },

    #[error("Untrusted escrow endpoint '{endpoint}': {reason}")]
    UntrustedEndpoint { endpoint: String, reason: String },

    #[error("Trust anchor rotation in progress")]
    RotationInProgress,

    #[error("Vault locked by concurrent '{0}' operation")]
    VaultLocked(String),

    #[error("Concurrent modification of '{name}': expected version {expected}, found {found}")]
    Conflict {
        name: String,
        expected: u64,
        found: u64,
    },

    #[error("Share denied by escrow endpoint '{endpoint}': {reason}")]
    ShareDenied { endpoint: String, reason: String },

    #[error("Hardware attestation failed: {0}")]
    AttestationFailed(String),

    #[error("Escrow transport error: {0}")]
    Transport(String),

    #[error("Storage unlock failed: {0}")]
    Storage(String),

    #[error("Certificate error: {0}")]
    Certificate(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TrustError {
    pub fn invalid_request<S: Into<String>>(msg: S) -> Self {
        Self::InvalidRequest(msg.into())
    }

    pub fn certificate<S: Into<String>>(msg: S) -> Self {
        Self::Certificate(msg.into())
    }

    pub fn transport<S: Into<String>>(msg: S) -> Self {
        Self::Transport(msg.into())
    }

    pub fn internal<S: Into<String>>(msg: S) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the same operation after a delay.
    ///
    /// Only contention and transport failures qualify; every cryptographic or
    /// trust failure is terminal for the triggering operation.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::RotationInProgress
                | Self::VaultLocked(_)
                | Self::Conflict { .. }
                | Self::Transport(_)
        )
    }
}

/// Result type alias using TrustError
pub type TrustResult<T> = Result<T, TrustError>;

/// Convert TrustError to HTTP status codes for escrow API responses
impl TrustError {
    pub fn status_code(&self) -> axum::http::StatusCode {
        use axum::http::StatusCode;
        match self {
            Self::KeyUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::RecipientNotAuthorized(_) => StatusCode::FORBIDDEN,
            Self::CorruptSecret(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::AnchorExpired(_) => StatusCode::FORBIDDEN,
            Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::InsufficientShares { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::UntrustedEndpoint { .. } => StatusCode::UNAUTHORIZED,
            Self::RotationInProgress => StatusCode::CONFLICT,
            Self::VaultLocked(_) => StatusCode::CONFLICT,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::ShareDenied { .. } => StatusCode::FORBIDDEN,
            Self::AttestationFailed(_) => StatusCode::FORBIDDEN,
            Self::Transport(_) => StatusCode::BAD_GATEWAY,
            Self::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Certificate(_) => StatusCode::UNAUTHORIZED,
            Self::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Serialization(_) => StatusCode::BAD_REQUEST,
            Self::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl axum::response::IntoResponse for TrustError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let body = keyfleet_types::ErrorResponse {
            error: self.to_string(),
            code: status.as_u16(),
        };
        (status, axum::Json(body)).into_response()
    }
}
