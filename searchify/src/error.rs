//! Top-level error taxonomy for the streaming gateway.
//!
//! Everything in here is raised *before* the first chunk is written and maps to
//! an HTTP status. Mid-stream failures never surface as `GatewayError`: they
//! are folded into the terminal chunk by the stream session.

use thiserror::Error;

use crate::access::AccessError;
use crate::config::ConfigError;
use crate::streaming::GenerationError;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("API key must be sent in the Authorization header, found it in the {0}")]
    CredentialsOutsideHeader(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    #[error("Rate limit exceeded")]
    RateLimited,

    #[error("Internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) | GatewayError::CredentialsOutsideHeader(_) => 400,
            GatewayError::Unauthorized(_) => 401,
            GatewayError::Forbidden(_) => 403,
            GatewayError::InstanceNotFound(_) => 404,
            GatewayError::RateLimited => 429,
            GatewayError::Internal(_) | GatewayError::Config(_) => 500,
        }
    }

    /// Stable machine-readable code carried in the JSON error body.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::BadRequest(_) => "ERR_BAD_REQUEST",
            GatewayError::CredentialsOutsideHeader(_) => "ERR_KEY_NOT_IN_HEADER",
            GatewayError::Unauthorized(_) => "ERR_UNAUTHORIZED",
            GatewayError::Forbidden(_) => "ERR_FORBIDDEN",
            GatewayError::InstanceNotFound(_) => "ERR_INSTANCE_NOT_FOUND",
            GatewayError::RateLimited => "ERR_RATE_LIMITED",
            GatewayError::Internal(_) => "ERR_INTERNAL",
            GatewayError::Config(_) => "ERR_CONFIG",
        }
    }
}

impl From<AccessError> for GatewayError {
    fn from(e: AccessError) -> Self {
        match e {
            AccessError::InvalidKey => GatewayError::Unauthorized(e.to_string()),
            AccessError::Forbidden(_) => GatewayError::Forbidden(e.to_string()),
            AccessError::UnknownInstance(_) => GatewayError::InstanceNotFound(e.to_string()),
        }
    }
}

impl From<GenerationError> for GatewayError {
    fn from(e: GenerationError) -> Self {
        GatewayError::Internal(e.to_string())
    }
}
