//! Gateway error taxonomy
//!
//! Every error the gateway can surface to a client maps onto one of the
//! Anthropic-shaped error types below; `error_type()` is the wire string.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("cannot reach {url}: {message}")]
    Connection { url: String, message: String },

    #[error("upstream returned {status}: {message}")]
    Api { status: u16, message: String },

    #[error("rate limited after {attempts} attempts: {message}")]
    RateLimit { attempts: u32, message: String },

    #[error("model not available: {message}")]
    ModelNotFound { message: String },

    #[error("model {model} cannot satisfy the request: {message}")]
    Capability { model: String, message: String },

    #[error("{env} is not set. Get a key at {hint} and export it.")]
    MissingCredential { env: String, hint: String },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Internal(String),
}

impl GatewayError {
    /// The Anthropic wire `error.type` string for this error.
    pub fn error_type(&self) -> &'static str {
        match self {
            GatewayError::Connection { .. } => "connection_error",
            GatewayError::Api { .. } => "api_error",
            GatewayError::RateLimit { .. } => "rate_limit_error",
            GatewayError::ModelNotFound { .. } => "model_not_found",
            GatewayError::Capability { .. } => "capability_error",
            GatewayError::MissingCredential { .. } => "api_error",
            GatewayError::Json(_) | GatewayError::Internal(_) => "server_error",
        }
    }

    /// HTTP status the proxy answers with when this error aborts a request
    /// before streaming starts.
    pub fn http_status(&self) -> u16 {
        match self {
            GatewayError::Connection { .. } => 502,
            GatewayError::Api { status, .. } => *status,
            GatewayError::RateLimit { .. } => 429,
            GatewayError::ModelNotFound { .. } => 404,
            GatewayError::Capability { .. } => 400,
            GatewayError::MissingCredential { .. } => 500,
            GatewayError::Json(_) | GatewayError::Internal(_) => 500,
        }
    }
}
