//! Registry error types

use thiserror::Error;

/// Registry-related errors
#[derive(Debug, Error)]
pub enum RegistryError {
    /// Authentication failed
    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    /// The registry demanded a one-time password that was not supplied
    #[error("This operation requires a one-time password")]
    OtpRequired,

    /// The registry refused the supplied one-time password
    #[error("The one-time password was rejected by the registry")]
    OtpRejected,

    /// API error from registry
    #[error("API error: {status} - {message}")]
    ApiError { status: u16, message: String },

    /// Invalid package tarball
    #[error("Invalid artifact: {0}")]
    InvalidArtifact(String),

    /// Registry URL could not be parsed or joined
    #[error("Invalid registry URL '{url}': {reason}")]
    InvalidUrl { url: String, reason: String },

    /// Interactive prompt failed or is unavailable
    #[error("Prompt failed: {0}")]
    Prompt(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RegistryError {
    /// Whether this error is a one-time password challenge or rejection
    pub fn is_otp_challenge(&self) -> bool {
        matches!(self, Self::OtpRequired | Self::OtpRejected)
    }

    /// HTTP status attached to the error, if any
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::ApiError { status, .. } => Some(*status),
            Self::Http(e) => e.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

/// Result type for registry operations
pub type Result<T> = std::result::Result<T, RegistryError>;

/// Errors raised while verifying publish permissions
#[derive(Debug, Error)]
pub enum AccessError {
    /// One or more packages are not writable by the authenticated user
    #[error(
        "You do not have write permission required to publish {}",
        .packages.iter().map(|p| format!("\"{p}\"")).collect::<Vec<_>>().join(", ")
    )]
    Denied {
        /// Authenticated user the check ran for
        username: String,
        /// Every package the user cannot publish
        packages: Vec<String>,
    },

    /// The permission listing could not be fetched
    #[error("Unable to verify package access: {0}")]
    Lookup(#[source] RegistryError),
}
