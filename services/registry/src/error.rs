//! Error types for the registry

use http::StatusCode;
use store::{StoreError, StoreErrorKind};

/// Result type for registry operations
pub type RegistryResult<T> = Result<T, RegistryError>;

/// Error types for registry operations
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    /// Server or version not found
    #[error("server not found: {0}")]
    NotFound(String),

    /// The version was already published
    #[error("version already exists: {name}@{version}")]
    VersionExists {
        /// Server name
        name: String,
        /// Server version
        version: String,
    },

    /// Invalid server name
    #[error("invalid server name: {0}")]
    InvalidName(String),

    /// Invalid version
    #[error("invalid version for {0}")]
    InvalidVersion(String),

    /// Payload does not match the addressed record
    #[error("payload is for {actual}, expected {expected}")]
    KeyMismatch {
        /// The addressed `name@version`
        expected: String,
        /// The payload's `name@version`
        actual: String,
    },

    /// Invalid seed or configuration input
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Storage error
    #[error("storage error: {0}")]
    Storage(StoreError),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StoreError> for RegistryError {
    fn from(error: StoreError) -> Self {
        match error.kind() {
            StoreErrorKind::NotFound => {
                let key = match (error.name(), error.version()) {
                    (Some(name), Some(version)) => format!("{name}@{version}"),
                    (Some(name), None) => name.to_owned(),
                    _ => error.to_string(),
                };
                RegistryError::NotFound(key)
            }
            StoreErrorKind::AlreadyExists => match (error.name(), error.version()) {
                (Some(name), Some(version)) => RegistryError::VersionExists {
                    name: name.to_owned(),
                    version: version.to_owned(),
                },
                _ => RegistryError::Storage(error),
            },
            StoreErrorKind::Configuration => RegistryError::Configuration(error.to_string()),
            _ => RegistryError::Storage(error),
        }
    }
}

impl RegistryError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            RegistryError::NotFound(_) => StatusCode::NOT_FOUND,
            RegistryError::VersionExists { .. } => StatusCode::CONFLICT,
            RegistryError::InvalidName(_)
            | RegistryError::InvalidVersion(_)
            | RegistryError::KeyMismatch { .. }
            | RegistryError::InvalidInput(_) => StatusCode::BAD_REQUEST,
            RegistryError::Storage(error) if error.kind() == StoreErrorKind::AlreadyExists => {
                StatusCode::CONFLICT
            }
            RegistryError::Configuration(_)
            | RegistryError::Storage(_)
            | RegistryError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            RegistryError::NotFound(_) => "NOT_FOUND",
            RegistryError::VersionExists { .. } => "VERSION_EXISTS",
            RegistryError::InvalidName(_) => "NAME_INVALID",
            RegistryError::InvalidVersion(_) => "VERSION_INVALID",
            RegistryError::KeyMismatch { .. } => "KEY_MISMATCH",
            RegistryError::InvalidInput(_) => "INVALID",
            RegistryError::Configuration(_) => "CONFIGURATION",
            RegistryError::Storage(_) | RegistryError::Io(_) => "UNKNOWN",
        }
    }

    /// Error body in the `{"errors": [{code, message}]}` shape.
    pub fn to_json(&self) -> serde_json::Value {
        let body = ErrorResponse {
            errors: vec![ErrorDetail {
                code: self.error_code(),
                message: self.to_string(),
            }],
        };
        serde_json::to_value(body).unwrap_or_default()
    }
}

#[derive(Debug, serde::Serialize)]
struct ErrorResponse {
    errors: Vec<ErrorDetail>,
}

#[derive(Debug, serde::Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}
