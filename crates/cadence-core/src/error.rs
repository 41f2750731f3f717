//! Error types for Cadence.

use crate::ids::ApplicationId;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Application errors
    #[error("Application not found: {0}")]
    ApplicationNotFound(ApplicationId),

    #[error("Application already exists: {0}")]
    ApplicationExists(ApplicationId),

    #[error("Invalid application id: {0}")]
    InvalidApplicationId(String),

    // Deployment model errors
    #[error("Unknown job type: {0}")]
    UnknownJobType(String),

    #[error("Invalid version: {0}")]
    InvalidVersion(String),

    #[error("Invalid deployment spec: {0}")]
    InvalidDeploymentSpec(String),

    // Collaborator errors
    #[error("Version feed error: {0}")]
    VersionFeed(String),

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
