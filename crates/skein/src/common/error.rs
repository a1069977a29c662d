use thiserror::Error;

use crate::common::error::SkeinError::GenericError;
use crate::gateway::GatewayError;

#[derive(Debug, Error)]
pub enum SkeinError {
    #[error(transparent)]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Deserialization error: {0}")]
    DeserializationError(String),
    #[error("Cluster error: {0}")]
    GatewayError(#[from] GatewayError),
    #[error("Registration failed: {0}")]
    RegistrationError(String),
    #[error("Submission failed: {0}")]
    SubmissionError(String),
    #[error("Invalid job definition: {0}")]
    ConfigError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl From<serde_json::error::Error> for SkeinError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<bincode::Error> for SkeinError {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}

impl From<anyhow::Error> for SkeinError {
    fn from(error: anyhow::Error) -> Self {
        Self::GenericError(error.to_string())
    }
}

impl From<toml::de::Error> for SkeinError {
    fn from(error: toml::de::Error) -> Self {
        Self::DeserializationError(error.to_string())
    }
}

impl From<String> for SkeinError {
    fn from(e: String) -> Self {
        GenericError(e)
    }
}

pub fn config_error<T>(message: String) -> crate::Result<T> {
    Err(SkeinError::ConfigError(message))
}
