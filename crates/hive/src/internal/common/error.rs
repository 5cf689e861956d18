use thiserror::Error;

#[allow(clippy::enum_variant_names)]
#[derive(Debug, Error)]
pub enum DsError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Serialization error: {0}")]
    SerializationError(String),
    #[error("Validation error: {0}")]
    ValidationError(String),
    #[error("Error: {0}")]
    GenericError(String),
}

impl DsError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::ValidationError(message.into())
    }
}

impl From<serde_json::error::Error> for DsError {
    fn from(e: serde_json::error::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}
impl From<bincode::Error> for DsError {
    fn from(e: bincode::Error) -> Self {
        Self::SerializationError(e.to_string())
    }
}
impl From<String> for DsError {
    fn from(e: String) -> Self {
        Self::GenericError(e)
    }
}
impl From<&str> for DsError {
    fn from(e: &str) -> Self {
        Self::GenericError(e.to_string())
    }
}
