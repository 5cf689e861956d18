use thiserror::Error;

/// Errors of the server, the client connection and the journal.
/// `InvalidRequest` is caused by the client and is sent back to it, the rest is logged.
#[derive(Debug, Error)]
pub enum TaskhiveError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Engine(#[from] hive::Error),
    /// Encoding or decoding of a message, a journal record or a configuration file failed
    #[error("Cannot {direction} {what}: {message}")]
    Codec {
        direction: &'static str,
        what: &'static str,
        message: String,
    },
    #[error("Journal was written by version {found}, this is version {expected}")]
    IncompatibleJournal { found: String, expected: String },
    #[error("Journal error: {0}")]
    Journal(String),
    #[error("Invalid request: {0}")]
    InvalidRequest(String),
    /// A job or task is not in a state that allows the operation
    #[error("Invalid state: {0}")]
    InvalidState(String),
    #[error("{0}")]
    Generic(String),
}

impl TaskhiveError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Self::InvalidState(message.into())
    }

    pub fn journal(message: impl std::fmt::Display) -> Self {
        Self::Journal(message.to_string())
    }

    pub fn is_client_error(&self) -> bool {
        matches!(self, Self::InvalidRequest(_))
    }
}

impl From<serde_json::Error> for TaskhiveError {
    fn from(error: serde_json::Error) -> Self {
        Self::Codec {
            direction: if error.is_data() || error.is_syntax() || error.is_eof() {
                "decode"
            } else {
                "encode"
            },
            what: "JSON",
            message: error.to_string(),
        }
    }
}

impl From<bincode::Error> for TaskhiveError {
    fn from(error: bincode::Error) -> Self {
        Self::Codec {
            direction: "process",
            what: "binary data",
            message: error.to_string(),
        }
    }
}

impl From<toml::de::Error> for TaskhiveError {
    fn from(error: toml::de::Error) -> Self {
        Self::Codec {
            direction: "decode",
            what: "TOML",
            message: error.message().to_string(),
        }
    }
}

impl From<anyhow::Error> for TaskhiveError {
    fn from(error: anyhow::Error) -> Self {
        Self::Generic(format!("{error:#}"))
    }
}

impl From<String> for TaskhiveError {
    fn from(message: String) -> Self {
        Self::Generic(message)
    }
}

impl From<&str> for TaskhiveError {
    fn from(message: &str) -> Self {
        Self::Generic(message.to_string())
    }
}
