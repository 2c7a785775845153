use thiserror::Error;

/// Result type for collaboration transport operations
pub type CollabResult<T> = Result<T, CollabError>;

/// Errors that can occur in the collaboration transport
#[derive(Error, Debug)]
pub enum CollabError {
    #[error("Failed to connect to {url}: {source}")]
    Connect {
        url: String,
        #[source]
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Protocol error: {message}")]
    Protocol { message: String },

    #[error("Configuration error: {0}")]
    Config(#[from] envy::Error),

    #[error("Connection attempt cancelled by disconnect")]
    Cancelled,
}

impl CollabError {
    pub(crate) fn protocol(message: impl Into<String>) -> Self {
        Self::Protocol {
            message: message.into(),
        }
    }
}
