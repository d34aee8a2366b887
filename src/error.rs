use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PollError {
    #[error("{0}")]
    Network(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Live channel error: {0}")]
    PushChannel(String),

    #[error("Local storage error: {0}")]
    Storage(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type PollResult<T> = std::result::Result<T, PollError>;

impl From<reqwest::Error> for PollError {
    fn from(e: reqwest::Error) -> Self {
        PollError::Network(e.to_string())
    }
}

impl From<sqlx::Error> for PollError {
    fn from(e: sqlx::Error) -> Self {
        PollError::Storage(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for PollError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        PollError::PushChannel(e.to_string())
    }
}
