use thiserror::Error;

#[derive(Error, Debug)]
pub enum NetLoggerError {
    #[error("IO operation failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("Regex error: {0}")]
    Regex(#[from] regex::Error),

    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Unknown provider: {0}")]
    UnknownProvider(String),

    #[error("No server matched id {0}")]
    ServerNotFound(u64),

    #[error("Measurement failed: {0}")]
    Measurement(String),

    #[error("{0}")]
    Custom(String),
}

pub type Result<T> = std::result::Result<T, NetLoggerError>;
