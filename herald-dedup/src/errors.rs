use thiserror::Error;

#[derive(Debug, Error)]
pub enum DedupError {
    #[error("dedup store unavailable: {0}")]
    Unavailable(String),
    #[error("dedup command failed for key '{key}': {message}")]
    Command { key: String, message: String },
    #[error("invalid dedup configuration: {0}")]
    Config(String),
}
