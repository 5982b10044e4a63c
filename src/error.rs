//! Error handling for the trafficwatch pipeline

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

/// Error types
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Video source failure that the source task cannot recover from
    #[error("Source error: {0}")]
    Source(String),

    /// Scoring collaborator failure
    #[error("Scoring error: {0}")]
    Scoring(String),

    /// Session lifecycle error
    #[error("Session error: {0}")]
    Session(String),

    /// Config error
    #[error("Config error: {0}")]
    Config(String),

    /// Pipeline runtime error
    #[error("Runtime error: {0}")]
    Runtime(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
