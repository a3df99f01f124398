use thiserror::Error;

/// Canonical result for core.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Structural problems in the specification (duplicate names, cycles).
    /// Always fatal for the whole request.
    #[error("Malformed specification: {0}")]
    MalformedSpec(String),

    #[error("Dataset not found: {0}")]
    NotFound(String),

    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Planning error: {0}")]
    Plan(String),

    #[error("Expression error: {0}")]
    Expression(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Plan(e.to_string())
    }
}
