//! Crate-wide error type.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("input not found: {0}")]
    InputNotFound(String),

    #[error("malformed query: {0}")]
    Malformed(String),

    #[error("schema mismatch: {0}")]
    SchemaMismatch(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("query execution failed: {0}")]
    QueryExecution(String),
}

impl From<csv::Error> for EngineError {
    fn from(err: csv::Error) -> Self {
        EngineError::SchemaMismatch(err.to_string())
    }
}

impl From<serde_json::Error> for EngineError {
    fn from(err: serde_json::Error) -> Self {
        EngineError::Malformed(err.to_string())
    }
}
