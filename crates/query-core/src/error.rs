use thiserror::Error;

#[derive(Error, Debug)]
pub enum QueryError {
    #[error("Schema error: {0}")]
    SchemaError(String),

    #[error("Type mismatch: expected {expected}, found {found}")]
    TypeMismatch { expected: String, found: String },

    #[error("Column not found: {0}")]
    ColumnNotFound(String),

    #[error("Arity mismatch: expected {expected} columns, found {found}")]
    ArityMismatch { expected: usize, found: usize },

    #[error("Decode error: {0}")]
    DecodeError(String),

    #[error("Execution error: {0}")]
    ExecutionError(String),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, QueryError>;
