//! Error types for distributed execution

use thiserror::Error;

/// Errors that can occur while building, wiring or running stage jobs
#[derive(Error, Debug)]
pub enum DistributedError {
    /// The placement scheduler has no worker to hand out
    #[error("No workers available to execute query")]
    NoWorkersAvailable,

    /// Worker not found in the registry
    #[error("Worker not found: {0}")]
    WorkerNotFound(String),

    /// Worker already registered
    #[error("Worker already registered: {0}")]
    WorkerAlreadyRegistered(String),

    /// No executor with this name lives on the worker
    #[error("Executor not found: {0}")]
    ExecutorNotFound(String),

    /// Logical plan cannot be lowered into stage jobs
    #[error("Distributed planning error: {0}")]
    PlanningError(String),

    /// Stage job failed validation
    #[error("Invalid stage job: {0}")]
    InvalidJob(String),

    /// Listen, dial, accept or resolve failure while wiring channels
    #[error("Channel setup error: {0}")]
    ChannelSetup(String),

    /// Peer answered a control request with an error
    #[error("Remote error: {0}")]
    Remote(String),

    /// Operator failed while the job was running
    #[error("Task execution failed: {0}")]
    TaskExecutionFailed(String),

    /// Frame header announced an impossible length
    #[error("Malformed frame: {0}")]
    MalformedFrame(String),

    /// Transport closed before the end-of-stream marker
    #[error("Stream truncated: {0}")]
    Truncated(String),

    /// Write attempted after the end-of-stream marker
    #[error("Stream already finished")]
    StreamFinished,

    /// Snappy compression failure
    #[error("Compression error: {0}")]
    Compression(String),

    /// Writer and reader disagree on the row schema
    #[error("Schema mismatch: {0}")]
    SchemaMismatch(String),

    /// The query was failed by the coordinator
    #[error("Query failed: {0}")]
    QueryFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Network communication error
    #[error("Network error: {0}")]
    NetworkError(#[from] std::io::Error),

    /// Query engine error
    #[error("Query engine error: {0}")]
    QueryError(#[from] query_core::QueryError),
}

impl From<snap::Error> for DistributedError {
    fn from(err: snap::Error) -> Self {
        DistributedError::Compression(err.to_string())
    }
}

/// Result type for distributed operations
pub type Result<T> = std::result::Result<T, DistributedError>;
