//! Core types for distributed execution

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a query
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueryId(pub Uuid);

impl QueryId {
    /// Create a new random query ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for QueryId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for QueryId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "query-{}", &self.0.to_string()[..8])
    }
}

/// Unique identifier for one placed stage job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId(pub Uuid);

impl TaskId {
    /// Create a new random task ID
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for TaskId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "task-{}", &self.0.to_string()[..8])
    }
}

/// Addressable endpoint of one executor output.
///
/// `name` is unique per stage-job instance; several executors may share a
/// host and control port when they live on the same worker.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    /// Executor name
    pub name: String,
    /// Host the executor's worker runs on
    pub host: String,
    /// Worker control-plane port
    pub control_port: u16,
    /// Data-plane port (resolved at writer setup time)
    pub data_port: u16,
    /// Output channel index on the executor
    pub channel_index: usize,
}

impl Location {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        control_port: u16,
        data_port: u16,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            control_port,
            data_port,
            channel_index: 0,
        }
    }

    /// Same executor, different output channel
    pub fn with_channel(&self, channel_index: usize) -> Self {
        Self {
            channel_index,
            ..self.clone()
        }
    }

    /// `host:control_port`
    pub fn control_addr(&self) -> String {
        format!("{}:{}", self.host, self.control_port)
    }

    /// `host:data_port`
    pub fn data_addr(&self) -> String {
        format!("{}:{}", self.host, self.data_port)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}@{}:{}/{}#{}",
            self.name, self.host, self.control_port, self.data_port, self.channel_index
        )
    }
}

/// Worker registry entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// Unique worker name
    pub name: String,
    /// Host the worker is reachable on
    pub host: String,
    /// Control-plane port
    pub control_port: u16,
    /// Advertised data-plane port
    pub data_port: u16,
}

impl WorkerInfo {
    /// Create new worker info
    pub fn new(name: impl Into<String>, host: impl Into<String>, control_port: u16, data_port: u16) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            control_port,
            data_port,
        }
    }

    /// Location of a fresh executor named `executor` on this worker
    pub fn executor_location(&self, executor: impl Into<String>) -> Location {
        Location::new(executor, self.host.clone(), self.control_port, self.data_port)
    }
}

/// Lifecycle status of one executor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    /// Constructed, not running yet
    Todo,
    /// Operator loop is running
    Running,
    /// Finished and every output was delivered
    Succeed,
    /// First operator error latched
    Error,
}

impl JobStatus {
    /// Terminal states never change again
    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Succeed | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Todo => write!(f, "TODO"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Succeed => write!(f, "SUCCEED"),
            JobStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Severity of an executor log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LogLevel {
    Info,
    Warn,
    Error,
}

/// One structured executor log message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Unix millis
    pub timestamp_ms: u64,
    pub level: LogLevel,
    pub message: String,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp_ms: now_millis(),
            level,
            message: message.into(),
        }
    }
}

/// Get current time in milliseconds
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Heartbeat cadence
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HeartbeatConfig {
    /// Fast tick: send only when the status is dirty
    pub fast_interval_ms: u64,
    /// Slow tick: send unconditionally
    pub interval_ms: u64,
    /// Delay before reconnecting a broken heartbeat stream
    pub retry_backoff_ms: u64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            fast_interval_ms: 100,
            interval_ms: 3000,
            retry_backoff_ms: 1000,
        }
    }
}

/// Runtime configuration shipped with every stage job
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Query the job belongs to
    pub query_id: QueryId,
    /// Rows buffered per column before a batch is flushed
    pub flush_threshold: usize,
    /// Capacity of the in-memory pipe between operator and socket
    pub pipe_capacity: usize,
    /// Largest accepted frame payload in bytes
    pub max_message_size: usize,
    /// Coordinator heartbeat address (`host:port`), if any
    pub coordinator: Option<String>,
    /// Heartbeat cadence
    pub heartbeat: HeartbeatConfig,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            query_id: QueryId::new(),
            flush_threshold: 8192,
            pipe_capacity: 64 * 1024,
            max_message_size: 64 * 1024 * 1024, // 64 MB
            coordinator: None,
            heartbeat: HeartbeatConfig::default(),
        }
    }
}

/// Configuration for the coordinator
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// A non-terminal job silent for this long fails its query
    pub heartbeat_timeout_ms: u64,
    /// Parallelism used when the caller does not pick one
    pub default_parallelism: usize,
    /// How often result fetching re-checks job reports
    pub status_poll_interval_ms: u64,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            heartbeat_timeout_ms: 15000, // 15 seconds
            default_parallelism: 4,
            status_poll_interval_ms: 100,
        }
    }
}
