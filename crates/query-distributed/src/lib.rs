//! Distributed execution for Query Engine
//!
//! This crate lowers logical plans into placed stage-job graphs and runs them
//! across worker nodes, streaming columnar rows between jobs over TCP.
//!
//! # Architecture
//!
//! The distributed system consists of:
//! - **Coordinator**: registers workers, plans queries, dispatches jobs and
//!   tracks job reports delivered by heartbeats
//! - **Workers**: host one executor per stage job behind a control-plane listener
//! - **Executors**: run a stage operator between input and output channels
//! - **Wire protocol**: length-prefixed, Snappy-compressed frames carrying
//!   columnar row batches, terminated by an end-of-stream sentinel
//!
//! # Example
//!
//! ```ignore
//! use query_distributed::{ClusterConfig, Coordinator, RuntimeConfig, WorkerInfo};
//!
//! let coordinator = Coordinator::new(ClusterConfig::default());
//! coordinator.register_worker(WorkerInfo::new("worker0", "10.0.0.1", 7000, 7001))?;
//! coordinator.register_worker(WorkerInfo::new("worker1", "10.0.0.2", 7000, 7001))?;
//!
//! let rows = coordinator.execute(&plan, Some(4), &RuntimeConfig::default()).await?;
//! ```
//!
//! # Modules
//!
//! - [`wire`]: frame codec
//! - [`row_buffer`]: buffered columnar row streams
//! - [`scheduler`]: load-aware executor placement
//! - [`job`]: stage job model
//! - [`planner`]: logical plan to stage graph lowering
//! - [`operators`]: operator seam and built-in stage operators
//! - [`executor`]: per-job runtime and status latch
//! - [`channel`]: data-plane listeners and dialers
//! - [`heartbeat`]: executor status reporting
//! - [`network`]: control-plane messages
//! - [`worker`]: worker agent
//! - [`coordinator`]: coordinator node

pub mod channel;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod heartbeat;
pub mod job;
pub mod network;
pub mod operators;
pub mod planner;
pub mod row_buffer;
pub mod scheduler;
pub mod types;
pub mod wire;
pub mod worker;

// Re-exports
pub use coordinator::{Coordinator, JobReport, QueryStatus};
pub use error::{DistributedError, Result};
pub use executor::{Executor, ExecutorState, SharedState};
pub use heartbeat::Heartbeat;
pub use job::{JobKind, JobTag, PartitionInfo, SortKey, StageJob};
pub use network::{ControlRequest, ControlResponse, NetworkConfig};
pub use operators::{
    InputStream, OperatorRegistry, OutputStream, StageContext, StageOperator,
};
pub use planner::{
    build_stage_graph, CompareOp, LogicalNode, PartitionFilter, PlanNode, PlanNodeKind,
    ScanNode, StageGraph,
};
pub use row_buffer::{RowsReader, RowsWriter};
pub use scheduler::PlacementScheduler;
pub use types::*;
pub use wire::{Frame, FrameReader, FrameWriter};
pub use worker::Worker;
