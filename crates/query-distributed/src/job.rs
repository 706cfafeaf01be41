//! Stage job descriptors shipped from the coordinator to executors

use crate::error::{DistributedError, Result};
use crate::types::{Location, TaskId};
use query_core::{Schema, Value};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One partition of a partitioned table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionInfo {
    /// Partition column values, in the table's partition column order
    pub values: Vec<Value>,
    /// Files holding the partition's rows
    pub files: Vec<String>,
}

impl PartitionInfo {
    pub fn new(values: Vec<Value>, files: Vec<String>) -> Self {
        Self { values, files }
    }
}

/// Sort key over a value column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SortKey {
    pub column: usize,
    pub ascending: bool,
}

impl SortKey {
    pub fn asc(column: usize) -> Self {
        Self {
            column,
            ascending: true,
        }
    }

    pub fn desc(column: usize) -> Self {
        Self {
            column,
            ascending: false,
        }
    }
}

/// What a stage job does, with the parameters the runtime needs.
///
/// Column indices always refer to value columns of the job's input schema.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobKind {
    /// Read a slice of a table
    Scan {
        table: String,
        partitions: Vec<PartitionInfo>,
        files: Vec<String>,
    },
    Select,
    Filter,
    GroupBy,
    AggregateLocal,
    AggregateGlobal,
    Show,
    Insert,
    /// Hash-partition rows across every output on value columns `key_columns`
    Shuffle { key_columns: Vec<usize> },
    /// Copy every row to every output
    Duplicate,
    /// Round-robin rows across outputs
    Balance,
    Union,
    /// Concatenate every input into one stream
    Aggregate,
    /// Nested-loop join; the first `left_inputs` inputs are the left side
    Join { left_inputs: usize },
    /// Hash join over shuffled inputs; the first `left_inputs` inputs are the
    /// left side
    HashJoin {
        left_inputs: usize,
        left_keys: Vec<usize>,
        right_keys: Vec<usize>,
    },
    OrderByLocal { keys: Vec<SortKey> },
    /// Streaming k-way merge of sorted inputs
    OrderByGlobal { keys: Vec<SortKey> },
    DistinctLocal,
    DistinctGlobal,
    Limit { count: usize },
}

/// Fieldless job kind used to look up operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum JobTag {
    Scan,
    Select,
    Filter,
    GroupBy,
    AggregateLocal,
    AggregateGlobal,
    Show,
    Insert,
    Shuffle,
    Duplicate,
    Balance,
    Union,
    Aggregate,
    Join,
    HashJoin,
    OrderByLocal,
    OrderByGlobal,
    DistinctLocal,
    DistinctGlobal,
    Limit,
}

impl JobKind {
    pub fn tag(&self) -> JobTag {
        match self {
            JobKind::Scan { .. } => JobTag::Scan,
            JobKind::Select => JobTag::Select,
            JobKind::Filter => JobTag::Filter,
            JobKind::GroupBy => JobTag::GroupBy,
            JobKind::AggregateLocal => JobTag::AggregateLocal,
            JobKind::AggregateGlobal => JobTag::AggregateGlobal,
            JobKind::Show => JobTag::Show,
            JobKind::Insert => JobTag::Insert,
            JobKind::Shuffle { .. } => JobTag::Shuffle,
            JobKind::Duplicate => JobTag::Duplicate,
            JobKind::Balance => JobTag::Balance,
            JobKind::Union => JobTag::Union,
            JobKind::Aggregate => JobTag::Aggregate,
            JobKind::Join { .. } => JobTag::Join,
            JobKind::HashJoin { .. } => JobTag::HashJoin,
            JobKind::OrderByLocal { .. } => JobTag::OrderByLocal,
            JobKind::OrderByGlobal { .. } => JobTag::OrderByGlobal,
            JobKind::DistinctLocal => JobTag::DistinctLocal,
            JobKind::DistinctGlobal => JobTag::DistinctGlobal,
            JobKind::Limit { .. } => JobTag::Limit,
        }
    }
}

impl fmt::Display for JobTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobTag::Scan => "scan",
            JobTag::Select => "select",
            JobTag::Filter => "filter",
            JobTag::GroupBy => "group-by",
            JobTag::AggregateLocal => "aggregate-local",
            JobTag::AggregateGlobal => "aggregate-global",
            JobTag::Show => "show",
            JobTag::Insert => "insert",
            JobTag::Shuffle => "shuffle",
            JobTag::Duplicate => "duplicate",
            JobTag::Balance => "balance",
            JobTag::Union => "union",
            JobTag::Aggregate => "aggregate",
            JobTag::Join => "join",
            JobTag::HashJoin => "hash-join",
            JobTag::OrderByLocal => "order-by-local",
            JobTag::OrderByGlobal => "order-by-global",
            JobTag::DistinctLocal => "distinct-local",
            JobTag::DistinctGlobal => "distinct-global",
            JobTag::Limit => "limit",
        };
        write!(f, "{}", name)
    }
}

/// A placed, physical unit of query execution
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageJob {
    pub task_id: TaskId,
    /// Executor the job runs on
    pub location: Location,
    pub kind: JobKind,
    /// Upstream outputs, in the order the operator consumes them
    pub inputs: Vec<Location>,
    /// This job's outputs; output `i` is `location.with_channel(i)`
    pub outputs: Vec<Location>,
    /// Schema of the rows this job emits
    pub schema: Schema,
    /// Operator body, opaque to the runtime
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl StageJob {
    pub fn tag(&self) -> JobTag {
        self.kind.tag()
    }

    /// Split join inputs into their left and right groups
    pub fn input_groups(&self) -> (&[Location], &[Location]) {
        let left = match &self.kind {
            JobKind::Join { left_inputs } | JobKind::HashJoin { left_inputs, .. } => {
                (*left_inputs).min(self.inputs.len())
            }
            _ => self.inputs.len(),
        };
        self.inputs.split_at(left)
    }

    /// Check the structural invariants of the job
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| DistributedError::InvalidJob(format!("{}: {}", self.location.name, msg));

        if self.outputs.is_empty() {
            return Err(invalid("job has no outputs".to_string()));
        }
        for (i, output) in self.outputs.iter().enumerate() {
            if output.name != self.location.name || output.channel_index != i {
                return Err(invalid(format!("output {} points at {}", i, output)));
            }
        }

        match &self.kind {
            JobKind::Scan { .. } => {
                if !self.inputs.is_empty() {
                    return Err(invalid("scan takes no inputs".to_string()));
                }
            }
            JobKind::Join { left_inputs } => {
                self.check_two_groups(*left_inputs).map_err(invalid)?;
            }
            JobKind::HashJoin {
                left_inputs,
                left_keys,
                right_keys,
            } => {
                self.check_two_groups(*left_inputs).map_err(invalid)?;
                if left_keys.is_empty() || left_keys.len() != right_keys.len() {
                    return Err(invalid(format!(
                        "join keys do not pair up ({} left, {} right)",
                        left_keys.len(),
                        right_keys.len()
                    )));
                }
            }
            other => {
                if self.inputs.is_empty() {
                    return Err(invalid(format!("{} needs at least one input", other.tag())));
                }
            }
        }

        match &self.kind {
            JobKind::OrderByLocal { keys } | JobKind::OrderByGlobal { keys } => {
                if keys.is_empty() {
                    return Err(invalid("order-by without sort keys".to_string()));
                }
                let columns: Vec<usize> = keys.iter().map(|k| k.column).collect();
                self.schema.check_columns(&columns)?;
            }
            JobKind::Shuffle { key_columns } => {
                self.schema.check_columns(key_columns)?;
            }
            _ => {}
        }
        Ok(())
    }

    fn check_two_groups(&self, left_inputs: usize) -> std::result::Result<(), String> {
        if left_inputs == 0 || left_inputs >= self.inputs.len() {
            return Err(format!(
                "join needs two non-empty input groups, got {} of {} inputs on the left",
                left_inputs,
                self.inputs.len()
            ));
        }
        Ok(())
    }
}
