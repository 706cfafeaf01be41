//! Lowering of logical plans into placed stage job graphs
//!
//! The builder walks the logical plan bottom-up. Each node allocates one or
//! more executors from the [`PlacementScheduler`], appends the resulting
//! [`StageJob`]s to the graph and hands its output locations to the parent.
//! The root's outputs are gathered by a synthetic aggregate sink the
//! coordinator reads the final result from.

use crate::error::{DistributedError, Result};
use crate::job::{JobKind, PartitionInfo, SortKey, StageJob};
use crate::scheduler::PlacementScheduler;
use crate::types::{Location, TaskId};
use query_core::{Schema, Value};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use tracing::{debug, info};

/// Contract the stage graph builder needs from a logical plan node
pub trait LogicalNode {
    /// Node kind with its lowering parameters
    fn kind(&self) -> &PlanNodeKind;

    /// Child nodes, left to right
    fn inputs(&self) -> Vec<&dyn LogicalNode>;

    /// Schema of the rows this node produces
    fn metadata(&self) -> &Schema;

    fn set_metadata(&mut self, schema: Schema);

    /// Serialized operator body handed to the node's jobs untouched
    fn payload(&self) -> &[u8];
}

/// Logical node kinds understood by the builder
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanNodeKind {
    Scan(ScanNode),
    Select {
        #[serde(default)]
        distinct: bool,
    },
    Filter,
    GroupBy,
    AggregateLocal,
    AggregateGlobal,
    DistinctLocal,
    DistinctGlobal,
    OrderBy { keys: Vec<SortKey> },
    Join,
    HashJoin {
        left_keys: Vec<usize>,
        right_keys: Vec<usize>,
    },
    Union,
    Limit { count: usize },
    Show,
    Insert,
}

/// Table source of a scan
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScanNode {
    pub table: String,
    /// Partition column names; empty for unpartitioned tables
    #[serde(default)]
    pub partition_columns: Vec<String>,
    #[serde(default)]
    pub partitions: Vec<PartitionInfo>,
    /// Files of an unpartitioned table
    #[serde(default)]
    pub files: Vec<String>,
    /// Predicate over partition columns, evaluated before jobs are created
    #[serde(default)]
    pub partition_filter: Option<PartitionFilter>,
}

impl ScanNode {
    pub fn new(table: impl Into<String>) -> Self {
        Self {
            table: table.into(),
            partition_columns: vec![],
            partitions: vec![],
            files: vec![],
            partition_filter: None,
        }
    }

    pub fn with_files(mut self, files: Vec<String>) -> Self {
        self.files = files;
        self
    }

    pub fn with_partitions(mut self, columns: Vec<String>, partitions: Vec<PartitionInfo>) -> Self {
        self.partition_columns = columns;
        self.partitions = partitions;
        self
    }

    pub fn with_filter(mut self, filter: PartitionFilter) -> Self {
        self.partition_filter = Some(filter);
        self
    }

    /// Partitions that survive the partition filter
    fn pruned_partitions(&self) -> Result<Vec<PartitionInfo>> {
        let mut kept = Vec::with_capacity(self.partitions.len());
        for partition in &self.partitions {
            if partition.values.len() != self.partition_columns.len() {
                return Err(DistributedError::PlanningError(format!(
                    "partition of '{}' has {} values for {} partition columns",
                    self.table,
                    partition.values.len(),
                    self.partition_columns.len()
                )));
            }
            let keep = match &self.partition_filter {
                Some(filter) => filter.evaluate(&self.partition_columns, &partition.values)?,
                None => true,
            };
            if keep {
                kept.push(partition.clone());
            } else {
                debug!(table = %self.table, values = ?partition.values, "Pruned partition");
            }
        }
        Ok(kept)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompareOp {
    Eq,
    NotEq,
    Lt,
    LtEq,
    Gt,
    GtEq,
}

/// One `column <op> literal` comparison
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PartitionPredicate {
    pub column: String,
    pub op: CompareOp,
    pub value: Value,
}

/// Conjunction of comparisons over partition columns
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PartitionFilter {
    pub predicates: Vec<PartitionPredicate>,
}

impl PartitionFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn and(mut self, column: impl Into<String>, op: CompareOp, value: Value) -> Self {
        self.predicates.push(PartitionPredicate {
            column: column.into(),
            op,
            value,
        });
        self
    }

    /// Whether a partition with `values` may hold matching rows.
    ///
    /// A null on either side of a comparison drops the partition. Unknown
    /// columns and type mismatches are errors.
    pub fn evaluate(&self, columns: &[String], values: &[Value]) -> Result<bool> {
        for predicate in &self.predicates {
            let idx = columns
                .iter()
                .position(|c| c == &predicate.column)
                .ok_or_else(|| {
                    DistributedError::PlanningError(format!(
                        "partition filter references unknown column '{}'",
                        predicate.column
                    ))
                })?;
            let actual = &values[idx];
            if actual.is_null() || predicate.value.is_null() {
                return Ok(false);
            }
            if actual.data_type() != predicate.value.data_type() {
                return Err(DistributedError::PlanningError(format!(
                    "cannot compare partition column '{}' ({}) with {}",
                    predicate.column, actual, predicate.value
                )));
            }

            let ord = actual.total_cmp(&predicate.value);
            let pass = match predicate.op {
                CompareOp::Eq => ord == Ordering::Equal,
                CompareOp::NotEq => ord != Ordering::Equal,
                CompareOp::Lt => ord == Ordering::Less,
                CompareOp::LtEq => ord != Ordering::Greater,
                CompareOp::Gt => ord == Ordering::Greater,
                CompareOp::GtEq => ord != Ordering::Less,
            };
            if !pass {
                return Ok(false);
            }
        }
        Ok(true)
    }
}

/// Serializable logical plan tree
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanNode {
    pub kind: PlanNodeKind,
    #[serde(default)]
    pub inputs: Vec<PlanNode>,
    pub schema: Schema,
    #[serde(default)]
    pub payload: Vec<u8>,
}

impl PlanNode {
    pub fn new(kind: PlanNodeKind, inputs: Vec<PlanNode>, schema: Schema) -> Self {
        Self {
            kind,
            inputs,
            schema,
            payload: vec![],
        }
    }

    pub fn scan(scan: ScanNode, schema: Schema) -> Self {
        Self::new(PlanNodeKind::Scan(scan), vec![], schema)
    }

    /// Single-input node producing the same schema as its child
    pub fn unary(kind: PlanNodeKind, input: PlanNode) -> Self {
        let schema = input.schema.clone();
        Self::new(kind, vec![input], schema)
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }
}

impl LogicalNode for PlanNode {
    fn kind(&self) -> &PlanNodeKind {
        &self.kind
    }

    fn inputs(&self) -> Vec<&dyn LogicalNode> {
        self.inputs.iter().map(|n| n as &dyn LogicalNode).collect()
    }

    fn metadata(&self) -> &Schema {
        &self.schema
    }

    fn set_metadata(&mut self, schema: Schema) {
        self.schema = schema;
    }

    fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Placed job graph for one query
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageGraph {
    jobs: Vec<StageJob>,
    sink: usize,
}

impl StageGraph {
    /// Jobs in creation order; every job appears after its upstreams
    pub fn jobs(&self) -> &[StageJob] {
        &self.jobs
    }

    /// Terminal aggregate job the final result is read from
    pub fn sink(&self) -> &StageJob {
        &self.jobs[self.sink]
    }

    pub fn sink_output(&self) -> &Location {
        &self.sink().outputs[0]
    }

    pub fn job(&self, executor: &str) -> Option<&StageJob> {
        self.jobs.iter().find(|j| j.location.name == executor)
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

/// Lower `plan` into a placed stage graph.
///
/// Fails fast on the first error. Jobs appended before the failure are
/// dropped with the builder, so a failed build never yields a partial graph.
pub fn build_stage_graph(
    plan: &dyn LogicalNode,
    scheduler: &mut PlacementScheduler,
    parallelism: usize,
) -> Result<StageGraph> {
    if parallelism == 0 {
        return Err(DistributedError::PlanningError(
            "parallelism must be at least 1".to_string(),
        ));
    }
    if !scheduler.has_workers() {
        return Err(DistributedError::NoWorkersAvailable);
    }

    let mut builder = GraphBuilder {
        scheduler,
        parallelism,
        jobs: Vec::new(),
    };
    let outputs = builder.lower(plan)?;
    let sink = builder.push(
        JobKind::Aggregate,
        outputs,
        1,
        plan.metadata().clone(),
        Vec::new(),
    )?;

    info!(
        jobs = builder.jobs.len(),
        parallelism,
        sink = %builder.jobs[sink].location,
        "Built stage graph"
    );
    Ok(StageGraph {
        jobs: builder.jobs,
        sink,
    })
}

struct GraphBuilder<'a> {
    scheduler: &'a mut PlacementScheduler,
    parallelism: usize,
    jobs: Vec<StageJob>,
}

impl GraphBuilder<'_> {
    /// Place one job and return its index
    fn push(
        &mut self,
        kind: JobKind,
        inputs: Vec<Location>,
        outputs: usize,
        schema: Schema,
        payload: Vec<u8>,
    ) -> Result<usize> {
        let location = self.scheduler.allocate()?;
        let job = StageJob {
            task_id: TaskId::new(),
            outputs: (0..outputs).map(|i| location.with_channel(i)).collect(),
            location,
            kind,
            inputs,
            schema,
            payload,
        };
        job.validate()?;
        debug!(executor = %job.location.name, kind = %job.tag(), inputs = job.inputs.len(), outputs, "Placed stage job");
        self.jobs.push(job);
        Ok(self.jobs.len() - 1)
    }

    fn outputs_of(&self, idx: usize) -> Vec<Location> {
        self.jobs[idx].outputs.clone()
    }

    /// One single-output job per upstream location
    fn one_to_one(&mut self, kind: JobKind, upstream: Vec<Location>, node: &dyn LogicalNode) -> Result<Vec<Location>> {
        let mut outputs = Vec::with_capacity(upstream.len());
        for input in upstream {
            let idx = self.push(
                kind.clone(),
                vec![input],
                1,
                node.metadata().clone(),
                node.payload().to_vec(),
            )?;
            outputs.extend(self.outputs_of(idx));
        }
        Ok(outputs)
    }

    /// One job reading every upstream location
    fn fan_in(&mut self, kind: JobKind, upstream: Vec<Location>, node: &dyn LogicalNode) -> Result<Vec<Location>> {
        let idx = self.push(kind, upstream, 1, node.metadata().clone(), node.payload().to_vec())?;
        Ok(self.outputs_of(idx))
    }

    fn lower(&mut self, node: &dyn LogicalNode) -> Result<Vec<Location>> {
        let inputs = node.inputs();
        match node.kind() {
            PlanNodeKind::Scan(scan) => {
                expect_inputs(node, &inputs, 0)?;
                self.lower_scan(scan, node)
            }
            PlanNodeKind::Filter => {
                let upstream = self.lower_single(node, &inputs)?;
                self.one_to_one(JobKind::Filter, upstream, node)
            }
            PlanNodeKind::GroupBy => {
                let upstream = self.lower_single(node, &inputs)?;
                self.one_to_one(JobKind::GroupBy, upstream, node)
            }
            PlanNodeKind::AggregateLocal => {
                let upstream = self.lower_single(node, &inputs)?;
                self.one_to_one(JobKind::AggregateLocal, upstream, node)
            }
            PlanNodeKind::DistinctLocal => {
                let upstream = self.lower_single(node, &inputs)?;
                self.one_to_one(JobKind::DistinctLocal, upstream, node)
            }
            PlanNodeKind::Select { distinct } => {
                let upstream = self.lower_single(node, &inputs)?;
                if !distinct {
                    return self.one_to_one(JobKind::Select, upstream, node);
                }
                // DISTINCT needs every row in one place
                let gathered = if upstream.len() > 1 {
                    let idx = self.push(
                        JobKind::Aggregate,
                        upstream,
                        1,
                        inputs[0].metadata().clone(),
                        Vec::new(),
                    )?;
                    self.outputs_of(idx)
                } else {
                    upstream
                };
                self.fan_in(JobKind::Select, gathered, node)
            }
            PlanNodeKind::AggregateGlobal => {
                let upstream = self.lower_single(node, &inputs)?;
                self.fan_in(JobKind::AggregateGlobal, upstream, node)
            }
            PlanNodeKind::DistinctGlobal => {
                let upstream = self.lower_single(node, &inputs)?;
                self.fan_in(JobKind::DistinctGlobal, upstream, node)
            }
            PlanNodeKind::Show => {
                let upstream = self.lower_single(node, &inputs)?;
                self.fan_in(JobKind::Show, upstream, node)
            }
            PlanNodeKind::Insert => {
                let upstream = self.lower_single(node, &inputs)?;
                self.fan_in(JobKind::Insert, upstream, node)
            }
            PlanNodeKind::OrderBy { keys } => {
                let upstream = self.lower_single(node, &inputs)?;
                let sorted = self.one_to_one(JobKind::OrderByLocal { keys: keys.clone() }, upstream, node)?;
                self.fan_in(JobKind::OrderByGlobal { keys: keys.clone() }, sorted, node)
            }
            PlanNodeKind::Limit { count } => {
                let upstream = self.lower_single(node, &inputs)?;
                let local = self.one_to_one(JobKind::Limit { count: *count }, upstream, node)?;
                self.fan_in(JobKind::Limit { count: *count }, local, node)
            }
            PlanNodeKind::Join => {
                expect_inputs(node, &inputs, 2)?;
                self.lower_join(node, inputs[0], inputs[1])
            }
            PlanNodeKind::HashJoin {
                left_keys,
                right_keys,
            } => {
                expect_inputs(node, &inputs, 2)?;
                self.lower_hash_join(node, inputs[0], inputs[1], left_keys, right_keys)
            }
            PlanNodeKind::Union => {
                expect_inputs(node, &inputs, 2)?;
                let left = self.lower(inputs[0])?;
                let right = self.lower(inputs[1])?;
                if left.len() == right.len() {
                    let mut outputs = Vec::with_capacity(left.len());
                    for (l, r) in left.into_iter().zip(right) {
                        let idx = self.push(
                            JobKind::Union,
                            vec![l, r],
                            1,
                            node.metadata().clone(),
                            node.payload().to_vec(),
                        )?;
                        outputs.extend(self.outputs_of(idx));
                    }
                    Ok(outputs)
                } else {
                    let all = left.into_iter().chain(right).collect();
                    self.fan_in(JobKind::Union, all, node)
                }
            }
        }
    }

    fn lower_single(&mut self, node: &dyn LogicalNode, inputs: &[&dyn LogicalNode]) -> Result<Vec<Location>> {
        expect_inputs(node, inputs, 1)?;
        self.lower(inputs[0])
    }

    fn lower_scan(&mut self, scan: &ScanNode, node: &dyn LogicalNode) -> Result<Vec<Location>> {
        let mut partitions = vec![Vec::new(); self.parallelism];
        let mut files = vec![Vec::new(); self.parallelism];

        if scan.partition_columns.is_empty() {
            for (i, file) in scan.files.iter().enumerate() {
                files[i % self.parallelism].push(file.clone());
            }
        } else {
            for (i, partition) in scan.pruned_partitions()?.into_iter().enumerate() {
                partitions[i % self.parallelism].push(partition);
            }
        }

        let mut outputs = Vec::with_capacity(self.parallelism);
        for (partitions, files) in partitions.into_iter().zip(files) {
            let kind = JobKind::Scan {
                table: scan.table.clone(),
                partitions,
                files,
            };
            let idx = self.push(kind, vec![], 1, node.metadata().clone(), node.payload().to_vec())?;
            outputs.extend(self.outputs_of(idx));
        }
        Ok(outputs)
    }

    fn lower_join(
        &mut self,
        node: &dyn LogicalNode,
        left_node: &dyn LogicalNode,
        right_node: &dyn LogicalNode,
    ) -> Result<Vec<Location>> {
        let mut left = self.lower(left_node)?;
        let right = self.lower(right_node)?;

        if left.len() == 1 && self.parallelism > 1 {
            let idx = self.push(
                JobKind::Balance,
                left,
                self.parallelism,
                left_node.metadata().clone(),
                Vec::new(),
            )?;
            left = self.outputs_of(idx);
        }

        let dup = self.push(
            JobKind::Duplicate,
            right,
            left.len(),
            right_node.metadata().clone(),
            Vec::new(),
        )?;
        let broadcast = self.outputs_of(dup);

        let mut outputs = Vec::with_capacity(left.len());
        for (l, r) in left.into_iter().zip(broadcast) {
            let idx = self.push(
                JobKind::Join { left_inputs: 1 },
                vec![l, r],
                1,
                node.metadata().clone(),
                node.payload().to_vec(),
            )?;
            outputs.extend(self.outputs_of(idx));
        }
        Ok(outputs)
    }

    fn lower_hash_join(
        &mut self,
        node: &dyn LogicalNode,
        left_node: &dyn LogicalNode,
        right_node: &dyn LogicalNode,
        left_keys: &[usize],
        right_keys: &[usize],
    ) -> Result<Vec<Location>> {
        let left = self.lower(left_node)?;
        let right = self.lower(right_node)?;
        let left_shuffles = self.shuffle(left, left_node, left_keys)?;
        let right_shuffles = self.shuffle(right, right_node, right_keys)?;

        let mut outputs = Vec::with_capacity(self.parallelism);
        for i in 0..self.parallelism {
            let inputs: Vec<Location> = left_shuffles
                .iter()
                .chain(&right_shuffles)
                .map(|&idx| self.jobs[idx].outputs[i].clone())
                .collect();
            let kind = JobKind::HashJoin {
                left_inputs: left_shuffles.len(),
                left_keys: left_keys.to_vec(),
                right_keys: right_keys.to_vec(),
            };
            let idx = self.push(kind, inputs, 1, node.metadata().clone(), node.payload().to_vec())?;
            outputs.extend(self.outputs_of(idx));
        }
        Ok(outputs)
    }

    /// One shuffle job per upstream location, each with `parallelism` outputs
    fn shuffle(&mut self, upstream: Vec<Location>, side: &dyn LogicalNode, keys: &[usize]) -> Result<Vec<usize>> {
        let mut shuffles = Vec::with_capacity(upstream.len());
        for input in upstream {
            shuffles.push(self.push(
                JobKind::Shuffle {
                    key_columns: keys.to_vec(),
                },
                vec![input],
                self.parallelism,
                side.metadata().clone(),
                Vec::new(),
            )?);
        }
        Ok(shuffles)
    }
}

fn expect_inputs(node: &dyn LogicalNode, inputs: &[&dyn LogicalNode], expected: usize) -> Result<()> {
    if inputs.len() != expected {
        return Err(DistributedError::PlanningError(format!(
            "{:?} node expects {} inputs, got {}",
            node.kind(),
            expected,
            inputs.len()
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobTag;
    use crate::types::WorkerInfo;
    use query_core::{DataType, Field};
    use std::collections::HashSet;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ])
    }

    fn scheduler(n: usize) -> PlacementScheduler {
        PlacementScheduler::new(
            (0..n)
                .map(|i| WorkerInfo::new(format!("w{}", i), "127.0.0.1", 7000 + i as u16, 0))
                .collect(),
        )
    }

    fn table(name: &str, files: usize) -> PlanNode {
        let files = (0..files).map(|i| format!("{}-{}.csv", name, i)).collect();
        PlanNode::scan(ScanNode::new(name).with_files(files), schema())
    }

    fn count(graph: &StageGraph, tag: JobTag) -> usize {
        graph.jobs().iter().filter(|j| j.tag() == tag).count()
    }

    #[test]
    fn test_partitioned_scan_splits_disjointly() {
        let scan = ScanNode::new("events").with_partitions(
            vec!["day".to_string()],
            vec![
                PartitionInfo::new(vec![Value::Int32(1)], vec!["d1.csv".to_string()]),
                PartitionInfo::new(vec![Value::Int32(2)], vec!["d2.csv".to_string()]),
            ],
        );
        let plan = PlanNode::scan(scan, schema());
        let graph = build_stage_graph(&plan, &mut scheduler(2), 2).unwrap();

        assert_eq!(count(&graph, JobTag::Scan), 2);
        let mut seen = HashSet::new();
        for job in graph.jobs().iter().filter(|j| j.tag() == JobTag::Scan) {
            if let JobKind::Scan { partitions, .. } = &job.kind {
                assert_eq!(partitions.len(), 1);
                for p in partitions {
                    assert!(seen.insert(p.files.clone()));
                }
            }
        }
        assert_eq!(graph.sink().tag(), JobTag::Aggregate);
        assert_eq!(graph.sink().inputs.len(), 2);
    }

    #[test]
    fn test_partition_filter_prunes_and_errors() {
        let partitions: Vec<PartitionInfo> = (1..=4)
            .map(|d| PartitionInfo::new(vec![Value::Int32(d)], vec![format!("d{}.csv", d)]))
            .collect();
        let scan = ScanNode::new("events")
            .with_partitions(vec!["day".to_string()], partitions.clone())
            .with_filter(PartitionFilter::new().and("day", CompareOp::GtEq, Value::Int32(3)));
        let graph = build_stage_graph(&PlanNode::scan(scan, schema()), &mut scheduler(1), 2).unwrap();
        let kept: usize = graph
            .jobs()
            .iter()
            .map(|j| match &j.kind {
                JobKind::Scan { partitions, .. } => partitions.len(),
                _ => 0,
            })
            .sum();
        assert_eq!(kept, 2);

        let bad = ScanNode::new("events")
            .with_partitions(vec!["day".to_string()], partitions)
            .with_filter(PartitionFilter::new().and("day", CompareOp::Eq, Value::Utf8("x".into())));
        assert!(build_stage_graph(&PlanNode::scan(bad, schema()), &mut scheduler(1), 2).is_err());
    }

    #[test]
    fn test_hash_join_pairs_shuffle_channels() {
        let plan = PlanNode::new(
            PlanNodeKind::HashJoin {
                left_keys: vec![0],
                right_keys: vec![0],
            },
            vec![table("a", 3), table("b", 3)],
            schema(),
        );
        let graph = build_stage_graph(&plan, &mut scheduler(4), 3).unwrap();

        assert_eq!(count(&graph, JobTag::Shuffle), 6);
        assert_eq!(count(&graph, JobTag::HashJoin), 3);

        let joins: Vec<&StageJob> = graph.jobs().iter().filter(|j| j.tag() == JobTag::HashJoin).collect();
        for (i, join) in joins.iter().enumerate() {
            let (left, right) = join.input_groups();
            assert_eq!(left.len(), 3);
            assert_eq!(right.len(), 3);
            for input in join.inputs.iter() {
                assert_eq!(input.channel_index, i);
                assert_eq!(graph.job(&input.name).unwrap().tag(), JobTag::Shuffle);
            }
        }
    }

    #[test]
    fn test_order_by_two_phase() {
        let plan = PlanNode::unary(
            PlanNodeKind::OrderBy {
                keys: vec![SortKey::asc(0)],
            },
            table("t", 8),
        );
        let graph = build_stage_graph(&plan, &mut scheduler(3), 4).unwrap();
        assert_eq!(count(&graph, JobTag::OrderByLocal), 4);
        assert_eq!(count(&graph, JobTag::OrderByGlobal), 1);

        let merge = graph.jobs().iter().find(|j| j.tag() == JobTag::OrderByGlobal).unwrap();
        assert_eq!(merge.inputs.len(), 4);
        for input in &merge.inputs {
            assert_eq!(graph.job(&input.name).unwrap().tag(), JobTag::OrderByLocal);
        }
    }

    #[test]
    fn test_nested_loop_join_broadcasts_right() {
        let plan = PlanNode::new(PlanNodeKind::Join, vec![table("a", 2), table("b", 2)], schema());
        let graph = build_stage_graph(&plan, &mut scheduler(2), 3).unwrap();

        let dup = graph.jobs().iter().find(|j| j.tag() == JobTag::Duplicate).unwrap();
        assert_eq!(dup.inputs.len(), 3);
        assert_eq!(dup.outputs.len(), 3);
        assert_eq!(count(&graph, JobTag::Join), 3);
        assert_eq!(count(&graph, JobTag::Balance), 0);

        for join in graph.jobs().iter().filter(|j| j.tag() == JobTag::Join) {
            assert_eq!(join.inputs[1].name, dup.location.name);
        }
    }

    #[test]
    fn test_join_balances_single_left_instance() {
        let left = PlanNode::unary(PlanNodeKind::AggregateGlobal, table("a", 1));
        let plan = PlanNode::new(PlanNodeKind::Join, vec![left, table("b", 1)], schema());
        let graph = build_stage_graph(&plan, &mut scheduler(2), 2).unwrap();
        let balance = graph.jobs().iter().find(|j| j.tag() == JobTag::Balance).unwrap();
        assert_eq!(balance.outputs.len(), 2);
        assert_eq!(count(&graph, JobTag::Join), 2);
    }

    #[test]
    fn test_select_distinct_gathers_first() {
        let plan = PlanNode::unary(PlanNodeKind::Select { distinct: true }, table("t", 2));
        let graph = build_stage_graph(&plan, &mut scheduler(2), 2).unwrap();
        let select = graph.jobs().iter().find(|j| j.tag() == JobTag::Select).unwrap();
        assert_eq!(select.inputs.len(), 1);
        assert_eq!(graph.job(&select.inputs[0].name).unwrap().tag(), JobTag::Aggregate);

        let single = PlanNode::unary(PlanNodeKind::Select { distinct: true }, table("t", 1));
        let graph = build_stage_graph(&single, &mut scheduler(2), 1).unwrap();
        assert_eq!(count(&graph, JobTag::Aggregate), 1);
    }

    #[test]
    fn test_union_and_limit_shapes() {
        let union = PlanNode::new(PlanNodeKind::Union, vec![table("a", 2), table("b", 2)], schema());
        let graph = build_stage_graph(&union, &mut scheduler(2), 2).unwrap();
        assert_eq!(count(&graph, JobTag::Union), 2);

        let limit = PlanNode::unary(PlanNodeKind::Limit { count: 10 }, table("a", 2));
        let graph = build_stage_graph(&limit, &mut scheduler(2), 2).unwrap();
        assert_eq!(count(&graph, JobTag::Limit), 3);
    }

    #[test]
    fn test_build_errors() {
        let plan = table("t", 1);
        assert!(matches!(
            build_stage_graph(&plan, &mut scheduler(0), 2),
            Err(DistributedError::NoWorkersAvailable)
        ));
        assert!(build_stage_graph(&plan, &mut scheduler(1), 0).is_err());

        let join = PlanNode::new(PlanNodeKind::Join, vec![table("a", 1)], schema());
        assert!(matches!(
            build_stage_graph(&join, &mut scheduler(1), 2),
            Err(DistributedError::PlanningError(_))
        ));
    }

    #[test]
    fn test_placement_is_balanced() {
        let plan = PlanNode::unary(PlanNodeKind::Filter, table("t", 4));
        let mut sched = scheduler(3);
        let graph = build_stage_graph(&plan, &mut sched, 4).unwrap();
        assert_eq!(graph.len(), 9);
        let counts: Vec<usize> = sched.assigned_counts().into_iter().map(|(_, n)| n).collect();
        assert_eq!(counts, vec![3, 3, 3]);
    }

    #[test]
    fn test_set_metadata() {
        let mut node = table("t", 1);
        node.set_metadata(Schema::empty());
        assert_eq!(node.metadata().num_columns(), 0);
    }

    #[test]
    fn test_plan_json() {
        let json = r#"{
            "kind": {"type": "order_by", "keys": [{"column": 0, "ascending": false}]},
            "schema": {"fields": [{"name": "id", "data_type": "Int64", "nullable": false}]},
            "inputs": [{
                "kind": {"type": "scan", "table": "t", "files": ["a.csv", "b.csv"]},
                "schema": {"fields": [{"name": "id", "data_type": "Int64", "nullable": false}]}
            }]
        }"#;
        let plan: PlanNode = serde_json::from_str(json).unwrap();
        assert_eq!(plan.inputs.len(), 1);
        assert!(matches!(plan.kind, PlanNodeKind::OrderBy { .. }));
    }
}
